use colored::Colorize as _;
use log::Log as _;
use std::sync::Mutex;
use std::sync::OnceLock;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt as _;

static GLOBAL_LOGGER: OnceLock<GlobalLogger> = OnceLock::new();

/// Writes `log` records to stderr with severity coloring and forwards them
/// into the tracing framework, which carries the debug log file when phase
/// profiling is enabled.
pub struct GlobalLogger {
    stderr_level: Mutex<log::LevelFilter>,
    log_to_tracing: LogTracer,
}

/// Installs the global logger. `bigprofile` adds a trace file with phase
/// timings next to the current directory.
pub fn init(bigprofile: bool) -> &'static GlobalLogger {
    let subscriber = tracing_subscriber::registry().with(if bigprofile {
        let file = std::fs::File::create("git-surgeon-trace.log").ok();
        file.map(|file| {
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
        })
    } else {
        None
    });
    // A second init (e.g. in tests) keeps the first subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);

    let global_logger = GlobalLogger {
        stderr_level: Mutex::new(log::LevelFilter::Info),
        log_to_tracing: LogTracer::new(),
    };
    if GLOBAL_LOGGER.set(global_logger).is_err() {
        return GLOBAL_LOGGER.get().unwrap();
    }
    let global_logger = GLOBAL_LOGGER.get().unwrap();
    let _ = log::set_logger(global_logger);
    // Everything reaches the logger; stderr filtering happens there.
    log::set_max_level(log::LevelFilter::Trace);
    global_logger
}

impl GlobalLogger {
    pub fn set_stderr_level(&self, level: log::LevelFilter) {
        *self.stderr_level.lock().unwrap() = level;
    }
}

impl log::Log for GlobalLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        if record.level() <= *self.stderr_level.lock().unwrap() {
            eprint_log(record.level(), &record.args().to_string());
        }
        self.log_to_tracing.log(record);
    }

    fn flush(&self) {}
}

fn eprint_log(level: log::Level, message: &str) {
    let prefix = match level {
        log::Level::Error => "error:".red().bold(),
        log::Level::Warn => "warning:".yellow().bold(),
        log::Level::Info => "".clear(),
        log::Level::Debug => "debug:".dimmed(),
        log::Level::Trace => "trace:".dimmed(),
    };
    if prefix.is_empty() {
        eprintln!("{message}");
    } else {
        eprintln!("{prefix} {message}");
    }
}

/// Computes the stderr level from `-v`/`-q` counts, defaulting to Info.
pub fn level_from_counts(verbose: u8, quiet: u8) -> anyhow::Result<log::LevelFilter> {
    const LEVELS: [log::LevelFilter; 6] = [
        log::LevelFilter::Off,
        log::LevelFilter::Error,
        log::LevelFilter::Warn,
        log::LevelFilter::Info,
        log::LevelFilter::Debug,
        log::LevelFilter::Trace,
    ];
    let default = 3i16;
    let index = default + i16::from(verbose) - i16::from(quiet);
    if index < 0 {
        anyhow::bail!("too quiet, already below {}", LEVELS[0]);
    }
    if index as usize >= LEVELS.len() {
        anyhow::bail!("too verbose, already above {}", LEVELS[LEVELS.len() - 1]);
    }
    Ok(LEVELS[index as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_counts() {
        assert_eq!(level_from_counts(0, 0).unwrap(), log::LevelFilter::Info);
        assert_eq!(level_from_counts(1, 0).unwrap(), log::LevelFilter::Debug);
        assert_eq!(level_from_counts(0, 2).unwrap(), log::LevelFilter::Error);
        assert_eq!(level_from_counts(0, 3).unwrap(), log::LevelFilter::Off);
        assert!(level_from_counts(0, 4).is_err());
        assert!(level_from_counts(3, 0).is_err());
    }
}
