use std::io::IsTerminal as _;

/// Progress reporting for long phases. Wraps an indicatif spinner/bar and
/// goes quiet when stderr is not a terminal or testmode is on, so scripted
/// runs and tests see clean output.
pub struct Baton {
    bar: Option<indicatif::ProgressBar>,
}

impl Baton {
    pub fn new(enabled: bool) -> Self {
        Self {
            bar: (enabled && std::io::stderr().is_terminal()).then(|| {
                let bar = indicatif::ProgressBar::no_length().with_style(
                    indicatif::ProgressStyle::default_spinner()
                        .template("{elapsed:>4} {msg} {pos}")
                        .unwrap(),
                );
                bar.enable_steady_tick(std::time::Duration::from_millis(100));
                bar
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { bar: None }
    }

    /// Starts a named phase, resetting the counter.
    pub fn phase(&self, name: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(name.to_owned());
            bar.set_position(0);
        }
        log::debug!("phase: {name}");
    }

    pub fn tick(&self) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    pub fn set_count(&self, count: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(count);
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl Drop for Baton {
    fn drop(&mut self) {
        self.finish();
    }
}
