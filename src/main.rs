mod cli;

use crate::cli::Cli;
use crate::cli::Commands;
use anyhow::Context as _;
use anyhow::Result;
use clap::Parser as _;
use git_surgeon::config::GlobalOptions;
use git_surgeon::config::ReadOptions;
use git_surgeon::config::SquashPolicy;
use git_surgeon::config::WriteOptions;
use git_surgeon::error::is_recoverable;
use git_surgeon::event::Event;
use git_surgeon::orderedset::OrderedIntSet;
use git_surgeon::repository::Repository;
use git_surgeon::selection;
use git_surgeon::surgery;
use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

fn main() {
    let args = Cli::parse();
    let logger = git_surgeon::log::init(args.bigprofile);
    match args.log_level.value() {
        Ok(level) => logger.set_stderr_level(level),
        Err(err) => {
            eprintln!("git-surgeon: {err}");
            std::process::exit(2);
        }
    }
    if let Some(dir) = &args.working_directory
        && let Err(err) = std::env::set_current_dir(dir)
    {
        eprintln!("git-surgeon: cannot chdir to {}: {err}", dir.display());
        std::process::exit(2);
    }
    let globals = GlobalOptions {
        testmode: args.testmode,
        compressblobs: args.compressblobs,
        bigprofile: args.bigprofile,
    };
    match run(&args, &globals) {
        Ok(()) => {}
        Err(err) if is_recoverable(&err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
        Err(err) => {
            log::error!("{err:#}");
            std::process::exit(3);
        }
    }
}

impl cli::LogLevelArg {
    pub fn value(&self) -> Result<log::LevelFilter> {
        git_surgeon::log::level_from_counts(self.verbose, self.quiet)
    }
}

fn read_input(path: &Path, options: &ReadOptions, globals: &GlobalOptions) -> Result<Repository> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stdin".to_owned());
    let mut repo = if path.as_os_str() == "-" {
        let mut data = Vec::new();
        std::io::stdin().read_to_end(&mut data)?;
        git_surgeon::importer::read_auto_bytes(&data, &name, options)?
    } else {
        git_surgeon::importer::read_auto_file(path, &name, options)?
    };
    repo.compress_blobs = globals.compressblobs;
    let stats = repo.stats();
    log::info!(
        "read {} events ({} commits, {} blobs)",
        repo.events.len(),
        stats.get("commit").copied().unwrap_or(0),
        stats.get("blob").copied().unwrap_or(0),
    );
    Ok(repo)
}

/// Writes through a closure inside a critical region: SIGINT is deferred
/// until the stream is complete so a torn half-written output never
/// replaces good data.
fn write_critical<F>(output: Option<&Path>, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn std::io::Write) -> Result<()>,
{
    match output {
        Some(path) => {
            let mut file = std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            guarded_write(&mut file, write)
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            guarded_write(&mut lock, write)
        }
    }
}

fn guarded_write<F>(out: &mut dyn std::io::Write, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn std::io::Write) -> Result<()>,
{
    let interrupted = Arc::new(AtomicBool::new(false));
    let handle = signal_hook::flag::register(signal_hook::consts::SIGINT, interrupted.clone())?;
    let result = write(out).and_then(|()| out.flush().map_err(Into::into));
    signal_hook::low_level::unregister(handle);
    if interrupted.load(Ordering::Relaxed) {
        log::warn!("interrupt deferred until the output stream was complete");
        signal_hook::low_level::raise(signal_hook::consts::SIGINT)?;
    }
    result
}

fn write_output(
    repo: &Repository,
    io: &cli::IoArgs,
    selection: Option<&OrderedIntSet>,
) -> Result<()> {
    let flags: Vec<&str> = io.write_options.iter().map(String::as_str).collect();
    let options = WriteOptions::from_flags(flags)?;
    write_critical(io.output.as_deref(), |out| {
        git_surgeon::exporter::write_stream(repo, selection, &options, out)
    })
}

fn resolve(repo: &Repository, expression: &str) -> Result<OrderedIntSet> {
    selection::compile(expression)?.evaluate(repo, None)
}

fn read_options(io: &cli::IoArgs) -> Result<ReadOptions> {
    let flags: Vec<&str> = io.read_options.iter().map(String::as_str).collect();
    ReadOptions::from_flags(flags)
}

fn run(args: &Cli, globals: &GlobalOptions) -> Result<()> {
    match &args.command {
        Commands::Read(cmd) => {
            let repo = read_input(&cmd.io.input, &read_options(&cmd.io)?, globals)?;
            if cmd.svn_out {
                write_critical(cmd.io.output.as_deref(), |out| {
                    git_surgeon::svndump::write_dump(&repo, out)
                })
            } else {
                write_output(&repo, &cmd.io, None)
            }
        }
        Commands::Squash(cmd) => {
            let mut repo = read_input(&cmd.io.input, &read_options(&cmd.io)?, globals)?;
            let selection = resolve(&repo, &cmd.selection)?;
            let flags: Vec<&str> = cmd.policy.iter().map(String::as_str).collect();
            let policy = SquashPolicy::from_flags(flags)?;
            surgery::squash(&mut repo, &selection, &policy)?;
            surgery::renumber(&mut repo);
            write_output(&repo, &cmd.io, None)
        }
        Commands::Tagify(cmd) => {
            let mut repo = read_input(&cmd.io.input, &read_options(&cmd.io)?, globals)?;
            let selection = cmd
                .selection
                .as_deref()
                .map(|expr| resolve(&repo, expr))
                .transpose()?;
            let converted = surgery::tagify_empty(
                &mut repo,
                selection.as_ref(),
                cmd.tipdeletes,
                cmd.tagify_merges,
                None,
            )?;
            log::info!("tagified {converted} commits");
            surgery::renumber(&mut repo);
            write_output(&repo, &cmd.io, None)
        }
        Commands::Canonicalize(cmd) => {
            let mut repo = read_input(&cmd.io.input, &read_options(&cmd.io)?, globals)?;
            let selection = match cmd.selection.as_deref() {
                Some(expr) => resolve(&repo, expr)?,
                None => (0..repo.events.len()).collect(),
            };
            for index in selection.iter() {
                if repo.commit_at(index).is_some() {
                    surgery::canonicalize(&mut repo, index, cmd.coalesce)?;
                }
            }
            write_output(&repo, &cmd.io, None)
        }
        Commands::Renumber(cmd) => {
            let mut repo = read_input(&cmd.io.input, &read_options(&cmd.io)?, globals)?;
            surgery::renumber(&mut repo);
            write_output(&repo, &cmd.io, None)
        }
        Commands::Resort(cmd) => {
            let mut repo = read_input(&cmd.io.input, &read_options(&cmd.io)?, globals)?;
            surgery::resort(&mut repo)?;
            write_output(&repo, &cmd.io, None)
        }
        Commands::RenamePaths(cmd) => {
            let mut repo = read_input(&cmd.io.input, &read_options(&cmd.io)?, globals)?;
            let selection = resolve(&repo, &cmd.selection)?;
            let pattern = regex::bytes::Regex::new(&cmd.pattern)
                .map_err(|e| git_surgeon::error::command_error(format!("bad path regex: {e}")))?;
            git_surgeon::reorg::path_rename(
                &mut repo,
                &selection,
                &pattern,
                &cmd.replacement,
                cmd.force,
            )?;
            write_output(&repo, &cmd.io, None)
        }
        Commands::Expunge(cmd) => {
            let mut repo = read_input(&cmd.io.input, &read_options(&cmd.io)?, globals)?;
            let selection = resolve(&repo, &cmd.selection)?;
            let patterns: Vec<regex::bytes::Regex> = cmd
                .patterns
                .iter()
                .map(|p| {
                    regex::bytes::Regex::new(p).map_err(|e| {
                        git_surgeon::error::command_error(format!("bad expunge regex: {e}"))
                    })
                })
                .collect::<Result<_>>()?;
            let expunged = git_surgeon::reorg::expunge(&mut repo, &selection, &patterns)?;
            if let Some(path) = &cmd.expunges_to {
                let options = WriteOptions::default();
                write_critical(Some(path), |out| {
                    git_surgeon::exporter::write_stream(&expunged, None, &options, out)
                })?;
            }
            write_output(&repo, &cmd.io, None)
        }
        Commands::Select(cmd) => {
            let repo = read_input(&cmd.input, &ReadOptions::default(), globals)?;
            let selection = resolve(&repo, &cmd.expression)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for index in selection.iter() {
                let event = &repo.events[index];
                writeln!(
                    out,
                    "{}\t{}\t{}",
                    index + 1,
                    event.kind(),
                    event.mark().unwrap_or("-")
                )?;
            }
            Ok(())
        }
        Commands::Lint(cmd) => {
            let repo = read_input(&cmd.input, &ReadOptions::default(), globals)?;
            let complaints = repo.check_invariants();
            for complaint in &complaints {
                log::warn!("{complaint}");
            }
            if complaints.is_empty() {
                log::info!("no invariant violations");
                Ok(())
            } else {
                Err(git_surgeon::error::command_error(format!(
                    "{} invariant violations",
                    complaints.len()
                )))
            }
        }
        Commands::Dump(dump) => match dump {
            cli::Dump::Graph(cmd) => {
                let repo = read_input(&cmd.input, &ReadOptions::default(), globals)?;
                print!("{}", dot_graph(&repo));
                Ok(())
            }
            cli::Dump::Stats(cmd) => {
                let repo = read_input(&cmd.input, &ReadOptions::default(), globals)?;
                let report = StatsReport {
                    events: repo.events.len(),
                    counts: repo.stats(),
                    branches: repo.branches().iter().map(str::to_owned).collect(),
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
        },
        Commands::Version => {
            println!("git-surgeon {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[derive(serde::Serialize)]
struct StatsReport {
    events: usize,
    counts: std::collections::HashMap<&'static str, usize>,
    branches: Vec<String>,
}

/// The commit DAG in DOT form, for eyeballing with graphviz.
fn dot_graph(repo: &Repository) -> String {
    let mut out = String::from("digraph history {\n");
    for event in &repo.events {
        match event {
            Event::Commit(commit) => {
                let Some(mark) = &commit.mark else { continue };
                out.push_str(&format!(
                    "  \"{mark}\" [label=\"{mark}\\n{}\"];\n",
                    commit.branch
                ));
                for parent in commit.parent_marks() {
                    out.push_str(&format!("  \"{parent}\" -> \"{mark}\";\n"));
                }
            }
            Event::Tag(tag) => {
                out.push_str(&format!(
                    "  \"tag {}\" [shape=box];\n  \"{}\" -> \"tag {}\";\n",
                    tag.name,
                    tag.committish.emit(),
                    tag.name
                ));
            }
            _ => {}
        }
    }
    out.push_str("}\n");
    out
}
