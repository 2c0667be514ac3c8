/** Command line argument definition using subcommands.
 *
 * This is a thin, non-interactive shell over the surgical kernel: every
 * subcommand reads a stream, applies one operation, and writes the result.
 */
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

const ABOUT: &str = "git-surgeon - a surgical editor for version-control histories.

Reads git fast-import streams and Subversion dump streams, operates on the
repository they describe, and writes the result back out as a fast-import
stream.\
";

#[derive(Parser, Debug)]
#[command(about = ABOUT)]
pub struct Cli {
    /// Run as if started in <path>.
    #[arg(name = "path", short = 'C')]
    pub working_directory: Option<PathBuf>,

    #[clap(flatten)]
    pub log_level: LogLevelArg,

    /// Deterministic output with synthetic identity, for tests.
    #[arg(long, global = true)]
    pub testmode: bool,

    /// Gzip blob spill files.
    #[arg(long, global = true)]
    pub compressblobs: bool,

    /// Verbose phase timings to a trace file.
    #[arg(long, global = true)]
    pub bigprofile: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
pub struct LogLevelArg {
    /// Use `-v` for debug or `-vv` for trace log messages.
    #[arg(long, short = 'v', global = true, default_value = "0", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Use `-q` to hide info, `-qq` to hide warnings or `-qqq` to also hide
    /// error messages.
    #[arg(long, short = 'q', global = true, default_value = "0", action = clap::ArgAction::Count)]
    pub quiet: u8,
}

#[derive(Args, Debug)]
pub struct IoArgs {
    /// The input stream: a fast-import or Subversion dump file, or - for
    /// stdin.
    pub input: PathBuf,

    /// Where to write the resulting fast-import stream; stdout by default.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Options passed to the stream reader, e.g. --read-option=--nobranch.
    #[arg(long = "read-option")]
    pub read_options: Vec<String>,

    /// Options passed to the stream writer, e.g. --write-option=--legacy.
    #[arg(long = "write-option")]
    pub write_options: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Read a stream and write it back out (a round trip with optional
    /// dialect conversion).
    Read(Read),
    /// Delete commits, propagating their content per the policy flags.
    Squash(Squash),
    /// Convert empty commits into annotated tags.
    Tagify(Tagify),
    /// Compose away redundant fileops in the selected commits.
    Canonicalize(Canonicalize),
    /// Rewrite marks into a dense 1-origin sequence.
    Renumber(Renumber),
    /// Topologically sort the event sequence.
    Resort(Resort),
    /// Regex-rename paths in the selected commits.
    RenamePaths(RenamePaths),
    /// Remove matching paths from history, producing a sibling stream of
    /// the removals.
    Expunge(Expunge),
    /// Resolve a selection expression and print the matching events.
    Select(Select),
    /// Check the repository invariants and report violations.
    Lint(Lint),
    /// Dump internal state for debugging.
    #[command(subcommand)]
    Dump(Dump),
    /// Print the version of the git-surgeon tool.
    #[clap(aliases = ["-V", "--version"])]
    Version,
}

#[derive(Args, Debug)]
pub struct Read {
    #[command(flatten)]
    pub io: IoArgs,

    /// Write a Subversion dump stream instead of a fast-import stream.
    /// This output is documented-lossy.
    #[clap(long)]
    pub svn_out: bool,
}

#[derive(Args, Debug)]
pub struct Squash {
    #[command(flatten)]
    pub io: IoArgs,

    /// The selection expression naming the commits to squash.
    pub selection: String,

    /// Squash policy flags: --delete, --pushback, --pushforward, --tagify,
    /// --tagback, --tagforward, --coalesce, --empty-only, --complain,
    /// --quiet.
    #[arg(long = "policy")]
    pub policy: Vec<String>,
}

#[derive(Args, Debug)]
pub struct Tagify {
    #[command(flatten)]
    pub io: IoArgs,

    /// Restrict tagification to a selection; all commits by default.
    pub selection: Option<String>,

    /// Also tagify tip-delete commits.
    #[clap(long)]
    pub tipdeletes: bool,

    /// Tagify merge commits too.
    #[clap(long)]
    pub tagify_merges: bool,
}

#[derive(Args, Debug)]
pub struct Canonicalize {
    #[command(flatten)]
    pub io: IoArgs,

    /// The selection of commits to canonicalize; all commits by default.
    pub selection: Option<String>,

    /// Retain only the last modify op per path.
    #[clap(long)]
    pub coalesce: bool,
}

#[derive(Args, Debug)]
pub struct Renumber {
    #[command(flatten)]
    pub io: IoArgs,
}

#[derive(Args, Debug)]
pub struct Resort {
    #[command(flatten)]
    pub io: IoArgs,
}

#[derive(Args, Debug)]
pub struct RenamePaths {
    #[command(flatten)]
    pub io: IoArgs,

    /// The selection of commits to rewrite.
    pub selection: String,

    /// The regex matched against fileop paths.
    pub pattern: String,

    /// The replacement, with $1-style group references.
    pub replacement: String,

    /// Bypass the ancestry collision checks.
    #[clap(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct Expunge {
    #[command(flatten)]
    pub io: IoArgs,

    /// The selection of commits to expunge from.
    pub selection: String,

    /// Path regexes to remove.
    #[arg(required = true)]
    pub patterns: Vec<String>,

    /// Where to write the sibling stream holding the removed history.
    #[arg(long)]
    pub expunges_to: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct Select {
    /// The input stream.
    pub input: PathBuf,

    /// The selection expression to resolve.
    pub expression: String,
}

#[derive(Args, Debug)]
pub struct Lint {
    /// The input stream.
    pub input: PathBuf,
}

/// Experimental feature: dump internal states to stdout.
/// Do not script against these.
#[derive(Subcommand, Debug)]
pub enum Dump {
    /// Dump the commit DAG in DOT form.
    Graph(DumpInput),
    /// Dump event counts as JSON.
    Stats(DumpInput),
}

#[derive(Args, Debug)]
pub struct DumpInput {
    /// The input stream.
    pub input: PathBuf,
}
