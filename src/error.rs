/// Error raised for malformed stream input. Carries the line number of the
/// source stream where parsing stopped.
#[derive(thiserror::Error, Debug, PartialEq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: u64,
    pub message: String,
}

impl ParseError {
    pub fn new(line: u64, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Error raised when an external VCS extractor subprocess misbehaves:
/// non-zero exit, malformed output or an ambiguous reference.
#[derive(thiserror::Error, Debug, PartialEq)]
#[error("{program}: {message}")]
pub struct ExtractorError {
    pub program: String,
    pub message: String,
}

impl ExtractorError {
    pub fn new(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            message: message.into(),
        }
    }
}

/// Operator error in a scripted command: bad selection, invalid option
/// combination, unknown verb. Recoverable; the repository is untouched
/// because command-level operations validate their input up front.
#[derive(thiserror::Error, Debug, PartialEq)]
#[error("{0}")]
pub struct CommandError(pub String);

pub fn command_error(message: impl Into<String>) -> anyhow::Error {
    CommandError(message.into()).into()
}

/// Malformed message-block input to the metadata-edit round-trip. The target
/// events are untouched if any message fails to parse.
#[derive(thiserror::Error, Debug, PartialEq)]
#[error("{0}")]
pub struct MailboxError(pub String);

/// Returns true for errors the scripted shell may catch and report without
/// aborting the process.
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CommandError>().is_some() || err.downcast_ref::<MailboxError>().is_some()
}
