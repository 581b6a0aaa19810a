use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("process is already running ({pid})")]
    AlreadyRunning { pid: u32 },
    #[error("environment is busy: {0}")]
    Busy(&'static str),
    #[error("failed to spawn {command} (cwd {cwd}): {source}")]
    Spawn {
        command: String,
        cwd: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to allocate pseudo-terminal: {0}")]
    Pty(#[source] std::io::Error),
    #[error("path escapes environment root: {0}")]
    PathEscape(String),
    #[error("process is not running")]
    NotRunning,
    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("invalid arguments for {key}: {message}")]
    InvalidArguments { key: String, message: String },
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("malformed document from {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("version not located: {0}")]
    VersionNotLocated(String),
    #[error("integrity check failed for {path}: {message}")]
    Integrity { path: PathBuf, message: String },
    #[error("command `{command}` exited abnormally (code {code:?})")]
    CommandFailed { command: String, code: Option<i32> },
    #[error("archive {path}: {message}")]
    Archive { path: PathBuf, message: String },
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OperationError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        OperationError::InvalidArguments {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Short machine-readable category for callers that report to the control plane.
    pub fn code(&self) -> &'static str {
        match self {
            OperationError::UnknownOperation(_) => "unknown_operation",
            OperationError::InvalidArguments { .. } => "invalid_param",
            OperationError::Http { .. }
            | OperationError::Malformed { .. }
            | OperationError::Integrity { .. } => "download_failed",
            OperationError::VersionNotLocated(_) => "version_not_found",
            OperationError::CommandFailed { .. } => "command_failed",
            OperationError::Archive { .. } => "extract_failed",
            OperationError::Environment(_) => "environment",
            OperationError::Io(_) => "io",
        }
    }
}

/// Failure of one pipeline step. `index` is zero-based; messages number
/// steps from 1.
#[derive(Debug, Error)]
#[error("step {} ({key}) failed: {source}", .index + 1)]
pub struct PipelineError {
    pub index: usize,
    pub key: String,
    #[source]
    pub source: OperationError,
}

impl PipelineError {
    pub fn step(&self) -> usize {
        self.index + 1
    }
}
