use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures before a child process is observed running.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("executable not found (tried {} location(s))", .tried.len())]
    NotFound { tried: Vec<PathBuf> },

    #[error("failed to start {}: {source}", .path.display())]
    StartFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process did not start within {0:?}")]
    StartTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControllerError {
    #[error("a run is already in progress")]
    Busy,
}
