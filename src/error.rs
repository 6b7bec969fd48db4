//! Error taxonomy for the execution bridge.
//!
//! Each layer owns its error enum; the handler collects them with `#[from]`
//! conversions. Expected outcomes (format errors, exit-code-derived failure)
//! have dedicated variants; hard failures (launch failure, I/O) propagate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while preparing or cleaning the sandbox.
#[derive(Debug, Error)]
pub enum StagingError {
    /// The copy source does not exist or is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The shared cancellation signal fired mid-operation.
    /// Partially-copied or partially-deleted state is left as-is.
    #[error("staging operation canceled")]
    Canceled,

    /// One or more content deletions failed and failures were not tolerated.
    /// Carries the first failure observed by the worker pool.
    #[error("failed deleting contents of {root}: {source}")]
    AggregateDelete {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while encoding the environment-variable protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed argument-format template.
    #[error("argument format error: {0}")]
    ArgumentFormat(String),

    /// An endpoint or input cannot be encoded as specified.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors raised while supervising the legacy host process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The host executable is missing or unstartable. Fatal, never
    /// translated into a task result.
    #[error("failed to launch legacy host {executable}: {source}")]
    Launch {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run was canceled while the host was executing.
    #[error("legacy host execution canceled")]
    Canceled,

    /// I/O failure on the host's output streams after launch.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the execution orchestrator.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Missing or empty required input.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
