//! Error types for worker process management

use thiserror::Error;

/// Errors raised while creating or talking to a worker process
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The child could not be started
    #[error("Failed to spawn worker process: {0}")]
    SpawnFailed(String),

    /// The message channel to the child is gone
    #[error("Channel to worker {worker} is closed")]
    ChannelClosed { worker: String },

    /// A forced kill could not be delivered
    #[error("Failed to kill worker {worker}: {reason}")]
    KillFailed { worker: String, reason: String },

    /// A message could not be serialized for the wire
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;
