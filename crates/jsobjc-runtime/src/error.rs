//! Runtime error types.

use jsobjc_engine::BridgeError;
use jsobjc_sdk::JsError;

/// Errors raised while configuring or driving an isolate
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// File I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker could not be started or failed while running
    #[error("Worker error: {0}")]
    Worker(String),

    /// The target isolate or worker has been terminated
    #[error("{0} has been terminated")]
    Terminated(String),

    /// Bridge setup failed
    #[error("{0}")]
    Bridge(#[from] BridgeError),

    /// A scripting exception
    #[error("{0}")]
    Script(#[from] JsError),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
