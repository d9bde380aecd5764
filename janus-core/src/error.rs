use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur inside the orchestration core.
///
/// Safety violations and stage failures are *not* errors: they are recorded
/// job outcomes. This type covers the genuinely exceptional paths.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
    #[error("directory not accessible: {0}")]
    Directory(PathBuf),
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, CoreError>;
