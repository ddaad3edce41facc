//! Error types for cwtune-mac.

use thiserror::Error;

/// Result type for cwtune-mac operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading MAC schedules.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed slotframe definition.
    #[error("slotframe line {line}: {reason}")]
    Slotframe { line: usize, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
