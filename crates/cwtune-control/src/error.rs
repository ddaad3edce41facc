//! Error types for the control program.

use thiserror::Error;

/// Result type for control operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that stop the control program.
///
/// Failed fleet commands are not errors; they only surface here when the
/// failure policy escalates them.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML error
    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Bad command line
    #[error("{0}")]
    Usage(String),

    /// Fleet setup error
    #[error("Fleet error: {0}")]
    Fleet(#[from] cwtune_fleet::Error),

    /// MAC model error
    #[error("MAC error: {0}")]
    Mac(#[from] cwtune_mac::Error),

    /// Too many fleet commands failed in a row
    #[error("{failures} consecutive fleet commands failed, last: {operation}")]
    Escalated { operation: String, failures: u32 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
