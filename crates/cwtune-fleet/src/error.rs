//! Error types for cwtune-fleet.

use thiserror::Error;

/// Result type for cwtune-fleet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting up the fleet connection.
///
/// Commands sent once the gateway is up report an `Outcome` instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The roster named no agents.
    #[error("no node agents configured")]
    NoAgents,

    /// Too few agents answered before the discovery deadline.
    #[error("only {responded} of {required} required agents responded")]
    AgentsUnavailable { responded: usize, required: usize },

    /// The gateway was already closed.
    #[error("fleet gateway is closed")]
    Closed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Codec(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
