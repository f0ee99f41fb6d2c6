//! Error types for a3s-audit

use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// Connection to the feed source failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Initial connection retries exhausted
    #[error("Failed to connect after {attempts} attempt(s): {reason}")]
    ConnectionExhausted {
        attempts: u32,
        reason: String,
    },

    /// Replica set topology could not be verified or initiated
    #[error("Topology error: {0}")]
    Topology(String),

    /// Administrative command failure
    #[error("Command '{command}' failed: {reason}")]
    Command {
        command: String,
        reason: String,
    },

    /// Change feed could not be opened
    #[error("Failed to open change feed: {0}")]
    Subscribe(String),

    /// Change feed failed while streaming
    #[error("Change feed error: {0}")]
    Feed(String),

    /// Audit sink rejected or failed to store a record
    #[error("Audit sink error: {0}")]
    Sink(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown or teardown failure
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;
