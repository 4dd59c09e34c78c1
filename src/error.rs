//! Leasehold Error Types

use thiserror::Error;

use crate::protocol::{FailureKind, QueryFailure};

/// Result type alias for Leasehold operations
pub type Result<T> = std::result::Result<T, Error>;

/// Leasehold error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Store errors
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Store is not open")]
    StoreNotOpen,

    #[error("Failed to open store after {attempts} attempts: {reason}")]
    StoreOpenFailed { attempts: u32, reason: String },

    #[error("Statement execution failed: {0}")]
    Execution(String),

    // Coordination errors
    #[error("Query rejected: {0}")]
    Query(QueryFailure),

    #[error("Coordinator channel closed")]
    ChannelClosed,

    // Liveness errors
    #[error("Lease error: {0}")]
    Lease(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a routing failure (nothing was executed)
    pub fn is_routing(&self) -> bool {
        match self {
            Error::Query(failure) => failure.kind.is_routing(),
            Error::ChannelClosed | Error::ShuttingDown => true,
            _ => false,
        }
    }

    /// Machine-readable reason for a caller-visible rejection
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Query(failure) => failure.kind.reason(),
            Error::ChannelClosed | Error::ShuttingDown => FailureKind::OwnerUnavailable.reason(),
            Error::Execution(_) | Error::Store(_) => FailureKind::Execution.reason(),
            Error::StoreNotOpen => FailureKind::OwnerNotReady.reason(),
            Error::StoreOpenFailed { .. } => FailureKind::Initialization.reason(),
            _ => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_classification() {
        let exhausted = Error::Query(QueryFailure::new(
            FailureKind::RetriesExhausted,
            "gave up after 8 attempts",
        ));
        assert!(exhausted.is_routing());
        assert_eq!(exhausted.reason(), "retries_exhausted");

        let syntax = Error::Query(QueryFailure::new(
            FailureKind::Execution,
            "near \"SELEC\": syntax error",
        ));
        assert!(!syntax.is_routing());
        assert_eq!(syntax.reason(), "execution");
        assert!(syntax.to_string().contains("syntax error"));
    }
}
