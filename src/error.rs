//! WolfSync Error Types

use thiserror::Error;

use crate::protocol::ResultCode;

/// Result type alias for WolfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Node not found in cluster topology: {0}")]
    UnknownNode(String),

    // Protocol results
    #[error("Operation not allowed: {0}")]
    NotAllowed(String),

    #[error("Operation not implemented: {0}")]
    NotImplemented(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message of {size} bytes exceeds the {limit} byte frame limit")]
    MessageTooLarge { size: usize, limit: u32 },

    // Failure handling
    #[error("Node {node_id} failed: {reason}")]
    NodeFailed { node_id: String, reason: String },

    #[error("Unrecoverable cluster failure: {0}")]
    Unrecoverable(String),

    #[error("Barrier error: {0}")]
    Barrier(String),

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
    /// Check if this error means a remote node stopped responding
    pub fn is_node_failure(&self) -> bool {
        matches!(self, Error::NodeFailed { .. })
    }

    /// Id of the failed node, if this is a node failure
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            Error::NodeFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Map a protocol rejection back onto its result code
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            Error::NotAllowed(_) => Some(ResultCode::NotAllowed),
            Error::NotImplemented(_) => Some(ResultCode::NotImplemented),
            _ => None,
        }
    }

    /// Check if this error is a connectivity problem that may go away on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) | Error::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(
            Error::NotAllowed("GetTimeData".into()).result_code(),
            Some(ResultCode::NotAllowed)
        );
        assert_eq!(
            Error::NotImplemented("CreateBarrier".into()).result_code(),
            Some(ResultCode::NotImplemented)
        );
        assert_eq!(Error::ShuttingDown.result_code(), None);
    }

    #[test]
    fn test_node_failure_predicates() {
        let err = Error::NodeFailed {
            node_id: "node-a".into(),
            reason: "connection reset".into(),
        };
        assert!(err.is_node_failure());
        assert_eq!(err.failed_node(), Some("node-a"));
        assert!(!err.is_retryable());

        assert!(Error::ConnectionTimeout("10.0.0.1:41001".into()).is_retryable());

        let too_large = Error::MessageTooLarge { size: 1 << 27, limit: 1 << 26 };
        assert!(!too_large.is_node_failure());
        assert!(!too_large.is_retryable());
    }
}
