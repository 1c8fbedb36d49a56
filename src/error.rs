//! Error types for TopayChain

use thiserror::Error;

/// Coarse failure classes used to pick retry behaviour and HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    NotFound,
    Network,
    Integrity,
    Capacity,
    Internal,
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Insufficient balance: {address} has {available} available, needs {required}")]
    InsufficientBalance {
        address: String,
        available: u64,
        required: u64,
    },
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Integrity error: {0}")]
    IntegrityError(String),
    #[error("No capacity: {0}")]
    CapacityError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ChainError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChainError::InvalidTransaction(_)
            | ChainError::InsufficientBalance { .. }
            | ChainError::InvalidBlock(_)
            | ChainError::InvalidRequest(_)
            | ChainError::CryptoError(_) => ErrorClass::Validation,
            ChainError::NotFound(_) => ErrorClass::NotFound,
            ChainError::NetworkError(_) | ChainError::Timeout(_) => ErrorClass::Network,
            ChainError::IntegrityError(_) => ErrorClass::Integrity,
            ChainError::CapacityError(_) => ErrorClass::Capacity,
            ChainError::DatabaseError(_)
            | ChainError::SerializationError(_)
            | ChainError::IoError(_)
            | ChainError::ConfigError(_) => ErrorClass::Internal,
        }
    }

    /// Network failures are the only class worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Network
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChainError::Timeout(err.to_string())
        } else {
            ChainError::NetworkError(err.to_string())
        }
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ChainError::InvalidTransaction("x".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            ChainError::InvalidRequest("deviceId is required".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(ChainError::Timeout("t".into()).class(), ErrorClass::Network);
        assert_eq!(
            ChainError::CapacityError("none".into()).class(),
            ErrorClass::Capacity
        );
        assert!(ChainError::NetworkError("refused".into()).is_retryable());
        assert!(!ChainError::CapacityError("none".into()).is_retryable());
    }

    #[test]
    fn test_insufficient_balance_message() {
        let err = ChainError::InsufficientBalance {
            address: "abc".into(),
            available: 5,
            required: 20,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient balance: abc has 5 available, needs 20"
        );
    }
}
