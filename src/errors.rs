use thiserror::Error;

/// Errors reported by a [`crate::ledger::LedgerClient`]
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    /// RPC request failed
    #[error("RPC error: {message} (endpoint: {endpoint:?})")]
    Rpc {
        endpoint: Option<String>,
        message: String,
    },

    /// Signature subscription could not be opened
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Transaction id is not a valid signature
    #[error("Invalid transaction id: {0}")]
    InvalidId(String),

    /// Signed payload could not be decoded
    #[error("Invalid signed payload: {0}")]
    InvalidPayload(String),

    /// Timeout waiting for the ledger
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl LedgerError {
    /// Check if this error is transient and the operation worth repeating
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Rpc { .. } => true,
            LedgerError::Subscription(_) => true,
            LedgerError::Timeout(_) => true,

            LedgerError::InvalidId(_) => false,
            LedgerError::InvalidPayload(_) => false,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Coordinator setup errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WatcherError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unknown commitment level name
    #[error("Invalid commitment level: {0}")]
    InvalidCommitment(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let rpc = LedgerError::Rpc {
            endpoint: Some("http://localhost:8899".to_string()),
            message: "connection reset".to_string(),
        };
        assert!(rpc.is_transient());
        assert!(LedgerError::Timeout(500).is_transient());
        assert!(!LedgerError::InvalidId("zz".to_string()).is_transient());
        assert!(!LedgerError::InvalidPayload("eof".to_string()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = LedgerError::Timeout(250);
        assert_eq!(err.to_string(), "Timeout after 250ms");

        let err = WatcherError::Configuration("poll_interval_ms must be > 0".to_string());
        assert!(err.to_string().contains("poll_interval_ms"));
    }
}
