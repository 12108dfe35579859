//! Error taxonomy for the ingestion pipeline
//!
//! Failures here stay scoped to the reading or write that produced them;
//! only `StorageCorruption` and `Config` are fatal to the process. Duplicate,
//! late, gap and backpressure results are not errors: they reach the caller
//! as `IngestOutcome` variants and `IngestNote`s.

use super::types::ReadingState;
use std::time::Duration;
use thiserror::Error;

/// Credential verification failures. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device revoked: {0}")]
    Revoked(String),

    #[error("credential expired for {device_id} at {expired_at}")]
    Expired { device_id: String, expired_at: i64 },

    #[error("malformed auth tag from {0}")]
    MalformedTag(String),

    #[error("auth tag mismatch for {0}")]
    TagMismatch(String),
}

/// Errors raised by a storage backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage corruption: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether another attempt of the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StoreError::Corruption(err.to_string())
                }
                _ => StoreError::Transient(err.to_string()),
            },
            _ => StoreError::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Pipeline-level error taxonomy
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("transient storage failure: {0}")]
    TransientStorage(String),

    #[error("persistence exhausted for {entity} after {attempts} retries: {reason}")]
    PersistenceExhausted {
        entity: String,
        attempts: u32,
        reason: String,
    },

    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid reading state transition {from:?} -> {to:?}")]
    InvalidTransition { from: ReadingState, to: ReadingState },
}

impl PipelineError {
    /// Errors that must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::StorageCorruption(_) | PipelineError::Config(_)
        )
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corruption(msg) => PipelineError::StorageCorruption(msg),
            other => PipelineError::TransientStorage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::from(busy).is_retryable());

        let corrupt = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        );
        let err = StoreError::from(corrupt);
        assert!(err.is_corruption());
        assert!(!err.is_retryable());
        assert!(PipelineError::from(err).is_fatal());
    }

    #[test]
    fn test_per_reading_errors_are_not_fatal() {
        let errors = vec![
            PipelineError::Auth(AuthError::Revoked("D1".to_string())),
            PipelineError::TransientStorage("database is locked".to_string()),
            PipelineError::InvalidTransition {
                from: ReadingState::Received,
                to: ReadingState::Persisted,
            },
            PipelineError::PersistenceExhausted {
                entity: "D1/1".to_string(),
                attempts: 6,
                reason: "disk busy".to_string(),
            },
        ];

        for err in errors {
            assert!(!err.is_fatal(), "{} should not be fatal", err);
        }
    }
}
