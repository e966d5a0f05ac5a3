//! # Service Error Types
//!
//! Error taxonomy for the orchestration service using thiserror for
//! structured error types instead of `Box<dyn Error>` patterns.
//!
//! Storage backends raise [`StorageError`](crate::storage::StorageError);
//! everything above the storage seam raises [`TaskHubError`]. The facade
//! recovers only optimistic-concurrency conflicts and cancellation; every
//! other error propagates to the dispatcher host.

use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the orchestration service and its components.
#[derive(Error, Debug)]
pub enum TaskHubError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("history commit for instance {instance_id} lost an optimistic concurrency race")]
    PreconditionFailed { instance_id: String },

    #[error("message decode failed: {message}")]
    Decode { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("orchestration instance {instance_id} already exists")]
    InstanceAlreadyExists { instance_id: String },

    #[error("orchestration instance {instance_id} not found")]
    InstanceNotFound { instance_id: String },

    #[error("lease for partition {partition_id} is no longer held by this worker")]
    LeaseLost { partition_id: String },

    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("operation {operation} timed out")]
    Timeout { operation: String },

    #[error("operation canceled")]
    Canceled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TaskHubError {
    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the error is an optimistic-concurrency conflict, whether
    /// raised at the service layer or passed through from storage.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(
            self,
            Self::PreconditionFailed { .. } | Self::Storage(StorageError::PreconditionFailed { .. })
        )
    }

    /// True when the error only signals cooperative cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, TaskHubError>;
