//! Error types for PlantWatch sync operations

use crate::identity::CorrelationId;
use thiserror::Error;

/// Failures reported by the REST boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("HTTP {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("Invalid response body: {reason}")]
    InvalidBody { reason: String },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Error taxonomy of the sync layer.
///
/// Fetch and poll errors end up as entry state in the cache; mutation
/// errors are handed back to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Scope unresolved: {reason}")]
    ScopeUnresolved { reason: String },

    #[error("Transient fetch error: {reason}")]
    TransientFetch { reason: String },

    #[error("Validation error ({status}): {detail}")]
    Validation { status: u16, detail: String },

    #[error("Confirmation not received for {correlation_id} within {timeout_ms}ms")]
    ConfirmationTimeout {
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },

    #[error("Decode error: {reason}")]
    Decode { reason: String },
}

impl SyncError {
    /// Only transient failures are eligible for automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch { .. })
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode {
            reason: err.to_string(),
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Status { status: 401, .. } | ApiError::Status { status: 403, .. } => {
                Self::AuthRequired
            }
            ApiError::Status { status, detail } if (400..500).contains(&status) => {
                Self::Validation { status, detail }
            }
            ApiError::Status { status, detail } => Self::TransientFetch {
                reason: format!("HTTP {}: {}", status, detail),
            },
            ApiError::Network { reason } => Self::TransientFetch { reason },
            ApiError::InvalidBody { reason } => Self::TransientFetch { reason },
        }
    }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
