//! Service error taxonomy and the transport-agnostic error envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::history::QueryError;
use crate::storage::PersistenceError;

/// Stable error codes exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    PermissionDenied,
    NotFound,
    SamplingFailure,
    StorageFailure,
    Internal,
}

/// Errors returned by the control/query surface
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid value for '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ServiceError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::Validation { .. } => ErrorCode::ValidationError,
            ServiceError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::Storage(_) => ErrorCode::StorageFailure,
            ServiceError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Structured details, when the error has any
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            ServiceError::Validation { field, reason } => Some(serde_json::json!({
                "field": field,
                "reason": reason,
            })),
            _ => None,
        }
    }

    pub fn envelope(&self, request_id: impl Into<String>) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
            timestamp: Utc::now(),
            request_id: request_id.into(),
        }
    }
}

impl From<ConfigError> for ServiceError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid { field, reason } => ServiceError::Validation { field, reason },
            ConfigError::Persist(msg) => ServiceError::Storage(msg),
        }
    }
}

impl From<QueryError> for ServiceError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Invalid { field, reason } => ServiceError::Validation { field, reason },
        }
    }
}

impl From<PersistenceError> for ServiceError {
    fn from(err: PersistenceError) -> Self {
        ServiceError::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServiceError::Internal(format!("background task failed: {}", err))
    }
}

/// `{code, message, details?, timestamp, request_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}
