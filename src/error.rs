//! Error types for the resolver.
//!
//! All errors are strongly typed using thiserror. Only configuration errors
//! (`ResolveError::MissingColumn`, `ResolveError::Validation`) halt a batch;
//! provider and cache failures are converted into misses by their callers.

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors that occur while building records or configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A score outside `[0.0, 1.0]`.
    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        value: f32,
    },

    /// Empty alias.
    #[error("Alias name cannot be empty")]
    EmptyAlias,

    /// A blank company ID.
    #[error("Canonical company ID cannot be empty")]
    EmptyCompanyId,

    /// Missing field.
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    /// A column whose length differs from the table's row count.
    #[error("Column '{column}' has {actual} values, expected {expected}")]
    ColumnLengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    /// A configuration value that cannot be used.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors raised by the enterprise-info transport.
///
/// These never reach the resolver: the provider maps them into state
/// transitions and `None` results.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response within the configured timeout.
    #[error("Request timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    /// Connection failed.
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    /// HTTP 401. Disables the provider until reset.
    #[error("Provider rejected the credentials (401)")]
    Unauthorized,

    /// Any other 4xx. Not retried.
    #[error("Client error (status {status}): {message}")]
    ClientError {
        status: u16,
        message: String,
    },

    /// 5xx. Retried.
    #[error("Server error (status {status}): {message}")]
    ServerError {
        status: u16,
        message: String,
    },

    /// The body did not match the expected shape.
    #[error("Failed to deserialize response: {message}")]
    DeserializationFailed {
        message: String,
    },
}

impl TransportError {
    /// Classifies a non-success HTTP status.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Unauthorized,
            500..=599 => Self::ServerError { status, message },
            _ => Self::ClientError { status, message },
        }
    }

    /// Returns true if this failure is transient and worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionFailed { .. } | Self::ServerError { .. }
        )
    }

    /// Returns true if the provider rejected the credentials.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// Errors raised when handing work to the enrichment queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue full.
    #[error("Enrichment queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    /// The receiving side was dropped.
    #[error("Enrichment queue is disconnected")]
    Disconnected,
}

/// Top-level error type returned by `CompanyIdResolver::resolve_batch`.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Missing column.
    #[error("Required column '{column}' is missing from the input table")]
    MissingColumn {
        column: String,
    },

    /// Invalid input or configuration.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The cache backend failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A broken internal invariant, such as a row left without a source.
    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ResolveError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error aborts a batch before any row is processed.
    #[must_use]
    pub const fn is_fatal_config(&self) -> bool {
        matches!(self, Self::MissingColumn { .. } | Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Result type alias for resolver operations.
pub type ResolveResult<T> = Result<T, ResolveError>;
