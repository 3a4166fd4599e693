//! Error types for the dynamic authority
//!
//! Errors fall into three groups that the reconcile driver treats differently:
//! configuration errors are surfaced and never retried, store contention and
//! transport errors are retried with backoff, and malformed material is
//! recoverable by regenerating it.

use thiserror::Error;

/// Main error type for dynamic authority operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that is not one of the classified statuses below
    #[error("kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// Malformed PEM, certificate or private key
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Public key algorithm that cannot be compared
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Elliptic curve size other than 256, 384 or 521 bits
    #[error("unsupported elliptic curve size: {0} bits")]
    UnsupportedCurve(u32),

    /// Requested resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Another writer changed the resource concurrently
    #[error("conflict: {0}")]
    Conflict(String),

    /// The API server refused the applied field set
    #[error("apply rejected: {0}")]
    ApplyRejected(String),

    /// No serving certificate has been loaded yet
    #[error("serving certificate not available")]
    NotAvailable,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid runtime configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Unexpected failure inside a library call
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Operation that failed
        context: String,
        /// Underlying cause
        message: String,
    },
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) => match ae.code {
                404 => Self::NotFound(ae.message.clone()),
                409 => Self::Conflict(ae.message.clone()),
                400 | 422 => Self::ApplyRejected(ae.message.clone()),
                _ => Self::Kube(err),
            },
            _ => Self::Kube(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Create an invalid data error with the given message
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error for a failed operation
    pub fn internal(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Whether the driver should retry the pass that produced this error
    ///
    /// Configuration errors are permanent until an operator intervenes, so
    /// retrying them only produces log noise.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::UnsupportedKeyType(_)
                | Error::UnsupportedCurve(_)
                | Error::Validation(_)
                | Error::Serialization(_)
        )
    }

    /// Whether this error is concurrent-writer contention
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Whether this error reports a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
