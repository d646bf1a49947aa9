//! Error types for the burrow syncer

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for syncer and proxy operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A referenced or requested object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    /// Create raced with an existing object
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    /// Optimistic-concurrency conflict on update
    #[error("conflict: {0}")]
    Conflict(String),

    /// A managed-name slot is occupied by an object we do not own
    #[error("unmanaged object blocks sync: {0}")]
    InvariantViolation(String),

    /// Validation error on a request or object
    #[error("validation error: {0}")]
    Validation(String),

    /// Request could not be authenticated
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request was authenticated but denied
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Proxying to an upstream API server failed
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for internal failures
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a proxy error with the given message
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(e)) => Some(e.code),
            _ => None,
        }
    }

    /// The target object (or a referenced one) does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. }) || self.api_code() == Some(404)
    }

    /// The object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. }) || self.api_code() == Some(409)
    }

    /// Optimistic-concurrency conflict; caller re-reads and retries
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_)) || self.api_code() == Some(409)
    }

    /// RBAC denied the operation; logged once, not retried
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Forbidden(_)) || self.api_code() == Some(403)
    }

    /// Worth requeueing with backoff: timeouts, rate limits, server errors
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 429 || e.code >= 500,
            Error::Kube(_) => true,
            Error::Proxy(_) => true,
            _ => false,
        }
    }

    /// HTTP status code for surfacing this error on a proxy response
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code,
            Error::NotFound { .. } => 404,
            Error::AlreadyExists { .. } | Error::Conflict(_) => 409,
            Error::Validation(_) => 422,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::Proxy(_) => 502,
            _ => 500,
        }
    }

    /// Kubernetes `Status` reason string for this error
    pub fn status_reason(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::Conflict(_) => "Conflict",
            Error::Validation(_) => "Invalid",
            Error::Unauthorized(_) => "Unauthorized",
            Error::Forbidden(_) => "Forbidden",
            _ => "InternalError",
        }
    }
}
