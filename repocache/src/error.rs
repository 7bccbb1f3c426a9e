//! Error types for the proxy engine.
//!
//! Every failure the engine can produce is one [`ProxyError`] variant. The
//! variants follow how callers react to them:
//!
//! - `InvalidRequest` / `UnknownBackend` - client errors, answered with 400
//! - `ResourceUnavailable` - upstream confirmed absence, try the next mirror
//! - `Io` / `Transfer` / `IncompleteTransfer` - retried on the next mirror
//!   while nothing has been sent to the client yet
//! - `Initialization` - misconfiguration; the mirror is skipped or startup aborts
//! - `InvalidPackageName` - tolerated, the object just has no version metadata

use std::io;

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors that can occur while serving a repository request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request path is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No backend could be resolved for the request.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// The upstream confirmed the resource does not exist.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Local storage or stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transport failed for a reason other than absence.
    #[error("transfer from {url} failed: {reason}")]
    Transfer { url: String, reason: String },

    /// The upstream declared more (or fewer) bytes than it delivered.
    #[error("incomplete transfer from {url}: received {received} of {expected} bytes")]
    IncompleteTransfer {
        url: String,
        expected: u64,
        received: u64,
    },

    /// Misconfiguration, e.g. an unsupported URL scheme or a bad proxy URL.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// A filename does not match the configured package pattern.
    #[error("invalid package name: {0}")]
    InvalidPackageName(String),

    /// Two packages of different families were compared.
    #[error("cannot compare packages of different families: {left} / {right}")]
    PackageFamilyMismatch { left: String, right: String },
}

impl ProxyError {
    /// Creates a transfer error for the given URL.
    pub fn transfer(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transfer {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error belongs to the I/O class.
    ///
    /// I/O errors are retried on the next mirror as long as no response
    /// bytes have been committed to the client.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Transfer { .. } | Self::IncompleteTransfer { .. }
        )
    }

    /// HTTP status the request boundary answers with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::UnknownBackend(_) => StatusCode::BAD_REQUEST,
            Self::ResourceUnavailable(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
