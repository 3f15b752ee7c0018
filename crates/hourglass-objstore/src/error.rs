//! Error types for the object store client.

use thiserror::Error;

/// Errors that can occur when talking to an object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP request failed before a response arrived (connect, timeout, reset).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("object store returned {status}{}: {message}", code_suffix(.code))]
    Status {
        /// HTTP status code.
        status: u16,
        /// S3 error code from the XML body, when present.
        code: Option<String>,
        /// Error message or raw body.
        message: String,
    },

    /// The credentials were rejected for this operation.
    #[error("permission denied on {resource}: {message}")]
    PermissionDenied { resource: String, message: String },

    /// The target bucket does not exist.
    #[error("bucket not found: {0}")]
    NoSuchBucket(String),

    /// Endpoint, credentials or names are unusable.
    #[error("invalid object store configuration: {0}")]
    InvalidConfig(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref()
        .map(|code| format!(" ({})", code))
        .unwrap_or_default()
}

impl StoreError {
    /// Whether retrying the same request could succeed.
    ///
    /// Connectivity problems, server-side errors and permission errors are
    /// retryable; a broken configuration is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::PermissionDenied { .. } | Self::NoSuchBucket(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::InvalidConfig(_) => false,
        }
    }
}
