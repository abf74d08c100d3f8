use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the remote-call layer.
///
/// Classification into transient vs. permanent happens here, once, when the
/// error is produced. Downstream code only calls [`TransportError::is_transient`]
/// and never re-classifies.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    ConnectionReset(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("bucket '{0}' does not exist on the remote endpoint")]
    BucketNotFound(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("operation not supported by endpoint: {0}")]
    Unsupported(String),

    #[error("remote call failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the retry engine should retry this failure.
    ///
    /// Unknown kinds are permanent: failing closed beats retrying an
    /// unclassified error indefinitely.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::ConnectionReset(_)
                | TransportError::Dns(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum FloodError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed staged path: {}", .0.display())]
    MalformedPath(PathBuf),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filesystem watch error: {0}")]
    Watch(#[from] notify::Error),
}
