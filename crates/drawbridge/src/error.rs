//! Error types for the proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the proxy
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No frontend registered for the requested server name
    #[error("no frontend for server name {0:?}")]
    NoFrontend(String),

    /// Backend dial or upstream handshake failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Certificate loading or selection failure
    #[error("certificate error: {0}")]
    Certificate(String),

    /// ACME order or account failure
    #[error("ACME error: {0}")]
    Acme(String),

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Whether this error is attributable to a connection peer rather than
    /// the proxy: handshake failures, handshake timeouts and copy-phase I/O.
    ///
    /// Client errors are suppressed in logs unless debug logging is on.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Tls(_) | Error::NoFrontend(_) | Error::Timeout(_)
        )
    }
}
