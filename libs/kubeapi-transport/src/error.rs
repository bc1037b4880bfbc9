use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Invalid [`ConnectionOptions`](crate::ConnectionOptions).
///
/// Raised by `validate()` and by everything that validates on the way in
/// (transport construction, in-cluster bootstrap). Always fatal, always
/// produced before any network I/O. Messages never contain credential
/// material.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigurationError {
    #[error("endpoint is not set")]
    MissingEndpoint,

    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("default namespace must not be blank")]
    BlankNamespace,

    #[error("access token cannot be used as a header value")]
    InvalidAccessToken,

    #[error("client certificate was supplied without a private key")]
    MissingPrivateKey,

    #[error("invalid certificate material: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration failed: {0}")]
    Tls(String),

    #[error("environment variable {0} is not set")]
    MissingEnvironment(&'static str),

    #[error("failed to read {}: {source}", path.display())]
    Bootstrap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while executing a request through a [`Transport`](crate::Transport).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("invalid request URL '{url}': {reason}")]
    InvalidUri { url: String, reason: String },

    /// The server did not produce response headers in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Network level failure (connect, TLS handshake, reset, truncated body).
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Request queue is full; the request was never sent.
    #[error("transport overloaded: request queue is full")]
    Overloaded,

    /// The transport worker is gone, usually because the owning client was disposed.
    #[error("transport closed")]
    ServiceClosed,
}

impl TransportError {
    /// Whether the same request may succeed if issued again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transport(_) | Self::Overloaded
        )
    }
}

impl From<hyper::Error> for TransportError {
    fn from(err: hyper::Error) -> Self {
        TransportError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for TransportError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        TransportError::Transport(Box::new(err))
    }
}
