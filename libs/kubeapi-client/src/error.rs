use http::StatusCode;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kubeapi_transport::{ConfigurationError, TransportError};
use thiserror::Error;

/// Errors raised while expanding a request template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateError {
    #[error("malformed request template '{template}': {reason}")]
    Malformed { template: String, reason: String },

    #[error("request template '{template}' requires parameter '{name}'")]
    MissingParameter { template: String, name: String },

    #[error("cannot expand template against base URL: {0}")]
    InvalidBase(String),
}

/// Errors returned by the resource clients and watch streams.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KubeClientError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The server answered with a non-success status.
    ///
    /// `body` holds at most 8 KiB of the response; `api_status` is set when
    /// that body was a Kubernetes `Status` object.
    #[error("request failed with HTTP {status}: {body}")]
    RequestFailed {
        status: StatusCode,
        body: String,
        api_status: Option<Box<Status>>,
    },

    #[error("client has been disposed")]
    Disposed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection error: {0}")]
    Connection(#[from] TransportError),

    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    /// The client cache held a value of another type under this type's key.
    #[error("client cache entry for {0} holds another type")]
    ClientCacheMismatch(&'static str),
}

impl KubeClientError {
    /// Whether repeating the same call may succeed.
    ///
    /// True for transient transport failures, `429 Too Many Requests` and
    /// server-side `5xx` statuses.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_transient(),
            Self::RequestFailed { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }

    /// Kubernetes `Status` carried by a failed request, if any.
    #[must_use]
    pub fn api_status(&self) -> Option<&Status> {
        match self {
            Self::RequestFailed { api_status, .. } => api_status.as_deref(),
            _ => None,
        }
    }

    /// HTTP status of a failed request.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}
