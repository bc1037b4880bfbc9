#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Connection options and HTTP transport for the Kubernetes API client.
//!
//! [`ConnectionOptions`] describe one API server: endpoint, default
//! namespace, credentials, trust material and diagnostics flags.
//! [`TransportBuilder`] validates them and composes a hyper/rustls client
//! with:
//! - bearer token injection (`Authorization: Bearer <token>`)
//! - server trust: verification disabled, a pinned CA bundle, or the OS
//!   trust store (in that order of precedence)
//! - client certificates for mutual TLS
//! - opt-in diagnostics logging of headers and payloads
//! - transparent response decompression and a per-request timeout
//!
//! The resulting [`Transport`] is cheap to clone and safe to share between
//! tasks.
//!
//! # Example
//!
//! ```ignore
//! use kubeapi_transport::{ConnectionOptions, Transport};
//!
//! let options = ConnectionOptions::from_pod_service_account()?;
//! let transport = Transport::from_options(&options)?;
//! let url = options.endpoint_url()?.join("version")?;
//! let version: serde_json::Value = transport
//!     .request(http::Method::GET, &url)
//!     .send()
//!     .await?
//!     .json()
//!     .await?;
//! ```

mod builder;
mod error;
mod layers;
mod options;
mod request;
mod response;
mod secret;
pub mod tls;
mod transport;

pub use builder::{DEFAULT_BUFFER_CAPACITY, TransportBuilder};
pub use error::{ConfigurationError, TransportError};
pub use layers::{
    BearerAuthLayer, BearerAuthService, DIAGNOSTICS_TARGET, DiagnosticsConfig, DiagnosticsLayer,
    DiagnosticsService,
};
pub use options::{
    ClientCertificate, ConnectionOptions, DEFAULT_MAX_BODY_SIZE, DEFAULT_NAMESPACE,
    DEFAULT_REQUEST_TIMEOUT, DiagnosticsLevel, SERVICE_ACCOUNT_DIR,
};
pub use request::RequestBuilder;
pub use response::{ByteStream, ERROR_BODY_PREVIEW_LIMIT, ResponseBody, TransportResponse};
pub use secret::SecretString;
pub use transport::Transport;
