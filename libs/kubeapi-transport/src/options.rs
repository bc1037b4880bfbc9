use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use url::Url;

use crate::error::ConfigurationError;
use crate::secret::SecretString;
use crate::tls;

/// Namespace used when neither the caller nor the resource names one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default per-request timeout for obtaining response headers.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound for buffered bodies and single watch lines (16 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Well-known location of the pod service-account credentials.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";

/// Verbosity used by the diagnostics layer for headers and payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticsLevel {
    Trace,
    #[default]
    Debug,
    Info,
}

/// PEM-encoded client identity presented during the TLS handshake.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientCertificate {
    pub certificate_pem: String,
    /// Required whenever the certificate is supplied.
    pub private_key_pem: Option<SecretString>,
}

/// Everything needed to talk to one API server.
///
/// Build it directly, deserialize it from application config, or derive it
/// from the pod environment with [`from_pod_service_account`]. The registry
/// keeps its own clone, so later changes to the caller's copy have no effect
/// on a transport that was already built.
///
/// `Debug` is manually implemented to redact credential material.
///
/// [`from_pod_service_account`]: Self::from_pod_service_account
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Absolute `http` or `https` URI of the API server.
    pub endpoint: Option<String>,
    pub default_namespace: String,
    /// Bearer token attached as `Authorization: Bearer <token>`.
    pub access_token: Option<SecretString>,
    pub client_certificate: Option<ClientCertificate>,
    /// PEM bundle the server certificate must chain to.
    pub trusted_ca_certificate: Option<String>,
    /// Disables server certificate verification entirely.
    pub allow_insecure_transport: bool,
    pub log_headers: bool,
    /// Bodies may carry secrets; they are logged only when this is set.
    pub log_payloads: bool,
    pub log_level: DiagnosticsLevel,
    /// Humantime string when deserialized, e.g. `"45s"`.
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
    pub max_body_size: usize,
}

impl ConnectionOptions {
    /// Options pointing at `endpoint` with everything else defaulted.
    #[must_use]
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Check the options are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if:
    /// - the endpoint is missing, relative, or not `http`/`https`,
    /// - the default namespace is blank,
    /// - the access token cannot be sent as a header value,
    /// - a client certificate has no private key, or certificate material
    ///   does not parse.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.endpoint_url()?;

        if self.default_namespace.trim().is_empty() {
            return Err(ConfigurationError::BlankNamespace);
        }

        if let Some(token) = &self.access_token {
            let value = zeroize::Zeroizing::new(format!("Bearer {}", token.expose()));
            if token.is_blank() || http::HeaderValue::from_str(&value).is_err() {
                return Err(ConfigurationError::InvalidAccessToken);
            }
        }

        if let Some(identity) = &self.client_certificate {
            let key = identity
                .private_key_pem
                .as_ref()
                .filter(|key| !key.is_blank())
                .ok_or(ConfigurationError::MissingPrivateKey)?;
            tls::parse_certificates(&identity.certificate_pem)?;
            tls::parse_private_key(key.expose())?;
        }

        // Skipped when verification is off: the bundle is never used then.
        if let Some(ca) = &self.trusted_ca_certificate
            && !self.allow_insecure_transport
        {
            tls::parse_certificates(ca)?;
        }

        Ok(())
    }

    /// Parsed endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingEndpoint`] or
    /// [`ConfigurationError::InvalidEndpoint`].
    pub fn endpoint_url(&self) -> Result<Url, ConfigurationError> {
        let raw = self
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigurationError::MissingEndpoint)?;

        let invalid = |reason: &str| ConfigurationError::InvalidEndpoint {
            endpoint: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let url = Url::parse(raw).map_err(|e| match e {
            url::ParseError::RelativeUrlWithoutBase => invalid("endpoint must be absolute"),
            other => invalid(&other.to_string()),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("only http:// and https:// endpoints are supported"));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("endpoint has no host"));
        }

        Ok(url)
    }

    /// Options for a process running inside a pod.
    ///
    /// Reads `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` and the
    /// mounted service-account `token`, `ca.crt` and `namespace` files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingEnvironment`] outside a pod,
    /// [`ConfigurationError::Bootstrap`] if a credential file cannot be read,
    /// or any validation error.
    pub fn from_pod_service_account() -> Result<Self, ConfigurationError> {
        let host = std::env::var(SERVICE_HOST_ENV)
            .map_err(|_| ConfigurationError::MissingEnvironment(SERVICE_HOST_ENV))?;
        let port = std::env::var(SERVICE_PORT_ENV)
            .map_err(|_| ConfigurationError::MissingEnvironment(SERVICE_PORT_ENV))?;
        Self::from_service_account_dir(Path::new(SERVICE_ACCOUNT_DIR), &host, &port)
    }

    /// Same as [`from_pod_service_account`](Self::from_pod_service_account)
    /// with an explicit credentials directory and service address.
    ///
    /// A missing or blank `namespace` file falls back to
    /// [`DEFAULT_NAMESPACE`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Bootstrap`] if `token` or `ca.crt`
    /// cannot be read, or any validation error.
    pub fn from_service_account_dir(
        dir: &Path,
        host: &str,
        port: &str,
    ) -> Result<Self, ConfigurationError> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read_to_string(&path)
                .map_err(|source| ConfigurationError::Bootstrap { path, source })
        };

        let token = SecretString::new(read("token")?.trim());
        let ca = read("ca.crt")?;
        let namespace = match read("namespace") {
            Ok(ns) if !ns.trim().is_empty() => ns.trim().to_owned(),
            Ok(_) => DEFAULT_NAMESPACE.to_owned(),
            Err(ConfigurationError::Bootstrap { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                DEFAULT_NAMESPACE.to_owned()
            }
            Err(e) => return Err(e),
        };

        let host = host.trim();
        let endpoint = if host.contains(':') && !host.starts_with('[') {
            format!("https://[{host}]:{}", port.trim())
        } else {
            format!("https://{host}:{}", port.trim())
        };

        let options = Self {
            endpoint: Some(endpoint),
            default_namespace: namespace,
            access_token: Some(token),
            trusted_ca_certificate: Some(ca),
            ..Self::default()
        };
        options.validate()?;

        tracing::debug!(
            endpoint = options.endpoint.as_deref().unwrap_or_default(),
            namespace = %options.default_namespace,
            "loaded in-cluster connection options"
        );
        Ok(options)
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            default_namespace: DEFAULT_NAMESPACE.to_owned(),
            access_token: None,
            client_certificate: None,
            trusted_ca_certificate: None,
            allow_insecure_transport: false,
            log_headers: false,
            log_payloads: false,
            log_level: DiagnosticsLevel::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// `Debug` redacts the token and private key.
impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("endpoint", &self.endpoint)
            .field("default_namespace", &self.default_namespace)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("client_certificate", &self.client_certificate)
            .field(
                "trusted_ca_certificate",
                &self.trusted_ca_certificate.as_ref().map(|_| "<pem>"),
            )
            .field("allow_insecure_transport", &self.allow_insecure_transport)
            .field("log_headers", &self.log_headers)
            .field("log_payloads", &self.log_payloads)
            .field("log_level", &self.log_level)
            .field("request_timeout", &self.request_timeout)
            .field("max_body_size", &self.max_body_size)
            .finish()
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}
