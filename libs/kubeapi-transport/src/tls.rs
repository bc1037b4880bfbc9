//! rustls configuration for API server connections.
//!
//! Server trust is one of three mutually exclusive modes (verification
//! disabled, a pinned CA bundle, or the OS trust store), followed by an
//! optional client identity for mutual TLS. Native roots are loaded once per
//! process and cached.

use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use crate::error::ConfigurationError;
use crate::options::{ClientCertificate, ConnectionOptions};

/// Always stores Ok; an empty vec means no certs were found (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

#[cfg(test)]
static LOAD_COUNT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    LOAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }

    result.certs
}

/// Cached native root certificates (may be empty).
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Process-wide default provider if one is installed, aws-lc-rs otherwise.
///
/// Never installs a global default.
pub fn get_crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Parse every certificate in a PEM bundle. An input with no certificate
/// blocks is rejected.
pub(crate) fn parse_certificates(
    pem: &str,
) -> Result<Vec<CertificateDer<'static>>, ConfigurationError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigurationError::InvalidCertificate(e.to_string()))?;
    if certs.is_empty() {
        return Err(ConfigurationError::InvalidCertificate(
            "no PEM certificate found".to_owned(),
        ));
    }
    Ok(certs)
}

/// Parse the first private key (PKCS#8, PKCS#1 or SEC1) of a PEM document.
pub(crate) fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, ConfigurationError> {
    // The pem error can echo input bytes, so it is not forwarded.
    PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(|_| {
        ConfigurationError::InvalidCertificate("private key is not a valid PEM key".to_owned())
    })
}

fn pinned_roots(ca_pem: &str) -> Result<RootCertStore, ConfigurationError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| ConfigurationError::InvalidCertificate(e.to_string()))?;
    }
    Ok(roots)
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native_root_certs().iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    roots
}

fn client_identity(
    identity: &ClientCertificate,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ConfigurationError> {
    let chain = parse_certificates(&identity.certificate_pem)?;
    let key = identity
        .private_key_pem
        .as_ref()
        .filter(|key| !key.is_blank())
        .ok_or(ConfigurationError::MissingPrivateKey)?;
    Ok((chain, parse_private_key(key.expose())?))
}

/// Build the rustls client configuration for `options`.
///
/// `allow_insecure_transport` wins over `trusted_ca_certificate` when both
/// are set.
///
/// # Errors
///
/// Returns [`ConfigurationError`] if certificate material does not parse or
/// rustls rejects the resulting configuration.
pub fn build_client_config(options: &ConnectionOptions) -> Result<ClientConfig, ConfigurationError> {
    let provider = get_crypto_provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigurationError::Tls(e.to_string()))?;

    let builder = if options.allow_insecure_transport {
        tracing::warn!(
            target: "kubeapi_transport::security",
            "server certificate verification is disabled; the API server identity is not checked"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(provider)))
    } else if let Some(ca) = &options.trusted_ca_certificate {
        tracing::debug!("pinning server trust to the configured CA bundle");
        builder.with_root_certificates(pinned_roots(ca)?)
    } else {
        tracing::debug!("using OS trust store for server verification");
        builder.with_root_certificates(native_roots())
    };

    match &options.client_certificate {
        Some(identity) => {
            let (chain, key) = client_identity(identity)?;
            tracing::debug!("presenting client certificate during TLS handshake");
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| ConfigurationError::Tls(e.to_string()))
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Verifier used when `allow_insecure_transport` is set: any server
/// certificate is accepted, handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
