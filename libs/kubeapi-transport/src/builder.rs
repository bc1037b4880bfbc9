use std::time::Duration;

use bytes::Bytes;
use http::Response;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::buffer::Buffer;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

use crate::error::{ConfigurationError, TransportError};
use crate::layers::{BearerAuthLayer, DiagnosticsConfig, DiagnosticsLayer};
use crate::options::ConnectionOptions;
use crate::response::ResponseBody;
use crate::tls;
use crate::transport::{BufferedService, Transport};

/// Default number of requests that may wait for the buffer worker.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

const POOL_MAX_IDLE_PER_HOST: usize = 32;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

type InnerService =
    BoxCloneService<http::Request<Full<Bytes>>, http::Response<ResponseBody>, TransportError>;

/// Turns [`ConnectionOptions`] into a [`Transport`].
///
/// The builder works on its own copy of the options. Building performs no
/// network I/O.
#[derive(Debug)]
pub struct TransportBuilder {
    options: ConnectionOptions,
    buffer_capacity: usize,
}

impl TransportBuilder {
    #[must_use]
    pub fn new(options: &ConnectionOptions) -> Self {
        Self {
            options: options.clone(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Maximum number of queued requests; clamped to at least 1.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// Validate the options and compose the transport.
    ///
    /// Layer stack, outer to inner:
    ///
    /// ```text
    /// Buffer → Diagnostics? → BearerAuth? → Timeout → Decompression → hyper (rustls)
    /// ```
    ///
    /// Diagnostics wraps everything else so it sees each request exactly as
    /// the caller issued it and the response as the caller will read it. The
    /// timeout bounds the wait for response headers only; streaming bodies
    /// are not cut off.
    ///
    /// Must be called within a Tokio runtime (the buffer worker is spawned
    /// here).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if validation fails or TLS material is
    /// rejected.
    pub fn build(self) -> Result<Transport, ConfigurationError> {
        let options = self.options;
        options.validate()?;

        let endpoint = options.endpoint_url()?;
        if endpoint.scheme() == "http" {
            tracing::warn!(
                target: "kubeapi_transport::security",
                endpoint = %endpoint,
                "plain HTTP endpoint configured; API traffic will NOT be encrypted"
            );
        }

        let tls_config = tls::build_client_config(&options)?;
        let https = build_https_connector(tls_config);

        let mut client_builder = Client::builder(TokioExecutor::new());
        // pool_timer is required for pool_idle_timeout to take effect.
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT);
        let hyper_client = client_builder.build::<_, Full<Bytes>>(https);

        let timeout = options.request_timeout;
        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .layer(DecompressionLayer::new())
            .service(hyper_client)
            .map_response(map_decompression_response)
            .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

        let mut boxed: InnerService = service.boxed_clone();

        if let Some(token) = &options.access_token {
            boxed = ServiceBuilder::new()
                .layer(BearerAuthLayer::new(token.clone()))
                .service(boxed)
                .boxed_clone();
        }

        let diagnostics = DiagnosticsConfig {
            headers: options.log_headers,
            payloads: options.log_payloads,
            level: options.log_level,
        };
        if diagnostics.is_enabled() {
            boxed = ServiceBuilder::new()
                .layer(DiagnosticsLayer::new(diagnostics))
                .service(boxed)
                .boxed_clone();
        }

        tracing::debug!(
            endpoint = %endpoint,
            bearer = options.access_token.is_some(),
            client_certificate = options.client_certificate.is_some(),
            pinned_ca = options.trusted_ca_certificate.is_some(),
            insecure = options.allow_insecure_transport,
            diagnostics = diagnostics.is_enabled(),
            "built API transport"
        );

        let service: BufferedService = Buffer::new(boxed, self.buffer_capacity);
        Ok(Transport {
            service,
            max_body_size: options.max_body_size,
        })
    }
}

/// Map tower errors to `TransportError`, keeping typed errors from inner layers.
fn map_tower_error(err: tower::BoxError, timeout: Duration) -> TransportError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return TransportError::Timeout(timeout);
    }
    match err.downcast::<TransportError>() {
        Ok(err) => *err,
        Err(other) => TransportError::Transport(other),
    }
}

fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    let boxed: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, boxed)
}

/// HTTPS connector that also accepts `http://` endpoints (warned about in
/// `build`). ALPN advertises both h2 and http/1.1.
fn build_https_connector(tls_config: rustls::ClientConfig) -> HttpsConnector<HttpConnector> {
    hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_all_versions()
        .build()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::secret::SecretString;
    use http::Method;
    use httpmock::prelude::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::layer::SubscriberExt;
    use url::Url;

    #[derive(Clone, Default)]
    struct WarningCapture {
        warnings: Arc<Mutex<Vec<String>>>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                let mut visitor = MessageVisitor(String::new());
                event.record(&mut visitor);
                self.warnings.lock().unwrap().push(visitor.0);
            }
        }
    }

    struct MessageVisitor(String);

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    fn warnings_while(f: impl FnOnce()) -> Vec<String> {
        let capture = WarningCapture::default();
        let warnings = capture.warnings.clone();
        let subscriber = tracing_subscriber::registry().with(capture);
        tracing::subscriber::with_default(subscriber, f);
        let captured = warnings.lock().unwrap().clone();
        captured
    }

    #[tokio::test]
    async fn invalid_options_fail_before_io() {
        let err = TransportBuilder::new(&ConnectionOptions::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingEndpoint));
    }

    #[tokio::test]
    async fn builder_keeps_its_own_copy() {
        let mut options = ConnectionOptions::for_endpoint("https://kube.example.com");
        let builder = TransportBuilder::new(&options);
        options.endpoint = None;
        builder.build().unwrap();
    }

    #[tokio::test]
    async fn buffer_capacity_zero_is_clamped() {
        let builder = TransportBuilder::new(&ConnectionOptions::for_endpoint(
            "https://kube.example.com",
        ))
        .buffer_capacity(0);
        assert_eq!(builder.buffer_capacity, 1);
        builder.build().unwrap();
    }

    #[tokio::test]
    async fn plain_http_endpoint_warns() {
        let warnings = warnings_while(|| {
            _ = TransportBuilder::new(&ConnectionOptions::for_endpoint("http://127.0.0.1:8001"))
                .build();
        });
        assert!(
            warnings.iter().any(|w| w.contains("plain HTTP")),
            "expected plain HTTP warning, got {warnings:?}"
        );
    }

    #[tokio::test]
    async fn insecure_transport_warns() {
        let options = ConnectionOptions {
            allow_insecure_transport: true,
            ..ConnectionOptions::for_endpoint("https://kube.example.com")
        };
        let warnings = warnings_while(|| {
            _ = TransportBuilder::new(&options).build();
        });
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("verification is disabled")),
            "expected insecure warning, got {warnings:?}"
        );
    }

    #[tokio::test]
    async fn https_endpoint_with_pinned_ca_does_not_warn() {
        let options = ConnectionOptions {
            trusted_ca_certificate: Some(include_str!("../testdata/client.crt").to_owned()),
            ..ConnectionOptions::for_endpoint("https://kube.example.com")
        };
        let warnings = warnings_while(|| {
            _ = TransportBuilder::new(&options).build();
        });
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    }

    #[tokio::test]
    async fn bearer_token_is_attached() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/namespaces/default/pods")
                .header("authorization", "Bearer sa-token");
            then.status(200).body(r#"{"kind":"PodList","items":[]}"#);
        });

        let options = ConnectionOptions {
            access_token: Some(SecretString::new("sa-token")),
            ..ConnectionOptions::for_endpoint(server.base_url())
        };
        let transport = TransportBuilder::new(&options).build().unwrap();
        let url = Url::parse(&server.url("/api/v1/namespaces/default/pods")).unwrap();
        let resp = transport.request(Method::GET, &url).send().await.unwrap();

        assert_eq!(resp.status(), http::StatusCode::OK);
        mock.assert();
    }

    #[tokio::test]
    async fn no_token_means_no_authorization_header() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/version").header_missing("authorization");
            then.status(200).body("{}");
        });

        let transport =
            TransportBuilder::new(&ConnectionOptions::for_endpoint(server.base_url()))
                .build()
                .unwrap();
        let url = Url::parse(&server.url("/version")).unwrap();
        transport.request(Method::GET, &url).send().await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn gzip_responses_are_decompressed() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"kind":"PodList","items":[]}"#).unwrap();
        let compressed = encoder.finish().unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/pods");
            then.status(200)
                .header("content-encoding", "gzip")
                .header("content-type", "application/json")
                .body(compressed);
        });

        let transport =
            TransportBuilder::new(&ConnectionOptions::for_endpoint(server.base_url()))
                .build()
                .unwrap();
        let url = Url::parse(&server.url("/api/v1/pods")).unwrap();
        let value: serde_json::Value = transport
            .request(Method::GET, &url)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(value["kind"], "PodList");
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_millis(500)).body("{}");
        });

        let options = ConnectionOptions {
            request_timeout: Duration::from_millis(50),
            ..ConnectionOptions::for_endpoint(server.base_url())
        };
        let transport = TransportBuilder::new(&options).build().unwrap();
        let url = Url::parse(&server.url("/slow")).unwrap();
        let err = transport.request(Method::GET, &url).send().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_millis(50)));
    }

    #[test]
    fn tower_elapsed_maps_to_timeout() {
        let err: tower::BoxError = Box::new(tower::timeout::error::Elapsed::new());
        assert!(matches!(
            map_tower_error(err, Duration::from_secs(3)),
            TransportError::Timeout(_)
        ));
    }

    #[test]
    fn typed_errors_survive_boxing() {
        let err: tower::BoxError = Box::new(TransportError::Overloaded);
        assert!(matches!(
            map_tower_error(err, Duration::from_secs(3)),
            TransportError::Overloaded
        ));
    }
}
