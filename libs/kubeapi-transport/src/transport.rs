use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::Full;
use tower::Service;
use tower::buffer::Buffer;
use url::Url;

use crate::builder::TransportBuilder;
use crate::error::{ConfigurationError, TransportError};
use crate::options::ConnectionOptions;
use crate::request::RequestBuilder;
use crate::response::ResponseBody;

pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, TransportError>> + Send>>;

/// `Buffer<Req, F>` over the boxed layer stack.
pub type BufferedService = Buffer<Request<Full<Bytes>>, ServiceFuture>;

/// HTTP execution capability bound to one API server.
///
/// Carries the authentication, trust and diagnostics chosen at build time.
/// `Transport` is `Clone + Send + Sync`; clones share one connection pool
/// and one buffer worker, and many requests may be in flight at once
/// without external locking. The worker shuts down, and pooled connections
/// close, once the last clone is dropped.
#[derive(Clone)]
pub struct Transport {
    pub(crate) service: BufferedService,
    pub(crate) max_body_size: usize,
}

impl Transport {
    /// Shorthand for `TransportBuilder::new(options).build()`.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] if the options do not validate.
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, ConfigurationError> {
        TransportBuilder::new(options).build()
    }

    /// Start a request for `url`.
    ///
    /// `url` must be absolute; it is normally produced by expanding a
    /// request template against the configured endpoint.
    pub fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        RequestBuilder::new(
            self.service.clone(),
            self.max_body_size,
            method,
            url.as_str().to_owned(),
        )
    }

    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("max_body_size", &self.max_body_size)
            .finish_non_exhaustive()
    }
}

/// Recover the typed error from a buffer failure.
///
/// Anything that is not a [`TransportError`] means the worker is gone.
pub fn map_buffer_error(err: tower::BoxError) -> TransportError {
    match err.downcast::<TransportError>() {
        Ok(err) => *err,
        Err(err) => {
            tracing::debug!(error = %err, "transport buffer worker closed");
            TransportError::ServiceClosed
        }
    }
}

/// Reserve a buffer slot without waiting.
///
/// A full buffer yields `TransportError::Overloaded` instead of queueing.
pub async fn try_acquire_buffer_slot(
    service: &mut BufferedService,
) -> Result<(), TransportError> {
    use std::task::Poll;

    let poll_result = std::future::poll_fn(|cx| match service.poll_ready(cx) {
        Poll::Ready(result) => Poll::Ready(Some(result)),
        Poll::Pending => Poll::Ready(None),
    })
    .await;

    match poll_result {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(map_buffer_error(e)),
        None => Err(TransportError::Overloaded),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn transport_for(server: &MockServer) -> Transport {
        Transport::from_options(&ConnectionOptions::for_endpoint(server.base_url())).unwrap()
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_transport() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/v1/namespaces");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"kind":"NamespaceList","items":[]}"#);
        });

        let transport = transport_for(&server);
        let url = Url::parse(&server.url("/api/v1/namespaces")).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let transport = transport.clone();
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                transport.request(Method::GET, &url).send().await.unwrap().status()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), http::StatusCode::OK);
        }
        mock.assert_calls(8);
    }

    #[tokio::test]
    async fn non_success_status_is_not_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/namespaces/default/pods/missing");
            then.status(404).body(r#"{"kind":"Status","code":404}"#);
        });

        let transport = transport_for(&server);
        let url = Url::parse(&server.url("/api/v1/namespaces/default/pods/missing")).unwrap();
        let resp = transport.request(Method::GET, &url).send().await.unwrap();

        assert_eq!(resp.status(), http::StatusCode::NOT_FOUND);
        assert!(resp.error_preview().await.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn connection_refused_is_a_transport_error() {
        let transport =
            Transport::from_options(&ConnectionOptions::for_endpoint("http://127.0.0.1:1"))
                .unwrap();
        let url = Url::parse("http://127.0.0.1:1/api").unwrap();
        let err = transport.request(Method::GET, &url).send().await.unwrap_err();
        assert!(err.is_transient(), "expected transient error, got {err:?}");
    }
}
