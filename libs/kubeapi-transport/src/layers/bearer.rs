use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::header::AUTHORIZATION;
use http::{HeaderValue, Request, Response};
use tower::{Layer, Service};

use crate::error::TransportError;
use crate::secret::SecretString;

/// Tower layer that sets `Authorization: Bearer <token>` on every request.
///
/// The header value is marked sensitive so it is never printed by `http`'s
/// `Debug` output or by the diagnostics layer.
#[derive(Clone, Debug)]
pub struct BearerAuthLayer {
    token: SecretString,
}

impl BearerAuthLayer {
    #[must_use]
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuthService {
            inner,
            token: self.token.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BearerAuthService<S> {
    inner: S,
    token: SecretString,
}

impl<S, B, ResBody> Service<Request<B>> for BearerAuthService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>, Error = TransportError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    B: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<ResBody>, TransportError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let raw = zeroize::Zeroizing::new(format!("Bearer {}", self.token.expose()));
        let mut value = match HeaderValue::from_str(&raw) {
            Ok(v) => v,
            Err(e) => return Box::pin(async { Err(TransportError::InvalidHeaderValue(e)) }),
        };
        value.set_sensitive(true);
        req.headers_mut().insert(AUTHORIZATION, value);

        // Call the instance that was poll_ready'd, keep a fresh clone for next time.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move { inner.call(req).await })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Method, StatusCode};
    use http_body_util::Full;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct AssertAuthorization {
        expected: &'static str,
    }

    impl Service<Request<Full<Bytes>>> for AssertAuthorization {
        type Response = Response<Full<Bytes>>;
        type Error = TransportError;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
            let value = req.headers().get(AUTHORIZATION).unwrap();
            assert_eq!(value.to_str().unwrap(), self.expected);
            assert!(value.is_sensitive());
            std::future::ready(Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::new()))
                .unwrap()))
        }
    }

    fn request() -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri("https://kube.example.com/api/v1/namespaces/default/pods")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn injects_sensitive_bearer_header() {
        let layer = BearerAuthLayer::new(SecretString::new("sa-token"));
        let svc = layer.layer(AssertAuthorization {
            expected: "Bearer sa-token",
        });
        let resp = svc.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn replaces_caller_supplied_authorization() {
        let layer = BearerAuthLayer::new(SecretString::new("configured"));
        let svc = layer.layer(AssertAuthorization {
            expected: "Bearer configured",
        });
        let mut req = request();
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        svc.oneshot(req).await.unwrap();
    }

    #[tokio::test]
    async fn token_with_control_characters_fails_the_call() {
        let layer = BearerAuthLayer::new(SecretString::new("bad\ntoken"));
        let svc = layer.layer(AssertAuthorization { expected: "" });
        let err = svc.oneshot(request()).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidHeaderValue(_)));
    }
}
