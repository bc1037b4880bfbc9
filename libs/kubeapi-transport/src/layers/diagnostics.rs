use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, SET_COOKIE};
use http::{HeaderMap, Request, Response};
use http_body::Frame;
use http_body_util::{BodyExt, Full};
use pin_project_lite::pin_project;
use tower::{Layer, Service};

use crate::error::TransportError;
use crate::options::DiagnosticsLevel;
use crate::response::{ERROR_BODY_PREVIEW_LIMIT, ResponseBody};

/// Log target for all diagnostics output.
pub const DIAGNOSTICS_TARGET: &str = "kubeapi_transport::diagnostics";

const REDACTED: &str = "[REDACTED]";

macro_rules! diag {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            DiagnosticsLevel::Trace => tracing::trace!(target: DIAGNOSTICS_TARGET, $($arg)+),
            DiagnosticsLevel::Debug => tracing::debug!(target: DIAGNOSTICS_TARGET, $($arg)+),
            DiagnosticsLevel::Info => tracing::info!(target: DIAGNOSTICS_TARGET, $($arg)+),
        }
    };
}

/// What the diagnostics layer records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    pub headers: bool,
    pub payloads: bool,
    pub level: DiagnosticsLevel,
}

impl DiagnosticsConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.headers || self.payloads
    }
}

/// Tower layer that logs requests and responses.
///
/// Headers are logged when `headers` is set, with credential headers and
/// values marked sensitive replaced by `[REDACTED]`. Bodies are logged only
/// when `payloads` is set: the request body before it is sent, the response
/// body chunk by chunk as the caller reads it. Response bodies are never
/// buffered, so watch streams stay incremental.
#[derive(Clone, Debug)]
pub struct DiagnosticsLayer {
    config: DiagnosticsConfig,
}

impl DiagnosticsLayer {
    #[must_use]
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for DiagnosticsLayer {
    type Service = DiagnosticsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DiagnosticsService {
            inner,
            config: self.config,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DiagnosticsService<S> {
    inner: S,
    config: DiagnosticsConfig,
}

impl<S> Service<Request<Full<Bytes>>> for DiagnosticsService<S>
where
    S: Service<
            Request<Full<Bytes>>,
            Response = Response<ResponseBody>,
            Error = TransportError,
        > + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<ResponseBody>;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        let config = self.config;

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let method = req.method().clone();
            let uri = req.uri().clone();

            diag!(config.level, method = %method, uri = %uri, "sending request");
            if config.headers {
                diag!(config.level, headers = %redact_headers(req.headers()), "request headers");
            }

            let req = if config.payloads {
                let (parts, body) = req.into_parts();
                let bytes = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(never) => match never {},
                };
                diag!(config.level, body = %preview(&bytes), "request body");
                Request::from_parts(parts, Full::new(bytes))
            } else {
                req
            };

            let response = match inner.call(req).await {
                Ok(response) => response,
                Err(err) => {
                    diag!(config.level, method = %method, uri = %uri, error = %err, "request failed");
                    return Err(err);
                }
            };

            diag!(
                config.level,
                method = %method,
                uri = %uri,
                status = response.status().as_u16(),
                "received response"
            );
            if config.headers {
                diag!(config.level, headers = %redact_headers(response.headers()), "response headers");
            }

            if config.payloads {
                let (parts, body) = response.into_parts();
                let logged = LoggedBody {
                    inner: body,
                    level: config.level,
                };
                Ok(Response::from_parts(parts, logged.boxed()))
            } else {
                Ok(response)
            }
        })
    }
}

fn is_credential_header(name: &http::HeaderName) -> bool {
    name == AUTHORIZATION || name == PROXY_AUTHORIZATION || name == COOKIE || name == SET_COOKIE
}

/// Render headers as `name: value` pairs with credentials hidden.
fn redact_headers(headers: &HeaderMap) -> String {
    let mut rendered = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        let value = if value.is_sensitive() || is_credential_header(name) {
            REDACTED
        } else {
            value.to_str().unwrap_or("<non-ascii>")
        };
        rendered.push(format!("{name}: {value}"));
    }
    rendered.join(", ")
}

fn preview(bytes: &[u8]) -> String {
    if bytes.len() > ERROR_BODY_PREVIEW_LIMIT {
        let head = String::from_utf8_lossy(&bytes[..ERROR_BODY_PREVIEW_LIMIT]);
        format!("{head}... ({} bytes total)", bytes.len())
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

pin_project! {
    /// Response body that logs each data frame as it is polled.
    struct LoggedBody {
        #[pin]
        inner: ResponseBody,
        level: DiagnosticsLevel,
    }
}

impl http_body::Body for LoggedBody {
    type Data = Bytes;
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled
            && let Some(data) = frame.data_ref()
        {
            diag!(*this.level, chunk = %preview(data), "response body");
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
