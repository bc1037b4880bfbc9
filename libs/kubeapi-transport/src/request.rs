use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Request, Response};
use http_body_util::Full;
use serde::Serialize;
use tower::Service;

use crate::error::TransportError;
use crate::response::{ResponseBody, TransportResponse};
use crate::transport::{BufferedService, map_buffer_error, try_acquire_buffer_slot};

const APPLICATION_JSON: &str = "application/json";

/// Request under construction.
///
/// Created by [`Transport::request`](crate::Transport::request). Header and
/// body errors are deferred and reported by [`send`](Self::send).
#[must_use = "RequestBuilder does nothing until .send() is called"]
pub struct RequestBuilder {
    service: BufferedService,
    max_body_size: usize,
    method: http::Method,
    url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
    error: Option<TransportError>,
}

impl RequestBuilder {
    pub(crate) fn new(
        service: BufferedService,
        max_body_size: usize,
        method: http::Method,
        url: String,
    ) -> Self {
        Self {
            service,
            max_body_size,
            method,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
            error: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match HeaderValue::try_from(value) {
            Ok(value) => self.headers.push((name, value)),
            Err(e) => self.error = Some(TransportError::InvalidHeaderValue(e)),
        }
        self
    }

    /// Serialize `body` as the request payload.
    ///
    /// `Content-Type: application/json` is added unless a content type was
    /// set explicitly, which lets PATCH requests pick their patch flavour.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        if self.error.is_some() {
            return self;
        }
        match serde_json::to_vec(body) {
            Ok(bytes) => {
                self.body = Bytes::from(bytes);
                if !self.has_header(&CONTENT_TYPE) {
                    self.headers
                        .push((CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON)));
                }
            }
            Err(e) => self.error = Some(TransportError::Json(e)),
        }
        self
    }

    /// Raw body, sent as is. Set `Content-Type` with [`header`](Self::header).
    pub fn body_bytes(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    fn has_header(&self, name: &HeaderName) -> bool {
        self.headers.iter().any(|(n, _)| n == name)
    }

    fn parse_uri(&self) -> Result<http::Uri, TransportError> {
        let uri: http::Uri = self
            .url
            .parse()
            .map_err(|e: http::uri::InvalidUri| TransportError::InvalidUri {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        if uri.authority().is_none() {
            return Err(TransportError::InvalidUri {
                url: self.url.clone(),
                reason: "missing host/authority".to_owned(),
            });
        }
        Ok(uri)
    }

    /// Send the request.
    ///
    /// Resolves once response headers arrive; the body is read later through
    /// the returned [`TransportResponse`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if building the request failed, the
    /// request queue is full, the request timed out, or the network failed.
    /// HTTP error statuses are not errors here.
    pub async fn send(mut self) -> Result<TransportResponse, TransportError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }

        let uri = self.parse_uri()?;
        let mut builder = Request::builder().method(self.method).uri(uri);
        if !self.headers.iter().any(|(n, _)| n == ACCEPT) {
            builder = builder.header(ACCEPT, APPLICATION_JSON);
        }
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        let request = builder.body(Full::new(self.body))?;

        try_acquire_buffer_slot(&mut self.service).await?;

        let inner: Response<ResponseBody> =
            self.service.call(request).await.map_err(map_buffer_error)?;

        Ok(TransportResponse {
            inner,
            max_body_size: self.max_body_size,
        })
    }
}
