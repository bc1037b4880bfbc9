use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

use crate::error::TransportError;

/// Maximum body preview kept for error results (8 KiB).
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// Type-erased response body after the decompression layer.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Incremental view of a response body, one item per received chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response returned by [`RequestBuilder::send`](crate::RequestBuilder::send).
///
/// `send()` succeeds for every HTTP status; the caller decides what a
/// non-2xx status means. Buffered reads enforce the transport's body size
/// limit, [`into_byte_stream`](Self::into_byte_stream) does not buffer.
#[derive(Debug)]
pub struct TransportResponse {
    pub(crate) inner: Response<ResponseBody>,
    pub(crate) max_body_size: usize,
}

impl TransportResponse {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// `Content-Type` header, if present and ASCII.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.inner
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Read the whole body.
    ///
    /// # Errors
    /// Returns `TransportError::BodyTooLarge` if the body exceeds the limit,
    /// or `TransportError::Transport` if reading fails.
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        read_body_limited(self.inner, self.max_body_size).await
    }

    /// Read and parse the body as JSON, whatever the status.
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes), plus `TransportError::Json`.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, TransportError> {
        let body = self.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Read at most [`ERROR_BODY_PREVIEW_LIMIT`] bytes for an error report.
    ///
    /// An oversized body yields a placeholder instead of failing, so the
    /// status is never hidden behind a size error.
    ///
    /// # Errors
    /// Returns `TransportError::Transport` if reading fails.
    pub async fn error_preview(self) -> Result<String, TransportError> {
        let limit = self.max_body_size.min(ERROR_BODY_PREVIEW_LIMIT);
        match read_body_limited(self.inner, limit).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(TransportError::BodyTooLarge { .. }) => {
                Ok("<body too large for preview>".to_owned())
            }
            Err(e) => Err(e),
        }
    }

    /// Body as a stream of chunks, read from the network on demand.
    ///
    /// No size limit is applied here; streaming consumers bound their own
    /// framing.
    #[must_use]
    pub fn into_byte_stream(self) -> ByteStream {
        self.inner
            .into_body()
            .into_data_stream()
            .map_err(TransportError::Transport)
            .boxed()
    }
}

/// Collect a body, failing once more than `limit` bytes arrive.
///
/// Counts decompressed bytes, which guards against compression bombs.
pub async fn read_body_limited(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<Bytes, TransportError> {
    let mut body = std::pin::pin!(response.into_body());
    let mut collected = Vec::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(TransportError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(TransportError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}
