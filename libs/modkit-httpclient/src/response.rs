use crate::config::DEFAULT_FAQ_BASE_URL;
use crate::error::{ErrorResponse, HttpClientError, from_transport};
use crate::request::{DataType, Opaque};
use crate::transport::{BoxError, TransportError, TransportResponse};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use http_body::Frame;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Maximum body preview embedded in format error messages (8KB).
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// Type-erased body produced by a [`crate::Transport`], already decompressed
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pin_project! {
    /// Body wrapper that enforces size limits during streaming.
    ///
    /// Returned for [`DataType::Stream`] calls. Tracks bytes read and fails
    /// with [`HttpClientError::BodyTooLarge`] once the limit is exceeded.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: usize,
        read: usize,
        faq_base_url: Arc<str>,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
            faq_base_url: Arc::from(DEFAULT_FAQ_BASE_URL),
        }
    }

    #[must_use]
    pub(crate) fn with_faq_base_url(mut self, faq_base_url: &str) -> Self {
        self.faq_base_url = Arc::from(faq_base_url);
        self
    }

    /// Decompressed bytes yielded so far
    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl fmt::Debug for LimitedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitedBody")
            .field("limit", &self.limit)
            .field("read", &self.read)
            .finish_non_exhaustive()
    }
}

impl http_body::Body for LimitedBody {
    type Data = Bytes;
    type Error = HttpClientError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let Some(next) = std::task::ready!(this.inner.poll_frame(cx)) else {
            return Poll::Ready(None);
        };

        let outcome = match next {
            Err(e) => Err(body_error(e, this.faq_base_url)),
            Ok(frame) => {
                *this.read += frame.data_ref().map_or(0, Bytes::len);
                if *this.read > *this.limit {
                    Err(HttpClientError::BodyTooLarge {
                        limit: *this.limit,
                        actual: *this.read,
                    })
                } else {
                    Ok(frame)
                }
            }
        };
        Poll::Ready(Some(outcome))
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }
}

/// Response body interpreted according to the call's [`DataType`]
pub enum ResponseData {
    Text(String),
    Json(serde_json::Value),
    Raw(Bytes),
    Stream(LimitedBody),
}

impl ResponseData {
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Take the body stream of a [`DataType::Stream`] call
    #[must_use]
    pub fn into_stream(self) -> Option<LimitedBody> {
        match self {
            Self::Stream(body) => Some(body),
            _ => None,
        }
    }
}

impl fmt::Debug for ResponseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Raw(bytes) => f.debug_tuple("Raw").field(bytes).finish(),
            Self::Stream(body) => f.debug_tuple("Stream").field(body).finish(),
        }
    }
}

/// Outcome of a successful call
pub struct HttpResponse {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) data: ResponseData,
    pub(crate) url: Uri,
    pub(crate) method: Method,
    pub(crate) opaque: Option<Opaque>,
    pub(crate) elapsed: Duration,
    pub(crate) retries: u32,
}

impl HttpResponse {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn data(&self) -> &ResponseData {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> ResponseData {
        self.data
    }

    /// Requested URL
    #[must_use]
    pub fn url(&self) -> &Uri {
        &self.url
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The caller's opaque value, same allocation as passed in
    #[must_use]
    pub fn opaque(&self) -> Option<&Opaque> {
        self.opaque.as_ref()
    }

    /// Time from the first attempt to the decoded response
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Extra attempts made before this response
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("url", &self.url)
            .field("method", &self.method)
            .field("opaque", &self.opaque.is_some())
            .field("elapsed", &self.elapsed)
            .field("retries", &self.retries)
            .finish()
    }
}

/// Status, headers and interpreted body of one exchange
#[derive(Debug)]
pub struct DecodedResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub data: ResponseData,
}

/// Read and interpret a transport response.
///
/// Buffered data types are read under `max_body_size`. A JSON body that
/// fails to parse becomes a format error carrying the received response.
pub async fn decode(
    response: TransportResponse,
    data_type: DataType,
    max_body_size: usize,
    faq_base_url: &str,
) -> Result<DecodedResponse, HttpClientError> {
    let TransportResponse {
        status,
        version,
        headers,
        body,
    } = response;

    let data = match data_type {
        DataType::Stream => ResponseData::Stream(
            LimitedBody::new(body, max_body_size).with_faq_base_url(faq_base_url),
        ),
        DataType::Raw => {
            ResponseData::Raw(read_body_limited(body, max_body_size, faq_base_url).await?)
        }
        DataType::Text => {
            let bytes = read_body_limited(body, max_body_size, faq_base_url).await?;
            ResponseData::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        DataType::Json => {
            let bytes = read_body_limited(body, max_body_size, faq_base_url).await?;
            match parse_json(&bytes) {
                Ok(value) => ResponseData::Json(value),
                Err(err) => {
                    let preview_end = bytes.len().min(ERROR_BODY_PREVIEW_LIMIT);
                    let message = format!(
                        "{err} (data json format: {:?})",
                        String::from_utf8_lossy(&bytes[..preview_end])
                    );
                    return Err(HttpClientError::ResponseFormat {
                        data_type,
                        message,
                        response: Box::new(ErrorResponse {
                            status,
                            headers,
                            data: bytes,
                        }),
                        source: Some(err),
                    });
                }
            }
        }
    };

    Ok(DecodedResponse {
        status,
        version,
        headers,
        data,
    })
}

fn parse_json(bytes: &[u8]) -> Result<serde_json::Value, serde_json::Error> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(bytes)
}

/// Collect the body, enforcing the byte limit on decompressed data
pub async fn read_body_limited(
    body: ResponseBody,
    limit: usize,
    faq_base_url: &str,
) -> Result<Bytes, HttpClientError> {
    let mut limited = LimitedBody::new(body, limit).with_faq_base_url(faq_base_url);
    let mut buf = bytes::BytesMut::new();
    while let Some(frame) = limited.frame().await {
        if let Ok(chunk) = frame?.into_data() {
            buf.extend_from_slice(&chunk);
        }
    }
    Ok(buf.freeze())
}

/// Body read failures are transport failures of the same exchange
fn body_error(err: BoxError, faq_base_url: &str) -> HttpClientError {
    let err = match err.downcast::<TransportError>() {
        Ok(err) => *err,
        Err(other) => TransportError::from_error(other),
    };
    from_transport(err, faq_base_url)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    fn transport_response(status: u16, body: &'static str) -> TransportResponse {
        TransportResponse::from_bytes(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            body,
        )
    }

    #[tokio::test]
    async fn test_decode_json() {
        let decoded = decode(transport_response(200, r#"{"ok":true}"#), DataType::Json, 1024, "https://x")
            .await
            .unwrap();
        assert_eq!(
            decoded.data.as_json(),
            Some(&serde_json::json!({ "ok": true }))
        );
    }

    #[tokio::test]
    async fn test_decode_empty_json_is_null() {
        let decoded = decode(transport_response(204, ""), DataType::Json, 1024, "https://x")
            .await
            .unwrap();
        assert_eq!(decoded.data.as_json(), Some(&serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_json_format_error_carries_response() {
        let err = decode(
            transport_response(500, "this is an error"),
            DataType::Json,
            1024,
            "https://x",
        )
        .await
        .unwrap_err();

        assert_eq!(err.name(), "JSONResponseFormatError");
        assert!(err.to_string().contains("this is an error"));
        let response = err.response().unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&response.data[..], b"this is an error");
    }

    #[tokio::test]
    async fn test_decode_text_and_raw() {
        let decoded = decode(transport_response(200, "hello"), DataType::Text, 1024, "https://x")
            .await
            .unwrap();
        assert_eq!(decoded.data.as_text(), Some("hello"));

        let decoded = decode(transport_response(200, "hello"), DataType::Raw, 1024, "https://x")
            .await
            .unwrap();
        assert_eq!(decoded.data.as_bytes().map(|b| &b[..]), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_body_too_large() {
        let err = decode(transport_response(200, "0123456789"), DataType::Raw, 4, "https://x")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HttpClientError::BodyTooLarge {
                limit: 4,
                actual: 10
            }
        ));
    }

    #[tokio::test]
    async fn test_stream_is_limited() {
        let decoded = decode(transport_response(200, "0123456789"), DataType::Stream, 4, "https://x")
            .await
            .unwrap();
        let mut body = decoded.data.into_stream().unwrap();
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(matches!(err, HttpClientError::BodyTooLarge { .. }));
        assert_eq!(body.bytes_read(), 10);
    }

    #[tokio::test]
    async fn test_stream_within_limit() {
        let body = Full::new(Bytes::from_static(b"abc"))
            .map_err(|never| -> BoxError { match never {} })
            .boxed();
        let limited = LimitedBody::new(body, 16);
        let bytes = limited.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"abc");
    }

    struct FailingBody;

    impl http_body::Body for FailingBody {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            Poll::Ready(Some(Err(Box::new(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            )))))
        }
    }

    #[tokio::test]
    async fn test_body_read_error_is_transport_error() {
        let err = read_body_limited(FailingBody.boxed(), 1024, "https://faq.example.com")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("httpclient_ECONNRESET"));
        assert!(
            err.to_string()
                .ends_with("[ https://faq.example.com/httpclient_ECONNRESET ]")
        );
    }
}
