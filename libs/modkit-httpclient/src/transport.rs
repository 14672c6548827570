//! Transport capability consumed by the request pipeline.
//!
//! A transport performs exactly one HTTP exchange. Connection pooling, DNS,
//! TLS and protocol framing all live behind this trait; the pipeline above
//! never touches them.

use crate::response::ResponseBody;
use crate::tracer::Tracer;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use std::error::Error as StdError;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error type used across transport boundaries
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Which client variant a transport implements.
///
/// The variants report an elapsed per-request budget differently, so the
/// pipeline maps timeouts according to the flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFlavor {
    /// HTTP/1.1 keep-alive agents
    Classic,
    /// HTTP/2-capable client
    Next,
}

/// Normalized request descriptor handed to a [`Transport`]
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Tracer of the logical call this exchange belongs to
    pub tracer: Arc<Tracer>,
    /// Address accepted by the SSRF check; when set, the exchange connects
    /// to this address only and must not resolve the host again
    pub pinned_addr: Option<SocketAddr>,
    /// Budget for obtaining a connection (connect part of a split timeout)
    pub connect_timeout: Option<Duration>,
}

impl TransportRequest {
    /// Unguarded request without a connect budget
    #[must_use]
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        tracer: Arc<Tracer>,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            tracer,
            pinned_addr: None,
            connect_timeout: None,
        }
    }
}

/// Response descriptor produced by a [`Transport`]
#[derive(Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl TransportResponse {
    /// Build a response from an in-memory body
    #[must_use]
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = Full::new(body.into())
            .map_err(|never| -> BoxError { match never {} })
            .boxed();
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            body,
        }
    }
}

/// Performs a single HTTP exchange.
///
/// Implementations must be safe to call concurrently; any pool bookkeeping is
/// serialized internally.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Client variant, used to pick the timeout error kind
    fn flavor(&self) -> TransportFlavor;

    /// Execute one exchange
    ///
    /// # Errors
    /// Returns [`TransportError`] tagged with a low-level code when the
    /// exchange fails before a response head is received.
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Transport-level failure tagged with an OS-style code (`ECONNREFUSED`, ...)
pub struct TransportError {
    code: String,
    message: String,
    source: Option<BoxError>,
    connect_timeout: Option<Duration>,
}

impl TransportError {
    /// Code used when no better classification is available
    pub const UNKNOWN: &'static str = "EUNKNOWN";

    /// Create an error with an explicit code and message
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: None,
            connect_timeout: None,
        }
    }

    /// No connection was obtained within `limit`
    #[must_use]
    pub fn connect_timeout(limit: Duration) -> Self {
        Self {
            connect_timeout: Some(limit),
            ..Self::new(
                "ETIMEDOUT",
                format!("connect timeout for {}ms", limit.as_millis()),
            )
        }
    }

    /// Attach the underlying cause
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Classify an arbitrary error by walking its source chain.
    ///
    /// The first `std::io::Error` found decides the code; resolver failures
    /// map to `ENOTFOUND`.
    #[must_use]
    pub fn from_error(err: BoxError) -> Self {
        let code = classify(err.as_ref());
        let message = describe(err.as_ref());
        Self {
            code: code.to_owned(),
            message,
            source: Some(err),
            connect_timeout: None,
        }
    }

    /// Low-level code, without the `httpclient_` prefix
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Original message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Connect budget that elapsed, when this is a connect timeout
    #[must_use]
    pub fn elapsed_connect_budget(&self) -> Option<Duration> {
        self.connect_timeout
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("source", &self.source)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

fn classify(err: &(dyn StdError + 'static)) -> &'static str {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return io_error_code(io);
        }
        // hyper-util reports resolver failures as a connect error named "dns error"
        if e.to_string() == "dns error" {
            return "ENOTFOUND";
        }
        current = e.source();
    }
    TransportError::UNKNOWN
}

/// Join the messages of the whole source chain
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        let part = e.to_string();
        if !message.contains(&part) {
            message.push_str(": ");
            message.push_str(&part);
        }
        current = e.source();
    }
    message
}

/// Map an I/O error onto its POSIX-style name
#[must_use]
pub fn io_error_code(err: &std::io::Error) -> &'static str {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionRefused => "ECONNREFUSED",
        ErrorKind::ConnectionReset => "ECONNRESET",
        ErrorKind::ConnectionAborted => "ECONNABORTED",
        ErrorKind::NetworkUnreachable => "ENETUNREACH",
        ErrorKind::HostUnreachable => "EHOSTUNREACH",
        ErrorKind::TimedOut => "ETIMEDOUT",
        ErrorKind::AddrInUse => "EADDRINUSE",
        ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        ErrorKind::BrokenPipe => "EPIPE",
        ErrorKind::NotConnected => "ENOTCONN",
        _ => TransportError::UNKNOWN,
    }
}
