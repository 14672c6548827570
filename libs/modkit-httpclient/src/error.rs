use crate::config::ConfigError;
use crate::request::DataType;
use crate::ssrf::{AddressFamily, GuardError};
use crate::transport::{BoxError, TransportError, TransportFlavor};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::net::IpAddr;
use thiserror::Error;

/// Stable classification of [`HttpClientError`] for callers that branch on failure type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// URL does not start with `http://` or `https://`
    InvalidUrl,
    /// Low-level network failure reported by the transport
    Transport,
    /// Response did not complete within the per-request budget (classic transport)
    ResponseTimeout,
    /// Request did not complete within the per-request budget (next transport)
    RequestTimeout,
    /// Body could not be interpreted as the declared `dataType`
    ResponseFormat,
    /// SSRF guard refused the resolved address
    SecurityRejected,
    /// Client configuration was structurally invalid
    Config,
    /// TLS setup failed at construction
    Tls,
    /// Header name or value could not be parsed
    InvalidHeader,
    /// Request body could not be encoded
    RequestEncode,
    /// Response body exceeded the configured size limit
    BodyTooLarge,
    /// Request descriptor could not be assembled
    RequestBuild,
}

/// Response that was received but could not be accepted.
///
/// Nested inside format errors so callers can inspect what the server sent.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub data: Bytes,
}

/// Public error taxonomy of the HTTP client
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// URL is missing the `http://`/`https://` scheme or is otherwise unusable
    #[error("url should start with http, but got {url}")]
    InvalidUrl { url: String },

    /// Network failure with a stable `httpclient_<OS_CODE>` code.
    ///
    /// The message is the transport's original message with a documentation
    /// link appended.
    #[error("{message}")]
    Transport {
        code: String,
        message: String,
        #[source]
        source: TransportError,
    },

    /// Per-request timeout elapsed (classic transport)
    #[error("Response timeout for {timeout_ms}ms")]
    ResponseTimeout { timeout_ms: u64 },

    /// Per-request timeout elapsed (HTTP/2-capable transport)
    #[error("Request timeout for {timeout_ms} ms")]
    RequestTimeout { timeout_ms: u64 },

    /// Body could not be interpreted as `data_type`
    #[error("{message}")]
    ResponseFormat {
        data_type: DataType,
        message: String,
        response: Box<ErrorResponse>,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// SSRF guard rejected the resolved target address
    #[error("request to {host} rejected by address check: {ip} is not allowed")]
    SecurityRejected {
        host: String,
        ip: IpAddr,
        family: AddressFamily,
    },

    /// Invalid client configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Invalid HTTP method
    #[error("Invalid method: {0}")]
    InvalidMethod(#[from] http::method::InvalidMethod),

    /// JSON request body serialization failed
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Form URL encoding failed
    #[error("Form encoding failed: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },
}

impl HttpClientError {
    /// Classification for programmatic matching
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::ResponseTimeout { .. } => ErrorKind::ResponseTimeout,
            Self::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            Self::ResponseFormat { .. } => ErrorKind::ResponseFormat,
            Self::SecurityRejected { .. } => ErrorKind::SecurityRejected,
            Self::Config(_) => ErrorKind::Config,
            Self::Tls(_) => ErrorKind::Tls,
            Self::InvalidHeaderName(_) | Self::InvalidHeaderValue(_) => ErrorKind::InvalidHeader,
            Self::Json(_) | Self::FormEncode(_) => ErrorKind::RequestEncode,
            Self::BodyTooLarge { .. } => ErrorKind::BodyTooLarge,
            Self::InvalidMethod(_) | Self::RequestBuild(_) => ErrorKind::RequestBuild,
        }
    }

    /// Stable error name, as reported to log and metrics collaborators
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "InvalidURLError",
            Self::ResponseTimeout { .. } => "ResponseTimeoutError",
            Self::RequestTimeout { .. } => "HttpClientRequestTimeoutError",
            Self::ResponseFormat { data_type, .. } => match data_type {
                DataType::Json => "JSONResponseFormatError",
                DataType::Text => "TEXTResponseFormatError",
                DataType::Stream | DataType::Raw => "ResponseFormatError",
            },
            Self::SecurityRejected { .. } => "SecurityRejectedError",
            Self::Config(_) => "HttpClientConfigError",
            _ => "HttpClientError",
        }
    }

    /// Machine-readable `httpclient_<OS_CODE>` code for transport failures
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transport { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Received-but-rejected response, when the failure originated from one
    #[must_use]
    pub fn response(&self) -> Option<&ErrorResponse> {
        match self {
            Self::ResponseFormat { response, .. } => Some(response),
            _ => None,
        }
    }

    /// True for both timeout variants
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ResponseTimeout { .. } | Self::RequestTimeout { .. }
        )
    }
}

/// Map a transport failure into the public taxonomy.
///
/// The stable code is `httpclient_<CODE>` and the documentation link for that
/// code is appended to the original message.
pub fn from_transport(err: TransportError, faq_base_url: &str) -> HttpClientError {
    let code = format!("httpclient_{}", err.code());
    let message = format!(
        "{} [ {}/{} ]",
        err.message(),
        faq_base_url.trim_end_matches('/'),
        code
    );
    HttpClientError::Transport {
        code,
        message,
        source: err,
    }
}

/// Map an elapsed per-request budget to the variant the transport flavor reports.
pub fn from_elapsed(flavor: TransportFlavor, timeout_ms: u64) -> HttpClientError {
    match flavor {
        TransportFlavor::Classic => HttpClientError::ResponseTimeout { timeout_ms },
        TransportFlavor::Next => HttpClientError::RequestTimeout { timeout_ms },
    }
}

/// Map an SSRF guard failure into the public taxonomy.
pub fn from_guard(err: GuardError, faq_base_url: &str) -> HttpClientError {
    match err {
        GuardError::Rejected { host, ip, family } => {
            HttpClientError::SecurityRejected { host, ip, family }
        }
        GuardError::Resolve(err) => from_transport(err, faq_base_url),
    }
}
