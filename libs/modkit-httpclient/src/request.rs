use crate::config::RequestDefaults;
use crate::error::HttpClientError;
use crate::response::HttpResponse;
use crate::tracer::{RequestContext, Tracer};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How the response body is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// UTF-8 text
    Text,
    /// Parsed JSON value; an empty body yields `null`
    Json,
    /// Unbuffered body stream
    Stream,
    /// Raw bytes
    #[default]
    Raw,
}

impl DataType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Stream => "stream",
            Self::Raw => "raw",
        }
    }
}

/// Per-request timeout budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TimeoutRepr", into = "TimeoutRepr")]
pub enum Timeout {
    /// One budget for the whole exchange
    Single(Duration),
    /// Separate connect and response budgets
    Split { connect: Duration, response: Duration },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TimeoutRepr {
    Millis(u64),
    Split([u64; 2]),
}

impl From<TimeoutRepr> for Timeout {
    fn from(repr: TimeoutRepr) -> Self {
        match repr {
            TimeoutRepr::Millis(ms) => Self::from_millis(ms),
            TimeoutRepr::Split([connect, response]) => Self::Split {
                connect: Duration::from_millis(connect),
                response: Duration::from_millis(response),
            },
        }
    }
}

impl From<Timeout> for TimeoutRepr {
    fn from(timeout: Timeout) -> Self {
        match timeout {
            Timeout::Single(d) => Self::Millis(millis(d)),
            Timeout::Split { connect, response } => Self::Split([millis(connect), millis(response)]),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::Single(duration)
    }
}

impl Timeout {
    #[must_use]
    pub fn from_millis(ms: u64) -> Self {
        Self::Single(Duration::from_millis(ms))
    }

    /// Wall-clock budget of one attempt
    #[must_use]
    pub fn attempt_budget(&self) -> Duration {
        match *self {
            Self::Single(d) => d,
            Self::Split { connect, response } => connect.saturating_add(response),
        }
    }

    /// Budget for obtaining a connection, set only by a split timeout
    #[must_use]
    pub fn connect_budget(&self) -> Option<Duration> {
        match *self {
            Self::Single(_) => None,
            Self::Split { connect, .. } => Some(connect),
        }
    }

    /// Budget named in timeout errors (the response part of a split timeout)
    #[must_use]
    pub fn reported_millis(&self) -> u64 {
        match *self {
            Self::Single(d) => millis(d),
            Self::Split { response, .. } => millis(response),
        }
    }
}

pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Request payload
#[derive(Debug, Clone, PartialEq)]
pub enum RequestData {
    /// Sent as is
    Bytes(Bytes),
    /// UTF-8 text (`text/plain`)
    Text(String),
    /// JSON document (`application/json`)
    Json(serde_json::Value),
    /// Already URL-encoded form (`application/x-www-form-urlencoded`)
    Form(String),
}

impl RequestData {
    /// Encode into the wire body
    ///
    /// # Errors
    /// Returns [`HttpClientError::Json`] if the JSON document cannot be serialized.
    pub fn encode(&self) -> Result<Bytes, HttpClientError> {
        Ok(match self {
            Self::Bytes(bytes) => bytes.clone(),
            Self::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Self::Json(value) => Bytes::from(serde_json::to_vec(value)?),
            Self::Form(form) => Bytes::copy_from_slice(form.as_bytes()),
        })
    }

    /// `Content-Type` sent when the caller set none
    #[must_use]
    pub fn default_content_type(&self) -> Option<HeaderValue> {
        match self {
            Self::Bytes(_) => None,
            Self::Text(_) => Some(HeaderValue::from_static("text/plain; charset=utf-8")),
            Self::Json(_) => Some(HeaderValue::from_static("application/json")),
            Self::Form(_) => Some(HeaderValue::from_static(
                "application/x-www-form-urlencoded",
            )),
        }
    }
}

/// Decides after each attempt whether another one should run
pub type RetryPredicate =
    Arc<dyn Fn(&Result<HttpResponse, HttpClientError>) -> bool + Send + Sync>;

/// Caller value returned unchanged on the response
pub type Opaque = Arc<dyn Any + Send + Sync>;

/// Per-call options layered over the client's request defaults.
///
/// Header parsing errors are deferred and reported when the call starts.
///
/// # Example
///
/// ```ignore
/// let options = RequestOptions::new()
///     .method(Method::POST)
///     .header("x-request-id", "abc123")
///     .json(&serde_json::json!({ "name": "Alice" }))
///     .data_type(DataType::Json)
///     .timeout(Duration::from_millis(500))
///     .retry(2);
/// let res = client.request("https://api.example.com/users", options).await?;
/// ```
#[derive(Default)]
#[must_use]
pub struct RequestOptions {
    pub(crate) method: Option<Method>,
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) data: Option<RequestData>,
    pub(crate) data_type: Option<DataType>,
    pub(crate) timeout: Option<Timeout>,
    pub(crate) retry: Option<u32>,
    pub(crate) retry_delay: Option<Duration>,
    pub(crate) is_retry: Option<RetryPredicate>,
    pub(crate) ctx: Option<RequestContext>,
    pub(crate) tracer: Option<Arc<Tracer>>,
    pub(crate) opaque: Option<Opaque>,
    /// Error captured during building (deferred to the call)
    pub(crate) error: Option<HttpClientError>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Add a single header; call values override client defaults
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }

        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => self.headers.push((name, value)),
            (Err(e), _) => self.error = Some(HttpClientError::InvalidHeaderName(e)),
            (_, Err(e)) => self.error = Some(HttpClientError::InvalidHeaderValue(e)),
        }
        self
    }

    /// Add multiple headers
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self = self.header(name.as_ref(), value.as_ref());
        }
        self
    }

    /// Shortcut for the `Content-Type` header
    pub fn content_type(self, content_type: &str) -> Self {
        self.header(CONTENT_TYPE.as_str(), content_type)
    }

    pub fn data(mut self, data: RequestData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn body(self, body: impl Into<Bytes>) -> Self {
        self.data(RequestData::Bytes(body.into()))
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.data(RequestData::Text(text.into()))
    }

    /// Serialize `value` as the JSON request body
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => self.data(RequestData::Json(value)),
            Err(e) => {
                self.error.get_or_insert(HttpClientError::Json(e));
                self
            }
        }
    }

    /// URL-encode `value` as the form request body
    pub fn form<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_urlencoded::to_string(value) {
            Ok(form) => self.data(RequestData::Form(form)),
            Err(e) => {
                self.error.get_or_insert(HttpClientError::FormEncode(e));
                self
            }
        }
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Extra attempts allowed after the first one
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn is_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<HttpResponse, HttpClientError>) -> bool + Send + Sync + 'static,
    {
        self.is_retry = Some(Arc::new(predicate));
        self
    }

    pub fn ctx(mut self, ctx: RequestContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn tracer(mut self, tracer: Arc<Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn opaque(mut self, opaque: Opaque) -> Self {
        self.opaque = Some(opaque);
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("data_type", &self.data_type)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("is_retry", &self.is_retry.is_some())
            .field("ctx", &self.ctx)
            .field("tracer", &self.tracer)
            .field("opaque", &self.opaque.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// Effective options of one call after merging over the client defaults.
///
/// Request listeners receive this by mutable reference; header changes are
/// sent on every attempt that follows.
pub struct RequestArgs {
    pub method: Method,
    pub headers: HeaderMap,
    pub data: Option<RequestData>,
    pub data_type: DataType,
    pub timeout: Timeout,
    pub retry: u32,
    pub retry_delay: Duration,
    pub is_retry: Option<RetryPredicate>,
    pub ctx: Option<RequestContext>,
    pub tracer: Arc<Tracer>,
    pub opaque: Option<Opaque>,
}

impl RequestArgs {
    /// Layer `options` over `defaults`: headers are merged with call values
    /// winning, every other field is replaced when the call sets it.
    ///
    /// Always yields args so the call's events can fire. The second value is
    /// the first problem found (deferred option error, invalid default header
    /// or method); the call fails with it instead of reaching the transport.
    pub(crate) fn merge(
        defaults: &RequestDefaults,
        mut options: RequestOptions,
        tracer: Arc<Tracer>,
    ) -> (Self, Option<HttpClientError>) {
        let mut error = options.error.take();

        let method = match (options.method, defaults.method.as_deref()) {
            (Some(method), _) => method,
            (None, Some(method)) => Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .unwrap_or_else(|e| {
                    keep_first(&mut error, e);
                    Method::GET
                }),
            (None, None) => Method::GET,
        };

        let mut headers = HeaderMap::with_capacity(defaults.headers.len() + options.headers.len());
        for (name, value) in &defaults.headers {
            match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                (Err(e), _) => keep_first(&mut error, e),
                (_, Err(e)) => keep_first(&mut error, e),
            }
        }
        // first call value replaces the default, later ones append
        let mut overridden: Vec<HeaderName> = Vec::new();
        for (name, value) in options.headers {
            if overridden.contains(&name) {
                headers.append(name, value);
            } else {
                headers.insert(name.clone(), value);
                overridden.push(name);
            }
        }

        if let Some(content_type) = options.data.as_ref().and_then(RequestData::default_content_type)
            && !headers.contains_key(CONTENT_TYPE)
        {
            headers.insert(CONTENT_TYPE, content_type);
        }

        let args = Self {
            method,
            headers,
            data: options.data,
            data_type: options
                .data_type
                .or(defaults.data_type)
                .unwrap_or_default(),
            timeout: options.timeout.unwrap_or(defaults.timeout),
            retry: options.retry.unwrap_or(defaults.retry),
            retry_delay: options.retry_delay.unwrap_or(defaults.retry_delay),
            is_retry: options.is_retry,
            ctx: options.ctx,
            tracer,
            opaque: options.opaque,
        };
        (args, error)
    }
}

impl fmt::Debug for RequestArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestArgs")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("data_type", &self.data_type)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("is_retry", &self.is_retry.is_some())
            .field("ctx", &self.ctx)
            .field("tracer", &self.tracer)
            .field("opaque", &self.opaque.is_some())
            .finish()
    }
}

fn keep_first(slot: &mut Option<HttpClientError>, err: impl Into<HttpClientError>) {
    if slot.is_none() {
        *slot = Some(err.into());
    }
}

/// Reject URLs without an `http://` or `https://` prefix
pub fn validate_url(url: &str) -> Result<http::Uri, HttpClientError> {
    let invalid = || HttpClientError::InvalidUrl {
        url: url.to_owned(),
    };
    let lower = url.get(..8).unwrap_or(url).to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(invalid());
    }
    let uri: http::Uri = url.parse().map_err(|_| invalid())?;
    if uri.host().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    Ok(uri)
}
