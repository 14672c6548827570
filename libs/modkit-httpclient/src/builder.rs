use crate::client::{ClientInner, HttpClient};
use crate::config::{HttpClientConfig, TlsRootConfig};
use crate::error::HttpClientError;
use crate::events::{EventHub, RequestEvent, RequestListener, ResponseEvent, ResponseListener};
use crate::hyper_transport::HyperTransport;
use crate::request::{DataType, Timeout};
use crate::ssrf::AddressChecker;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

/// Builder for constructing an [`HttpClient`].
///
/// Starts from [`HttpClientConfig::default`], a normalized raw config
/// section ([`from_raw`](Self::from_raw)) or an explicit config. Listeners
/// registered here run before any added later through the client.
pub struct HttpClientBuilder {
    config: HttpClientConfig,
    transport: Option<Arc<dyn Transport>>,
    address_checker: Option<Arc<dyn AddressChecker>>,
    request_listeners: Vec<RequestListener>,
    response_listeners: Vec<ResponseListener>,
}

impl HttpClientBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HttpClientConfig::default())
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: HttpClientConfig) -> Self {
        Self {
            config,
            transport: None,
            address_checker: None,
            request_listeners: Vec::new(),
            response_listeners: Vec::new(),
        }
    }

    /// Create a builder from a raw `httpclient` config section.
    ///
    /// Legacy keys are renamed and agent settings are normalized first.
    ///
    /// # Errors
    /// Returns [`HttpClientError::Config`] if the section is structurally invalid
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, HttpClientError> {
        Ok(Self::with_config(HttpClientConfig::from_raw(raw)?))
    }

    /// Set the default per-request timeout
    #[must_use]
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.config.request.timeout = timeout.into();
        self
    }

    /// Set the default retry budget and delay between attempts
    #[must_use]
    pub fn retry(mut self, retry: u32, retry_delay: Duration) -> Self {
        self.config.request.retry = retry;
        self.config.request.retry_delay = retry_delay;
        self
    }

    /// Set the default response decoding
    #[must_use]
    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.config.request.data_type = Some(data_type);
        self
    }

    /// Add a header sent on every request unless the call overrides it
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.request.headers.insert(name.into(), value.into());
        self
    }

    /// Set the user agent string
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the maximum response body size
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Set the queue capacity in front of each connection pool
    ///
    /// Minimum value is 1 (values less than 1 are clamped to 1).
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity;
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, tls_roots: TlsRootConfig) -> Self {
        self.config.tls_roots = tls_roots;
        self
    }

    /// Select the HTTP/2-capable client variant
    #[must_use]
    pub fn use_http_client_next(mut self, enabled: bool) -> Self {
        self.config.use_http_client_next = enabled;
        self
    }

    /// Negotiate HTTP/2 over TLS; implies the HTTP/2-capable variant
    #[must_use]
    pub fn allow_h2(mut self, enabled: bool) -> Self {
        self.config.allow_h2 = enabled;
        self
    }

    /// Base URL of the troubleshooting links appended to transport errors
    #[must_use]
    pub fn faq_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.faq_base_url = url.into();
        self
    }

    /// Write `x-trace-id`/`x-rpc-id` from the resolved tracer on every request
    #[must_use]
    pub fn propagate_trace_headers(mut self, enabled: bool) -> Self {
        self.config.propagate_trace_headers = enabled;
        self
    }

    /// Replace the hyper transport, e.g. with a recording double in tests
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Address policy consulted by [`HttpClient::safe_curl`]
    #[must_use]
    pub fn check_address(mut self, checker: impl AddressChecker + 'static) -> Self {
        self.address_checker = Some(Arc::new(checker));
        self
    }

    #[must_use]
    pub fn on_request<F>(mut self, listener: F) -> Self
    where
        F: Fn(&mut RequestEvent<'_>) + Send + Sync + 'static,
    {
        self.request_listeners.push(Arc::new(listener));
        self
    }

    #[must_use]
    pub fn on_response<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ResponseEvent<'_>) + Send + Sync + 'static,
    {
        self.response_listeners.push(Arc::new(listener));
        self
    }

    /// Build the client.
    ///
    /// Without an explicit [`transport`](Self::transport) this creates the
    /// hyper pools and must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails or the user agent is invalid
    pub fn build(self) -> Result<HttpClient, HttpClientError> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(&self.config)?),
        };

        let events = EventHub::default();
        if self.config.propagate_trace_headers {
            events.on_request(Arc::new(|event: &mut RequestEvent<'_>| {
                let tracer = Arc::clone(event.tracer());
                tracer.inject_headers(&mut event.args.headers);
            }));
        }
        for listener in self.request_listeners {
            events.on_request(listener);
        }
        for listener in self.response_listeners {
            events.on_response(listener);
        }

        tracing::debug!(
            flavor = ?transport.flavor(),
            request_timeout_ms = self.config.request.timeout.reported_millis(),
            guarded = self.address_checker.is_some(),
            "httpclient built"
        );

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport,
                events,
                address_checker: self.address_checker,
            }),
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::DEFAULT_USER_AGENT;
    use crate::transport::TransportFlavor;
    use serde_json::json;

    #[test]
    fn test_builder_default() {
        let builder = HttpClientBuilder::new();
        assert_eq!(builder.config.request.timeout, Timeout::from_millis(5000));
        assert_eq!(builder.config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(builder.config.buffer_capacity, 1024);
        assert!(builder.transport.is_none());
    }

    #[test]
    fn test_builder_from_raw_normalizes() {
        let builder = HttpClientBuilder::from_raw(&json!({
            "request": { "timeout": 1000 },
            "httpAgent": { "freeSocketKeepAliveTimeout": 1002 }
        }))
        .unwrap();
        assert_eq!(builder.config.request.timeout, Timeout::from_millis(1000));
        assert_eq!(
            builder.config.http_agent.free_socket_timeout,
            Duration::from_millis(1002)
        );
    }

    #[test]
    fn test_builder_from_raw_rejects_non_object() {
        let err = HttpClientBuilder::from_raw(&json!("nope")).err().unwrap();
        assert!(matches!(err, HttpClientError::Config(_)));
    }

    #[test]
    fn test_builder_setters() {
        let builder = HttpClientBuilder::new()
            .timeout(Duration::from_millis(250))
            .retry(2, Duration::from_millis(10))
            .data_type(DataType::Json)
            .default_header("x-app", "billing")
            .user_agent("custom/1.0")
            .max_body_size(1024)
            .use_http_client_next(true)
            .faq_base_url("https://docs.internal/faq");

        let config = &builder.config;
        assert_eq!(config.request.timeout, Timeout::from_millis(250));
        assert_eq!(config.request.retry, 2);
        assert_eq!(config.request.data_type, Some(DataType::Json));
        assert_eq!(config.request.headers["x-app"], "billing");
        assert_eq!(config.user_agent, "custom/1.0");
        assert_eq!(config.max_body_size, 1024);
        assert_eq!(config.flavor(), TransportFlavor::Next);
        assert_eq!(config.faq_base_url, "https://docs.internal/faq");
    }

    #[tokio::test]
    async fn test_build_with_hyper_transport() {
        let client = HttpClientBuilder::new().allow_h2(true).build().unwrap();
        assert_eq!(client.flavor(), TransportFlavor::Next);
    }

    #[tokio::test]
    async fn test_build_invalid_user_agent() {
        let err = HttpClientBuilder::new()
            .user_agent("bad\nagent")
            .build()
            .unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidHeaderValue(_)));
    }
}
