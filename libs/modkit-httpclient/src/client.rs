use crate::builder::HttpClientBuilder;
use crate::config::HttpClientConfig;
use crate::error::{HttpClientError, from_elapsed, from_guard, from_transport};
use crate::events::{
    EventHub, ListenerId, RequestEvent, RequestRecord, RequestSnapshot, ResponseEvent,
};
use crate::request::{RequestArgs, RequestData, RequestOptions, millis, validate_url};
use crate::response::{HttpResponse, decode};
use crate::retry::{RetryPolicy, run_with_retry};
use crate::ssrf::{self, AddressChecker};
use crate::tracer;
use crate::transport::{Transport, TransportFlavor, TransportRequest};
use bytes::Bytes;
use http::Uri;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Instrumented HTTP client.
///
/// Every call runs the same pipeline: URL check, option merge over the
/// configured defaults, tracer resolution, `request` event, attempts under
/// the retry policy (each bounded by the per-request timeout), `response`
/// event. Failures surface as [`HttpClientError`].
///
/// Cloning is cheap; clones share the transport, config and listeners.
///
/// # Example
///
/// ```ignore
/// use modkit_httpclient::{HttpClient, RequestOptions, DataType};
///
/// let client = HttpClient::from_raw(&host_config["httpclient"])?;
/// client.on_request(|event| {
///     event.args.headers.insert("x-app", "billing".parse().unwrap());
/// });
///
/// let res = client
///     .request(
///         "https://api.example.com/orders",
///         RequestOptions::new().data_type(DataType::Json).retry(1),
///     )
///     .await?;
/// ```
#[derive(Clone)]
pub struct HttpClient {
    pub(crate) inner: Arc<ClientInner>,
}

pub struct ClientInner {
    pub config: HttpClientConfig,
    pub transport: Arc<dyn Transport>,
    pub events: EventHub,
    pub address_checker: Option<Arc<dyn AddressChecker>>,
}

impl HttpClient {
    /// Client with default configuration over the hyper transport
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails
    pub fn new() -> Result<Self, HttpClientError> {
        HttpClientBuilder::new().build()
    }

    /// Client from a raw `httpclient` config section
    ///
    /// # Errors
    /// Returns [`HttpClientError::Config`] if the section is structurally invalid
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, HttpClientError> {
        HttpClientBuilder::from_raw(raw)?.build()
    }

    #[must_use]
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Normalized configuration in effect
    #[must_use]
    pub fn config(&self) -> &HttpClientConfig {
        &self.inner.config
    }

    /// Client variant of the underlying transport
    #[must_use]
    pub fn flavor(&self) -> TransportFlavor {
        self.inner.transport.flavor()
    }

    /// Register a `request` listener; it may modify the outgoing headers
    pub fn on_request<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&mut RequestEvent<'_>) + Send + Sync + 'static,
    {
        self.inner.events.on_request(Arc::new(listener))
    }

    /// Register a `response` listener, called for successes and failures
    pub fn on_response<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResponseEvent<'_>) + Send + Sync + 'static,
    {
        self.inner.events.on_response(Arc::new(listener))
    }

    /// Returns `false` if the listener was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove(id)
    }

    /// Registered `request` and `response` listeners, built-in ones included
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.events.listener_count()
    }

    /// Perform a request.
    ///
    /// # Errors
    /// Returns [`HttpClientError::InvalidUrl`] before any event fires when
    /// `url` is not `http(s)://`; other failures are reported to `response`
    /// listeners first.
    pub async fn request(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, HttpClientError> {
        self.execute(url, options, None).await
    }

    /// Same as [`request`](Self::request)
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub async fn curl(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, HttpClientError> {
        self.execute(url, options, None).await
    }

    /// Perform a request after checking the resolved target address.
    ///
    /// Each attempt resolves the host and asks the configured
    /// [`AddressChecker`]; a rejected address fails the attempt with
    /// [`HttpClientError::SecurityRejected`] without contacting it.
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub async fn safe_curl(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, HttpClientError> {
        let checker = self.inner.address_checker.as_deref();
        if checker.is_none() {
            tracing::warn!(url, "safe_curl called without an address checker, not guarded");
        }
        self.execute(url, options, checker).await
    }

    async fn execute(
        &self,
        url: &str,
        options: RequestOptions,
        checker: Option<&dyn AddressChecker>,
    ) -> Result<HttpResponse, HttpClientError> {
        let uri = validate_url(url)?;

        let tracer = tracer::resolve(options.tracer.as_ref(), options.ctx.as_ref());
        let (mut args, option_error) =
            RequestArgs::merge(&self.inner.config.request, options, tracer);

        let span = tracing::info_span!(
            "outgoing_http",
            http.method = %args.method,
            http.url = %sanitize_url(&uri),
            otel.kind = "client",
            trace_id = %args.tracer.trace_id(),
            guarded = checker.is_some(),
            http.status_code = tracing::field::Empty,
            retries = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        self.inner
            .events
            .emit_request(&mut RequestEvent { url, args: &mut args });

        let record = RequestRecord {
            url: url.to_owned(),
            options: RequestSnapshot {
                method: args.method.clone(),
                url: uri,
                headers: args.headers.clone(),
                timeout: args.timeout,
                data_type: args.data_type,
            },
            args,
        };

        let started = Instant::now();
        let result = match option_error {
            Some(err) => Err(err),
            None => self
                .run(&record, checker)
                .instrument(span.clone())
                .await
                .map(|mut resp| {
                    resp.elapsed = started.elapsed();
                    resp
                }),
        };

        match &result {
            Ok(resp) => {
                span.record("http.status_code", resp.status().as_u16());
                span.record("retries", resp.retries());
                if resp.status().is_client_error() || resp.status().is_server_error() {
                    span.record("error", true);
                }
            }
            Err(err) => {
                span.record("error", true);
                tracing::debug!(parent: &span, error = %err, kind = ?err.kind(), "request failed");
            }
        }

        self.inner.events.emit_response(&ResponseEvent {
            req: &record,
            res: result.as_ref(),
        });

        result
    }

    async fn run(
        &self,
        record: &RequestRecord,
        checker: Option<&dyn AddressChecker>,
    ) -> Result<HttpResponse, HttpClientError> {
        let args = &record.args;
        let body = args
            .data
            .as_ref()
            .map(RequestData::encode)
            .transpose()?
            .unwrap_or_default();
        let policy = RetryPolicy::from_args(args);
        let flavor = self.inner.transport.flavor();
        let budget = args.timeout.attempt_budget();

        run_with_retry(&policy, |attempt| {
            let body = body.clone();
            async move {
                tracing::debug!(attempt, "sending request");
                match tokio::time::timeout(budget, self.attempt(record, body, checker)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::debug!(attempt, timeout_ms = args.timeout.reported_millis(), "request timed out");
                        Err(from_elapsed(flavor, args.timeout.reported_millis()))
                    }
                }
            }
        })
        .await
    }

    /// One guarded exchange, decoded per the call's data type
    async fn attempt(
        &self,
        record: &RequestRecord,
        body: Bytes,
        checker: Option<&dyn AddressChecker>,
    ) -> Result<HttpResponse, HttpClientError> {
        let config = &self.inner.config;
        let args = &record.args;
        let uri = &record.options.url;

        let pinned_addr = match checker {
            Some(checker) => Some(
                ssrf::guard(uri, checker)
                    .await
                    .map_err(|e| from_guard(e, &config.faq_base_url))?,
            ),
            None => None,
        };

        let mut request = TransportRequest::new(
            args.method.clone(),
            uri.clone(),
            args.headers.clone(),
            body,
            Arc::clone(&args.tracer),
        );
        request.pinned_addr = pinned_addr;
        request.connect_timeout = args.timeout.connect_budget();

        let response = self
            .inner
            .transport
            .execute(request)
            .await
            .map_err(|e| match e.elapsed_connect_budget() {
                Some(limit) => from_elapsed(self.flavor(), millis(limit)),
                None => from_transport(e, &config.faq_base_url),
            })?;

        let decoded = decode(
            response,
            args.data_type,
            config.max_body_size,
            &config.faq_base_url,
        )
        .await?;

        Ok(HttpResponse {
            status: decoded.status,
            version: decoded.version,
            headers: decoded.headers,
            data: decoded.data,
            url: uri.clone(),
            method: args.method.clone(),
            opaque: args.opaque.clone(),
            elapsed: Duration::ZERO,
            retries: 0,
        })
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("flavor", &self.flavor())
            .field("events", &self.inner.events)
            .field("guarded", &self.inner.address_checker.is_some())
            .finish_non_exhaustive()
    }
}

/// URL for tracing without the query string
fn sanitize_url(uri: &Uri) -> String {
    format!(
        "{}://{}{}",
        uri.scheme_str().unwrap_or("http"),
        uri.authority().map_or("", http::uri::Authority::as_str),
        uri.path()
    )
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::request::{DataType, Timeout};
    use crate::ssrf::AddressFamily;
    use crate::transport::{TransportError, TransportResponse};
    use http::{HeaderMap, StatusCode};
    use parking_lot::Mutex;
    use std::net::{IpAddr, SocketAddr};

    /// Replays scripted outcomes and records what it was asked to send
    struct ScriptedTransport {
        flavor: TransportFlavor,
        outcomes: Mutex<Vec<Result<(u16, &'static str), TransportError>>>,
        seen: Mutex<Vec<TransportRequest>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<(u16, &'static str), TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                flavor: TransportFlavor::Classic,
                outcomes: Mutex::new(outcomes),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        fn flavor(&self) -> TransportFlavor {
            self.flavor
        }

        async fn execute(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.seen.lock().push(request);
            let next = {
                let mut outcomes = self.outcomes.lock();
                if outcomes.is_empty() {
                    Ok((200, ""))
                } else {
                    outcomes.remove(0)
                }
            };
            next.map(|(status, body)| {
                TransportResponse::from_bytes(
                    StatusCode::from_u16(status).unwrap(),
                    HeaderMap::new(),
                    body,
                )
            })
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> HttpClient {
        HttpClientBuilder::new().transport(transport).build().unwrap()
    }

    #[tokio::test]
    async fn test_invalid_url_fires_no_events() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport));
        let events = Arc::new(Mutex::new(0));
        let e = Arc::clone(&events);
        client.on_request(move |_| *e.lock() += 1);
        let e = Arc::clone(&events);
        client.on_response(move |_| *e.lock() += 1);

        let err = client
            .request("unknown url", RequestOptions::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidUrl);
        assert!(err.to_string().contains("unknown url"));
        assert_eq!(*events.lock(), 0);
        assert!(transport.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_listener_headers_reach_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport));
        client.on_request(|event| {
            let trace_id = event.tracer().trace_id().to_owned();
            event
                .args
                .headers
                .insert("mock-traceid", trace_id.parse().unwrap());
        });
        let recorded = Arc::new(Mutex::new(None));
        let r = Arc::clone(&recorded);
        client.on_response(move |event| {
            *r.lock() = Some((
                event.req.options.headers.get("mock-traceid").cloned(),
                event.req.args.headers.get("mock-traceid").cloned(),
            ));
        });

        client
            .request("http://example.com/a", RequestOptions::new())
            .await
            .unwrap();

        let sent = transport.seen.lock();
        let sent_value = sent[0].headers.get("mock-traceid").cloned().unwrap();
        assert_eq!(sent_value.to_str().unwrap(), sent[0].tracer.trace_id());
        let (options_value, args_value) = recorded.lock().take().unwrap();
        assert_eq!(options_value.as_ref(), Some(&sent_value));
        assert_eq!(args_value.as_ref(), Some(&sent_value));
    }

    #[tokio::test]
    async fn test_response_event_sees_error() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::new(
            "ENETUNREACH",
            "connect ENETUNREACH 1.1.1.1:80 - Local (127.0.0.1)",
        ))]);
        let client = client(transport);
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        client.on_response(move |event| {
            *s.lock() = event.error().and_then(|e| e.code().map(str::to_owned));
        });

        let err = client
            .curl("http://1.1.1.1/", RequestOptions::new())
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some("httpclient_ENETUNREACH"));
        assert!(err.to_string().contains(
            "connect ENETUNREACH 1.1.1.1:80 - Local (127.0.0.1) [ https://eggjs.org/zh-cn/faq/httpclient_ENETUNREACH ]"
        ));
        assert_eq!(seen.lock().as_deref(), Some("httpclient_ENETUNREACH"));
    }

    #[tokio::test]
    async fn test_json_format_error_nested_response() {
        let transport = ScriptedTransport::new(vec![Ok((500, "this is an error"))]);
        let client = client(transport);

        let err = client
            .request(
                "http://example.com/api",
                RequestOptions::new().data_type(DataType::Json),
            )
            .await
            .unwrap_err();

        assert_eq!(err.name(), "JSONResponseFormatError");
        assert!(err.to_string().contains("this is an error"));
        assert_eq!(err.response().unwrap().status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_opaque_returned_by_identity() {
        let client = client(ScriptedTransport::new(vec![]));
        let opaque: crate::request::Opaque = Arc::new(String::from("job-42"));

        let resp = client
            .request(
                "http://example.com/",
                RequestOptions::new().opaque(Arc::clone(&opaque)),
            )
            .await
            .unwrap();

        assert!(Arc::ptr_eq(resp.opaque().unwrap(), &opaque));
        assert_eq!(
            resp.opaque().unwrap().downcast_ref::<String>().map(String::as_str),
            Some("job-42")
        );
    }

    #[tokio::test]
    async fn test_retry_reuses_tracer_and_headers() {
        let transport = ScriptedTransport::new(vec![Ok((503, "")), Ok((200, "ok"))]);
        let client = client(Arc::clone(&transport));

        let resp = client
            .request(
                "http://example.com/",
                RequestOptions::new().header("x-req", "1").retry(1),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.retries(), 1);
        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(Arc::ptr_eq(&seen[0].tracer, &seen[1].tracer));
        assert_eq!(seen[1].headers.get("x-req").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_predicate_sees_only_the_failing_attempt() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::new("ECONNRESET", "socket hang up")),
            Ok((200, "ok")),
        ]);
        let client = client(Arc::clone(&transport));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&observed);

        let resp = client
            .request(
                "http://example.com/",
                RequestOptions::new()
                    .retry(1)
                    .is_retry(move |outcome: &Result<HttpResponse, HttpClientError>| {
                        o.lock().push(outcome.is_err());
                        outcome.is_err()
                    }),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(*observed.lock(), vec![true]);
        assert_eq!(transport.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_safe_curl_rejection_skips_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let client = HttpClientBuilder::new()
            .transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .check_address(crate::ssrf::PrivateAddressChecker)
            .build()
            .unwrap();

        let err = client
            .safe_curl("http://127.0.0.1:9/", RequestOptions::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SecurityRejected);
        assert!(transport.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_safe_curl_without_checker_acts_like_curl() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport));

        let resp = client
            .safe_curl("http://127.0.0.1:9/", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_safe_curl_pins_each_checked_address() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::new("ECONNRESET", "socket hang up")),
            Ok((200, "ok")),
        ]);
        let checked = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&checked);
        let client = HttpClientBuilder::new()
            .transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .check_address(move |ip: IpAddr, _: AddressFamily, host: &str| {
                c.lock().push((ip, host.to_owned()));
                true
            })
            .build()
            .unwrap();

        client
            .safe_curl("http://localhost:8080/", RequestOptions::new().retry(1))
            .await
            .unwrap();

        let checked = checked.lock();
        let sent = transport.seen.lock();
        assert_eq!(checked.len(), 2);
        assert_eq!(sent.len(), 2);
        for ((ip, host), request) in checked.iter().zip(sent.iter()) {
            assert_eq!(host, "localhost");
            assert_eq!(request.pinned_addr, Some(SocketAddr::new(*ip, 8080)));
        }
    }

    #[tokio::test]
    async fn test_curl_leaves_address_unpinned() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport));

        client
            .curl("http://localhost:8080/", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(transport.seen.lock()[0].pinned_addr, None);
    }

    #[tokio::test]
    async fn test_connect_budget_elapsed_is_a_timeout() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::connect_timeout(
            Duration::from_millis(100),
        ))]);
        let client = client(Arc::clone(&transport));

        let err = client
            .request(
                "http://example.com/",
                RequestOptions::new().timeout(Timeout::Split {
                    connect: Duration::from_millis(100),
                    response: Duration::from_millis(2000),
                }),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ResponseTimeout);
        assert!(err.to_string().contains("Response timeout for 100ms"));
        assert_eq!(
            transport.seen.lock()[0].connect_timeout,
            Some(Duration::from_millis(100))
        );
    }

    #[tokio::test]
    async fn test_option_error_reaches_response_listeners() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport));
        let requests = Arc::new(Mutex::new(0));
        let r = Arc::clone(&requests);
        client.on_request(move |_| *r.lock() += 1);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&failures);
        client.on_response(move |event| {
            f.lock().push(event.error().map(HttpClientError::kind));
        });

        let err = client
            .request(
                "http://example.com/",
                RequestOptions::new().header("bad header", "x"),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidHeader);
        assert_eq!(*requests.lock(), 1);
        assert_eq!(*failures.lock(), vec![Some(ErrorKind::InvalidHeader)]);
        assert!(transport.seen.lock().is_empty());
    }

    #[test]
    fn test_sanitize_url_drops_query() {
        let uri: Uri = "https://api.example.com:8443/v1/items?token=secret".parse().unwrap();
        assert_eq!(sanitize_url(&uri), "https://api.example.com:8443/v1/items");
    }
}
