//! Per-call trace identity and its resolution.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use rand::Rng;
use std::fmt;
use std::sync::Arc;

/// Header carrying the trace id when trace propagation is enabled
pub const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

/// Header carrying the rpc id when trace propagation is enabled
pub const RPC_ID_HEADER: HeaderName = HeaderName::from_static("x-rpc-id");

/// Trace identity of one logical call.
///
/// Shared by reference between the request event, the response event and
/// every retry attempt of that call; compare with [`Arc::ptr_eq`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracer {
    trace_id: String,
    rpc_id: Option<String>,
}

impl Tracer {
    /// Tracer with an explicit trace id
    #[must_use]
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            rpc_id: None,
        }
    }

    /// Attach an rpc id
    #[must_use]
    pub fn with_rpc_id(mut self, rpc_id: impl Into<String>) -> Self {
        self.rpc_id = Some(rpc_id.into());
        self
    }

    /// Fresh tracer with a random 128-bit trace id rendered as 32 hex digits
    #[must_use]
    pub fn generate() -> Self {
        let id: u128 = rand::rng().random();
        Self::new(format!("{id:032x}"))
    }

    /// Tracer of the active OpenTelemetry span (with the `otel` feature),
    /// otherwise a generated one
    #[must_use]
    pub fn ambient() -> Self {
        otel::current().unwrap_or_else(Self::generate)
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn rpc_id(&self) -> Option<&str> {
        self.rpc_id.as_deref()
    }

    /// Write the trace headers, leaving any header the caller already set
    pub fn inject_headers(&self, headers: &mut HeaderMap) {
        insert_missing(headers, TRACE_ID_HEADER, &self.trace_id);
        if let Some(rpc_id) = &self.rpc_id {
            insert_missing(headers, RPC_ID_HEADER, rpc_id);
        }
    }
}

impl fmt::Display for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.trace_id)
    }
}

fn insert_missing(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if headers.contains_key(&name) {
        return;
    }
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => {
            tracing::debug!(header = %name, "trace id is not a valid header value, not propagated");
        }
    }
}

#[cfg(feature = "otel")]
mod otel {
    use super::Tracer;
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    /// Trace id and span id of the current span's OpenTelemetry context
    pub fn current() -> Option<Tracer> {
        let cx = tracing::Span::current().context();
        let span = cx.span();
        let span_context = span.span_context();
        span_context.is_valid().then(|| {
            Tracer::new(span_context.trace_id().to_string())
                .with_rpc_id(span_context.span_id().to_string())
        })
    }
}

#[cfg(not(feature = "otel"))]
mod otel {
    use super::Tracer;

    /// No-op: OpenTelemetry is disabled
    pub fn current() -> Option<Tracer> {
        None
    }
}

/// Ambient context of the caller (typically the inbound request being served)
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub tracer: Option<Arc<Tracer>>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tracer(tracer: Arc<Tracer>) -> Self {
        Self {
            tracer: Some(tracer),
        }
    }
}

/// Pick the tracer for a call: explicit tracer, then the context's tracer,
/// then the ambient one (see [`Tracer::ambient`]).
#[must_use]
pub fn resolve(explicit: Option<&Arc<Tracer>>, ctx: Option<&RequestContext>) -> Arc<Tracer> {
    explicit
        .or_else(|| ctx.and_then(|ctx| ctx.tracer.as_ref()))
        .map_or_else(|| Arc::new(Tracer::ambient()), Arc::clone)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_tracer_wins() {
        let explicit = Arc::new(Tracer::new("1234"));
        let ctx = RequestContext::with_tracer(Arc::new(Tracer::new("5678")));

        let resolved = resolve(Some(&explicit), Some(&ctx));
        assert!(Arc::ptr_eq(&resolved, &explicit));
        assert_eq!(resolved.trace_id(), "1234");
    }

    #[test]
    fn test_context_tracer_used_when_no_explicit() {
        let ctx_tracer = Arc::new(Tracer::new("5678"));
        let ctx = RequestContext::with_tracer(Arc::clone(&ctx_tracer));

        let resolved = resolve(None, Some(&ctx));
        assert!(Arc::ptr_eq(&resolved, &ctx_tracer));
    }

    #[test]
    fn test_fresh_tracer_per_resolution() {
        let a = resolve(None, None);
        let b = resolve(None, Some(&RequestContext::new()));

        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.trace_id(), b.trace_id());
        assert_eq!(a.trace_id().len(), 32);
        assert!(a.trace_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[cfg(feature = "otel")]
    #[test]
    fn test_ambient_tracer_follows_otel_span() {
        use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
        use tracing_opentelemetry::OpenTelemetrySpanExt;
        use tracing_subscriber::layer::SubscriberExt;

        let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry().with(
            tracing_opentelemetry::OpenTelemetryLayer::new(provider.tracer("httpclient-test")),
        );

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("inbound");
            let _entered = span.enter();
            let expected = span.context().span().span_context().trace_id().to_string();

            let resolved = resolve(None, None);
            assert_eq!(resolved.trace_id(), expected);
            assert_eq!(resolved.rpc_id().map(str::len), Some(16));

            // an explicit tracer still wins over the ambient span
            let explicit = Arc::new(Tracer::new("1234"));
            assert!(Arc::ptr_eq(&resolve(Some(&explicit), None), &explicit));
        });
    }

    #[test]
    fn test_ambient_without_active_span_is_generated() {
        let tracer = Tracer::ambient();
        assert_eq!(tracer.trace_id().len(), 32);
        assert!(tracer.trace_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_inject_headers_keeps_caller_values() {
        let tracer = Tracer::new("abc").with_rpc_id("0.1");
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, HeaderValue::from_static("caller"));

        tracer.inject_headers(&mut headers);

        assert_eq!(headers.get(TRACE_ID_HEADER).unwrap(), "caller");
        assert_eq!(headers.get(RPC_ID_HEADER).unwrap(), "0.1");
    }

    #[test]
    fn test_inject_headers_without_rpc_id() {
        let mut headers = HeaderMap::new();
        Tracer::new("abc").inject_headers(&mut headers);

        assert_eq!(headers.get(TRACE_ID_HEADER).unwrap(), "abc");
        assert!(!headers.contains_key(RPC_ID_HEADER));
    }
}
