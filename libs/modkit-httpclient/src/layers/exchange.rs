use crate::error::HttpClientError;
use crate::tracer::Tracer;
use http::header::USER_AGENT;
use http::{HeaderValue, Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Per-exchange instrumentation of the hyper transport.
///
/// Opens an `http_exchange` span carrying the trace id of the call (read
/// from the request's [`Tracer`] extension), records the status code, and
/// sets `User-Agent` when the caller did not.
#[derive(Clone)]
pub struct ExchangeLayer {
    user_agent: HeaderValue,
}

impl ExchangeLayer {
    /// # Errors
    /// Returns `HttpClientError::InvalidHeaderValue` if `user_agent` is not a valid header value
    pub fn try_new(user_agent: impl AsRef<str>) -> Result<Self, HttpClientError> {
        let user_agent = HeaderValue::from_str(user_agent.as_ref())?;
        Ok(Self { user_agent })
    }
}

impl<S> Layer<S> for ExchangeLayer {
    type Service = ExchangeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ExchangeService {
            inner,
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ExchangeService<S> {
    inner: S,
    user_agent: HeaderValue,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ExchangeService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        use tracing::Instrument;

        if !req.headers().contains_key(USER_AGENT) {
            req.headers_mut().insert(USER_AGENT, self.user_agent.clone());
        }

        let trace_id = req
            .extensions()
            .get::<Arc<Tracer>>()
            .map(|tracer| tracer.trace_id().to_owned())
            .unwrap_or_default();
        let span = tracing::debug_span!(
            "http_exchange",
            http.method = %req.method(),
            net.peer = req.uri().authority().map_or("", http::uri::Authority::as_str),
            trace_id = %trace_id,
            http.status_code = tracing::field::Empty,
            http.version = tracing::field::Empty,
        );

        // Swap so we call the instance that was poll_ready'd, leaving a fresh clone
        // for the next poll_ready cycle.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let result = inner.call(req).instrument(span.clone()).await;
            if let Ok(response) = &result {
                span.record("http.status_code", response.status().as_u16());
                span.record("http.version", tracing::field::debug(response.version()));
            }
            result
        })
    }
}
