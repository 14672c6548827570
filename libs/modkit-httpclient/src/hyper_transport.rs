//! Hyper-based [`Transport`] with one connection pool per agent.

use crate::config::{AgentConfig, HttpClientConfig};
use crate::dns::{PinTable, TargetResolver};
use crate::error::HttpClientError;
use crate::layers::ExchangeLayer;
use crate::response::ResponseBody;
use crate::tls;
use crate::transport::{
    BoxError, Transport, TransportError, TransportFlavor, TransportRequest, TransportResponse,
};
use bytes::Bytes;
use http::uri::Scheme;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::dns::GaiResolver;
use hyper_util::client::legacy::connect::{CaptureConnection, HttpConnector, capture_connection};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tower::buffer::Buffer;
use tower::limit::ConcurrencyLimitLayer;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

type ExchangeFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, TransportError>> + Send>>;

/// Buffered service of one pool; cloning is cheap and shares the pool
pub type PoolService = Buffer<Request<Full<Bytes>>, ExchangeFuture>;

/// Transport over hyper's pooled client.
///
/// `http://` and `https://` targets use separate pools configured from
/// `httpAgent` and `httpsAgent`. Pool bookkeeping happens inside hyper; the
/// buffer worker in front of each pool serializes access to its service.
///
/// Requests carrying a pinned address go through a second pair of pools whose
/// connector resolves hosts from the pins only and which keep no idle
/// connections, so every guarded exchange connects to its checked address.
///
/// Request flow per pool (outer to inner):
///   Buffer → ConcurrencyLimit(maxSockets)? → Exchange(span, User-Agent) →
///   Decompression → hyper client
#[derive(Clone)]
pub struct HyperTransport {
    http: PoolService,
    https: PoolService,
    guarded_http: PoolService,
    guarded_https: PoolService,
    pins: Arc<PinTable>,
    flavor: TransportFlavor,
}

impl HyperTransport {
    /// Build both pools from a normalized config.
    ///
    /// Must be called from within a Tokio runtime: each pool spawns its
    /// buffer worker.
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails or the user agent is invalid.
    pub fn new(config: &HttpClientConfig) -> Result<Self, HttpClientError> {
        let flavor = config.flavor();
        tracing::debug!(
            ?flavor,
            allow_h2 = config.allow_h2,
            tls_roots = ?config.tls_roots,
            "building hyper transport"
        );
        let system = TargetResolver::System(GaiResolver::new());
        let pins = Arc::new(PinTable::default());
        let pinned = TargetResolver::Pinned(Arc::clone(&pins));
        Ok(Self {
            http: build_pool(&config.http_agent, config, system.clone(), false)?,
            https: build_pool(&config.https_agent, config, system, false)?,
            guarded_http: build_pool(&config.http_agent, config, pinned.clone(), true)?,
            guarded_https: build_pool(&config.https_agent, config, pinned, true)?,
            pins,
            flavor,
        })
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Transport for HyperTransport {
    fn flavor(&self) -> TransportFlavor {
        self.flavor
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let https = request.uri.scheme() == Some(&Scheme::HTTPS);
        // the pin must outlive the connect phase of this exchange
        let (mut service, _pin) = match request.pinned_addr {
            Some(addr) => {
                let host = request
                    .uri
                    .host()
                    .unwrap_or_default()
                    .trim_start_matches('[')
                    .trim_end_matches(']');
                tracing::trace!(host, %addr, "connecting to pinned address");
                let pool = if https { &self.guarded_https } else { &self.guarded_http };
                (pool.clone(), Some(self.pins.pin(host, addr)))
            }
            None => {
                let pool = if https { &self.https } else { &self.http };
                (pool.clone(), None)
            }
        };
        let connect_timeout = request.connect_timeout;

        let mut req = Request::new(Full::new(request.body));
        *req.method_mut() = request.method;
        *req.uri_mut() = request.uri;
        *req.headers_mut() = request.headers;
        req.extensions_mut().insert(request.tracer);
        let mut connection = capture_connection(&mut req);

        let exchange = service.ready().await.map_err(map_buffer_error)?.call(req);
        let response = match connect_timeout {
            Some(limit) => within_connect_budget(exchange, &mut connection, limit).await?,
            None => exchange.await.map_err(map_buffer_error)?,
        };

        let (parts, body) = response.into_parts();
        Ok(TransportResponse {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }
}

/// Wait for the exchange, failing if hyper has not handed it a connection
/// within `limit`
async fn within_connect_budget<F>(
    exchange: F,
    connection: &mut CaptureConnection,
    limit: Duration,
) -> Result<Response<ResponseBody>, TransportError>
where
    F: Future<Output = Result<Response<ResponseBody>, BoxError>>,
{
    tokio::pin!(exchange);
    tokio::select! {
        biased;
        result = &mut exchange => return result.map_err(map_buffer_error),
        connected = tokio::time::timeout(limit, connection.wait_for_connection_metadata()) => {
            if connected.is_err() {
                tracing::debug!(connect_timeout_ms = limit.as_millis(), "no connection within connect budget");
                return Err(TransportError::connect_timeout(limit));
            }
        }
    }
    exchange.await.map_err(map_buffer_error)
}

fn build_pool(
    agent: &AgentConfig,
    config: &HttpClientConfig,
    resolver: TargetResolver,
    guarded: bool,
) -> Result<PoolService, HttpClientError> {
    let mut http = HttpConnector::new_with_resolver(resolver);
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(agent.timeout));

    let connector = tls::https_connector(config.tls_roots, config.allow_h2, http)?;

    // a reused connection would skip the pinned resolver
    let idle_per_host = if guarded { 0 } else { agent.idle_per_host() };

    // pool_timer is required for pool_idle_timeout to take effect
    let mut client_builder = Client::builder(TokioExecutor::new());
    client_builder
        .pool_timer(TokioTimer::new())
        .pool_max_idle_per_host(idle_per_host)
        .pool_idle_timeout(agent.free_socket_timeout);
    let hyper_client = client_builder.build::<_, Full<Bytes>>(connector);

    let exchange_layer = ExchangeLayer::try_new(&config.user_agent)?;

    let service = ServiceBuilder::new()
        .option_layer(agent.max_sockets.map(ConcurrencyLimitLayer::new))
        .layer(exchange_layer)
        .layer(DecompressionLayer::new())
        .service(hyper_client)
        .map_response(map_decompression_response)
        .map_err(|e| TransportError::from_error(e.into()));

    let buffer_capacity = config.buffer_capacity.max(1);
    Ok(Buffer::new(service.boxed_clone(), buffer_capacity))
}

/// Convert `Response<DecompressionBody<Incoming>>` into `Response<ResponseBody>`
fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let boxed_body: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, boxed_body)
}

/// Recover the pool's own error, or report the buffer worker as gone
fn map_buffer_error(err: BoxError) -> TransportError {
    match err.downcast::<TransportError>() {
        Ok(err) => *err,
        Err(err) => {
            tracing::error!(
                error = %err,
                "transport buffer worker closed unexpectedly"
            );
            TransportError::new("ECLOSED", "transport buffer worker closed").with_source(err)
        }
    }
}
