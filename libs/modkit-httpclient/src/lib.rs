#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Instrumented HTTP client for `ModKit` services
//!
//! This crate wraps a pooled hyper client with the plumbing every outgoing
//! call of a service needs:
//! - `request`/`response` lifecycle events with mutable outgoing options
//! - Tracer resolution and optional `x-trace-id`/`x-rpc-id` propagation
//! - Retry policy with a pluggable predicate
//! - Per-request timeouts on top of per-agent socket timeouts
//! - `safe_curl`: SSRF guard on the resolved target address, pinned for the connect
//! - Normalized errors with stable codes and troubleshooting links
//! - Config normalization of raw host sections (legacy key renames, agent floors)
//!
//! # Feature flags
//!
//! - `otel`: calls without an explicit or context tracer take the trace id
//!   and span id of the current OpenTelemetry span instead of generating one.
//!
//! # Transparent Decompression
//!
//! The hyper transport sends `Accept-Encoding` and decompresses gzip, brotli
//! and deflate bodies. Body size limits apply to **decompressed** bytes.
//!
//! # Example
//!
//! ```ignore
//! use modkit_httpclient::{DataType, HttpClient, RequestOptions};
//! use serde_json::json;
//!
//! let client = HttpClient::from_raw(&json!({
//!     "request": { "timeout": "3s" },
//!     "httpAgent": { "freeSocketKeepAliveTimeout": 4000 }
//! }))?;
//!
//! client.on_response(|event| {
//!     if let Some(err) = event.error() {
//!         tracing::warn!(url = %event.req.url, error = %err, "upstream call failed");
//!     }
//! });
//!
//! let res = client
//!     .request(
//!         "https://api.example.com/users/42",
//!         RequestOptions::new().data_type(DataType::Json).retry(1),
//!     )
//!     .await?;
//! let user = res.data().as_json();
//! ```

mod builder;
mod client;
pub mod config;
mod dns;
mod error;
mod events;
mod hyper_transport;
mod layers;
mod request;
mod response;
mod retry;
pub mod ssrf;
mod tls;
pub mod tracer;
pub mod transport;

pub use builder::HttpClientBuilder;
pub use client::HttpClient;
pub use config::{
    AgentConfig, ConfigError, DEFAULT_USER_AGENT, HttpClientConfig, RequestDefaults,
    TlsRootConfig,
};
pub use error::{ErrorKind, ErrorResponse, HttpClientError};
pub use events::{
    ListenerId, RequestEvent, RequestListener, RequestRecord, RequestSnapshot, ResponseEvent,
    ResponseListener,
};
pub use hyper_transport::HyperTransport;
pub use layers::{ExchangeLayer, ExchangeService};
pub use request::{
    DataType, Opaque, RequestArgs, RequestData, RequestOptions, RetryPredicate, Timeout,
};
pub use response::{HttpResponse, LimitedBody, ResponseBody, ResponseData};
pub use retry::{RetryPolicy, run_with_retry};
pub use ssrf::{AddressChecker, AddressFamily, PrivateAddressChecker};
pub use tracer::{RequestContext, Tracer};
pub use transport::{
    Transport, TransportError, TransportFlavor, TransportRequest, TransportResponse,
};
