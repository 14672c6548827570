//! Client configuration and its normalization.
//!
//! Host configuration arrives as raw JSON (the `httpclient` section of the
//! host config). [`normalize`] rewrites legacy option names, propagates
//! top-level compatibility fields into both connection pools and fills the
//! agent timeout floor. [`HttpClientConfig::from_raw`] then deserializes the
//! canonical form.

use crate::request::{DataType, Timeout};
use crate::transport::TransportFlavor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default User-Agent string for HTTP requests
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-httpclient/", env!("CARGO_PKG_VERSION"));

/// Minimum socket timeout of both agents, in milliseconds
pub const MIN_AGENT_TIMEOUT_MS: u64 = 30_000;

/// Per-request timeout used when the host config does not set one, in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Base URL of the per-code troubleshooting pages linked from transport errors
pub const DEFAULT_FAQ_BASE_URL: &str = "https://eggjs.org/zh-cn/faq";

/// Legacy name of `freeSocketTimeout`
pub const LEGACY_FREE_SOCKET_TIMEOUT_KEY: &str = "freeSocketKeepAliveTimeout";

const FREE_SOCKET_TIMEOUT_KEY: &str = "freeSocketTimeout";
const TIMEOUT_KEY: &str = "timeout";
const REQUEST_KEY: &str = "request";
const AGENT_KEYS: [&str; 2] = ["httpAgent", "httpsAgent"];

/// Top-level fields that fill gaps in both agent configs
const INHERITED_AGENT_KEYS: [&str; 5] = [
    "keepAlive",
    "maxSockets",
    "maxFreeSockets",
    FREE_SOCKET_TIMEOUT_KEY,
    TIMEOUT_KEY,
];

/// Configuration error, always reported at client construction
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("httpclient config must be an object, got {found}")]
    NotAnObject { found: &'static str },
    #[error("httpclient config '{key}' must be an object")]
    InvalidSection { key: String },
    #[error("httpclient config '{key}' is not a valid duration: {reason}")]
    InvalidDuration { key: String, reason: String },
    #[error("invalid httpclient config: {source}")]
    InvalidConfig {
        #[source]
        source: serde_json::Error,
    },
}

/// Produce the canonical form of a raw `httpclient` config section.
///
/// The input is left untouched. Normalizing an already normalized value
/// returns an equal value.
///
/// # Errors
/// Returns [`ConfigError`] if the root or one of `request`, `httpAgent`,
/// `httpsAgent` is not an object, or a duration cannot be parsed.
pub fn normalize(raw: &Value) -> Result<Value, ConfigError> {
    let Value::Object(root) = raw else {
        return Err(ConfigError::NotAnObject {
            found: json_type_name(raw),
        });
    };
    let mut root = root.clone();

    for key in [REQUEST_KEY, AGENT_KEYS[0], AGENT_KEYS[1]] {
        ensure_section(&mut root, key)?;
    }

    canonicalize_durations(
        &mut root,
        "",
        &[TIMEOUT_KEY, FREE_SOCKET_TIMEOUT_KEY, LEGACY_FREE_SOCKET_TIMEOUT_KEY],
    )?;
    rename_legacy_free_socket_timeout(&mut root);

    let inherited: Vec<(&str, Value)> = INHERITED_AGENT_KEYS
        .iter()
        .filter_map(|key| root.get(*key).map(|value| (*key, value.clone())))
        .collect();

    for agent_key in AGENT_KEYS {
        let Some(agent) = root.get_mut(agent_key).and_then(Value::as_object_mut) else {
            continue;
        };
        canonicalize_durations(
            agent,
            agent_key,
            &[TIMEOUT_KEY, FREE_SOCKET_TIMEOUT_KEY, LEGACY_FREE_SOCKET_TIMEOUT_KEY],
        )?;
        rename_legacy_free_socket_timeout(agent);

        for (key, value) in &inherited {
            if !agent.contains_key(*key) {
                agent.insert((*key).to_owned(), value.clone());
            }
        }

        match agent.get(TIMEOUT_KEY).and_then(Value::as_u64) {
            None => {
                agent.insert(TIMEOUT_KEY.to_owned(), Value::from(MIN_AGENT_TIMEOUT_MS));
            }
            Some(timeout) if timeout < MIN_AGENT_TIMEOUT_MS => {
                tracing::warn!(
                    agent = agent_key,
                    timeout_ms = timeout,
                    min_timeout_ms = MIN_AGENT_TIMEOUT_MS,
                    "agent timeout below minimum, raised to the floor"
                );
                agent.insert(TIMEOUT_KEY.to_owned(), Value::from(MIN_AGENT_TIMEOUT_MS));
            }
            Some(_) => {}
        }
    }

    if let Some(request) = root.get_mut(REQUEST_KEY).and_then(Value::as_object_mut) {
        canonicalize_durations(request, REQUEST_KEY, &[TIMEOUT_KEY, "retryDelay"])?;
        if !request.contains_key(TIMEOUT_KEY) {
            request.insert(
                TIMEOUT_KEY.to_owned(),
                Value::from(DEFAULT_REQUEST_TIMEOUT_MS),
            );
        }
    }

    Ok(Value::Object(root))
}

fn ensure_section(root: &mut Map<String, Value>, key: &str) -> Result<(), ConfigError> {
    match root.get(key) {
        None | Some(Value::Null) => {
            root.insert(key.to_owned(), Value::Object(Map::new()));
            Ok(())
        }
        Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(ConfigError::InvalidSection {
            key: key.to_owned(),
        }),
    }
}

fn rename_legacy_free_socket_timeout(section: &mut Map<String, Value>) {
    if let Some(legacy) = section.remove(LEGACY_FREE_SOCKET_TIMEOUT_KEY)
        && !section.contains_key(FREE_SOCKET_TIMEOUT_KEY)
    {
        section.insert(FREE_SOCKET_TIMEOUT_KEY.to_owned(), legacy);
    }
}

/// Rewrite duration fields (`"3s"`, `"500ms"`, numbers, `[connect, response]`) as integer ms
fn canonicalize_durations(
    section: &mut Map<String, Value>,
    prefix: &str,
    keys: &[&str],
) -> Result<(), ConfigError> {
    for key in keys {
        let Some(value) = section.get_mut(*key) else {
            continue;
        };
        let path = if prefix.is_empty() {
            (*key).to_owned()
        } else {
            format!("{prefix}.{key}")
        };
        *value = match &*value {
            Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| duration_millis(item, &path).map(Value::from))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Array(items)
            }
            other => Value::from(duration_millis(other, &path)?),
        };
    }
    Ok(())
}

fn duration_millis(value: &Value, path: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidDuration {
        key: path.to_owned(),
        reason,
    };
    match value {
        Value::Number(n) => {
            if let Some(ms) = n.as_u64() {
                return Ok(ms);
            }
            // negative, fractional or out of range
            let secs = n.as_f64().map_or(f64::NAN, |f| f / 1000.0);
            let duration = Duration::try_from_secs_f64(secs)
                .map_err(|e| invalid(format!("{n} is not a usable millisecond count: {e}")))?;
            u64::try_from(duration.as_millis()).map_err(|e| invalid(e.to_string()))
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(ms) = trimmed.parse::<u64>() {
                return Ok(ms);
            }
            let duration = humantime::parse_duration(trimmed).map_err(|e| invalid(e.to_string()))?;
            u64::try_from(duration.as_millis()).map_err(|e| invalid(e.to_string()))
        }
        other => Err(invalid(format!("unexpected {}", json_type_name(other)))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Serde helpers for durations stored as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use super::{Deserialize, Deserializer, Duration, Serializer};

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// Connection pool settings of one agent (plain or secure)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Keep idle connections for reuse (default: true)
    pub keep_alive: bool,

    /// Maximum concurrent exchanges on this pool (default: unlimited)
    pub max_sockets: Option<usize>,

    /// Maximum idle connections kept per host (default: 256)
    pub max_free_sockets: usize,

    /// How long an idle connection stays in the pool (default: 4s)
    #[serde(with = "millis")]
    pub free_socket_timeout: Duration,

    /// Socket timeout, never below [`MIN_AGENT_TIMEOUT_MS`] after normalization
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            max_sockets: None,
            max_free_sockets: 256,
            free_socket_timeout: Duration::from_secs(4),
            timeout: Duration::from_millis(MIN_AGENT_TIMEOUT_MS),
        }
    }
}

impl AgentConfig {
    /// Idle connections kept per host, zero when keep-alive is off
    #[must_use]
    pub fn idle_per_host(&self) -> usize {
        if self.keep_alive {
            self.max_free_sockets
        } else {
            0
        }
    }
}

/// Per-call defaults applied beneath every call's own options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestDefaults {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub data_type: Option<DataType>,
    pub timeout: Timeout,
    pub retry: u32,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            method: None,
            headers: BTreeMap::new(),
            data_type: None,
            timeout: Timeout::Single(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)),
            retry: 0,
            retry_delay: Duration::ZERO,
        }
    }
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Canonical client configuration, immutable once the client is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpClientConfig {
    /// Per-call defaults
    pub request: RequestDefaults,

    /// Plain HTTP connection pool
    pub http_agent: AgentConfig,

    /// HTTPS connection pool
    pub https_agent: AgentConfig,

    /// Global timeout as configured (propagated into agents by normalization)
    #[serde(with = "millis::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Use the HTTP/2-capable client variant
    pub use_http_client_next: bool,

    /// Negotiate HTTP/2 over TLS (implies the HTTP/2-capable variant)
    #[serde(rename = "allowH2")]
    pub allow_h2: bool,

    /// User-Agent header value sent when the caller sets none
    pub user_agent: String,

    /// Maximum buffered response body size in bytes (default: 10 MB)
    pub max_body_size: usize,

    /// Queue capacity in front of each connection pool (default: 1024)
    pub buffer_capacity: usize,

    /// TLS root certificate strategy (default: `WebPki`)
    pub tls_roots: TlsRootConfig,

    /// Base URL of the troubleshooting links appended to transport errors
    pub faq_base_url: String,

    /// Write `x-trace-id`/`x-rpc-id` headers from the resolved tracer
    pub propagate_trace_headers: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request: RequestDefaults::default(),
            http_agent: AgentConfig::default(),
            https_agent: AgentConfig::default(),
            timeout: None,
            use_http_client_next: false,
            allow_h2: false,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
            buffer_capacity: 1024,
            tls_roots: TlsRootConfig::default(),
            faq_base_url: DEFAULT_FAQ_BASE_URL.to_owned(),
            propagate_trace_headers: false,
        }
    }
}

impl HttpClientConfig {
    /// Normalize and deserialize a raw `httpclient` config section
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the value is structurally invalid.
    pub fn from_raw(raw: &Value) -> Result<Self, ConfigError> {
        let normalized = normalize(raw)?;
        serde_json::from_value(normalized).map_err(|source| ConfigError::InvalidConfig { source })
    }

    /// Client variant selected by `useHttpClientNext` / `allowH2`
    #[must_use]
    pub fn flavor(&self) -> TransportFlavor {
        if self.use_http_client_next || self.allow_h2 {
            TransportFlavor::Next
        } else {
            TransportFlavor::Classic
        }
    }
}
