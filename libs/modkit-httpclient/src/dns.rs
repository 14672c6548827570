//! Name resolution for the hyper transport.
//!
//! Guarded exchanges never resolve the host again: the connector of the
//! guarded pools only returns the address the SSRF check accepted for that
//! host, taken from a [`PinTable`].

use crate::transport::BoxError;
use hyper_util::client::legacy::connect::dns::{GaiResolver, Name};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

type ResolveFuture =
    Pin<Box<dyn Future<Output = Result<std::vec::IntoIter<SocketAddr>, BoxError>> + Send>>;

/// Resolver plugged into `HttpConnector`
#[derive(Clone)]
pub enum TargetResolver {
    /// Regular `getaddrinfo` lookup
    System(GaiResolver),
    /// Checked addresses only; a host without a pin fails to resolve
    Pinned(Arc<PinTable>),
}

impl Service<Name> for TargetResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = BoxError;
    type Future = ResolveFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self {
            Self::System(gai) => gai.poll_ready(cx).map_err(Into::into),
            Self::Pinned(_) => Poll::Ready(Ok(())),
        }
    }

    fn call(&mut self, name: Name) -> Self::Future {
        match self {
            Self::System(gai) => {
                let lookup = gai.call(name);
                Box::pin(async move {
                    let addrs: Vec<SocketAddr> = lookup.await?.collect();
                    Ok(addrs.into_iter())
                })
            }
            Self::Pinned(pins) => {
                let result = pins.get(name.as_str()).map_or_else(
                    || {
                        tracing::warn!(host = name.as_str(), "no checked address pinned for host");
                        Err(BoxError::from(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("no checked address for {}", name.as_str()),
                        )))
                    },
                    |addr| Ok(vec![addr].into_iter()),
                );
                Box::pin(std::future::ready(result))
            }
        }
    }
}

struct PinEntry {
    addr: SocketAddr,
    holders: usize,
}

/// Checked addresses of in-flight guarded exchanges, keyed by host.
///
/// Every address stored here passed the address check; concurrent calls to
/// the same host share one entry and the latest checked address wins.
#[derive(Default)]
pub struct PinTable {
    pins: Mutex<HashMap<String, PinEntry>>,
}

impl PinTable {
    /// Pin `host` to `addr` until the returned guard is dropped
    pub fn pin(self: &Arc<Self>, host: &str, addr: SocketAddr) -> PinGuard {
        let mut pins = self.pins.lock();
        pins.entry(host.to_owned())
            .and_modify(|entry| {
                entry.addr = addr;
                entry.holders += 1;
            })
            .or_insert(PinEntry { addr, holders: 1 });
        PinGuard {
            table: Arc::clone(self),
            host: host.to_owned(),
        }
    }

    pub fn get(&self, host: &str) -> Option<SocketAddr> {
        self.pins.lock().get(host).map(|entry| entry.addr)
    }

    fn release(&self, host: &str) {
        let mut pins = self.pins.lock();
        if let Some(entry) = pins.get_mut(host) {
            entry.holders -= 1;
            if entry.holders == 0 {
                pins.remove(host);
            }
        }
    }
}

/// Keeps a host pinned while an exchange may still be connecting
pub struct PinGuard {
    table: Arc<PinTable>,
    host: String,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.table.release(&self.host);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tower::ServiceExt;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_pin_released_after_last_holder() {
        let table = Arc::new(PinTable::default());
        let first = table.pin("api.example.com", addr("10.0.0.1:443"));
        let second = table.pin("api.example.com", addr("10.0.0.2:443"));
        assert_eq!(table.get("api.example.com"), Some(addr("10.0.0.2:443")));

        drop(first);
        assert_eq!(table.get("api.example.com"), Some(addr("10.0.0.2:443")));
        drop(second);
        assert_eq!(table.get("api.example.com"), None);
    }

    #[tokio::test]
    async fn test_pinned_resolver_returns_only_pinned_address() {
        let table = Arc::new(PinTable::default());
        let _pin = table.pin("rebind.example", addr("93.184.216.34:80"));

        let resolver = TargetResolver::Pinned(Arc::clone(&table));
        let addrs: Vec<SocketAddr> = resolver
            .clone()
            .oneshot(Name::from_str("rebind.example").unwrap())
            .await
            .unwrap()
            .collect();
        assert_eq!(addrs, vec![addr("93.184.216.34:80")]);

        let err = resolver
            .oneshot(Name::from_str("other.example").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no checked address for other.example"));
    }
}
