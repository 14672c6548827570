//! SSRF guard for `safe_curl`.
//!
//! The target host is resolved before the exchange and the first address is
//! handed to a pluggable [`AddressChecker`]. A rejected address never reaches
//! the transport; an accepted one is pinned on the transport request, which
//! then connects to that address without resolving the host again.

use crate::transport::{TransportError, io_error_code};
use http::Uri;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// IP address family of a resolved target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    #[must_use]
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// Numeric family (4 or 6)
    #[must_use]
    pub fn as_number(self) -> u8 {
        match self {
            Self::V4 => 4,
            Self::V6 => 6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.as_number())
    }
}

/// Decides whether a resolved address may be contacted.
///
/// Implemented for any `Fn(IpAddr, AddressFamily, &str) -> bool`, so a
/// closure can be passed directly to the builder.
pub trait AddressChecker: Send + Sync {
    /// Return `true` to allow the exchange with `ip`, resolved from `host`
    fn check_address(&self, ip: IpAddr, family: AddressFamily, host: &str) -> bool;
}

impl<F> AddressChecker for F
where
    F: Fn(IpAddr, AddressFamily, &str) -> bool + Send + Sync,
{
    fn check_address(&self, ip: IpAddr, family: AddressFamily, host: &str) -> bool {
        self(ip, family, host)
    }
}

/// Rejects loopback, private, link-local, broadcast and unspecified addresses
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateAddressChecker;

impl PrivateAddressChecker {
    /// Check if an IPv4 address is in a private or reserved range.
    fn is_private_ipv4(ip: Ipv4Addr) -> bool {
        ip.is_loopback()             // 127.0.0.0/8
            || ip.is_private()       // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
            || ip.is_link_local()    // 169.254.0.0/16 (cloud metadata: 169.254.169.254)
            || ip.is_broadcast()     // 255.255.255.255
            || ip.is_unspecified()   // 0.0.0.0
    }

    /// Check if an IPv6 address is in a private or reserved range.
    fn is_private_ipv6(ip: Ipv6Addr) -> bool {
        if let Some(v4) = ip.to_ipv4_mapped() {
            return Self::is_private_ipv4(v4);
        }
        ip.is_loopback()                // ::1
            || ip.is_unspecified()      // ::
            || ip.is_unique_local()     // fc00::/7
            || ip.is_unicast_link_local() // fe80::/10
    }
}

impl AddressChecker for PrivateAddressChecker {
    fn check_address(&self, ip: IpAddr, _family: AddressFamily, host: &str) -> bool {
        let private = match ip {
            IpAddr::V4(ip) => Self::is_private_ipv4(ip),
            IpAddr::V6(ip) => Self::is_private_ipv6(ip),
        };
        if private {
            tracing::warn!(%ip, host, "rejected target resolving to a private address");
        }
        !private
    }
}

/// Why the guard stopped a call
#[derive(Debug)]
pub(crate) enum GuardError {
    Rejected {
        host: String,
        ip: IpAddr,
        family: AddressFamily,
    },
    Resolve(TransportError),
}

/// Resolve the target of `uri` and run it past `checker`.
///
/// IP literals are checked without a DNS lookup. Only the first resolved
/// address is checked, and it is the address the exchange is pinned to.
pub(crate) async fn guard(
    uri: &Uri,
    checker: &dyn AddressChecker,
) -> Result<SocketAddr, GuardError> {
    let host = uri.host().unwrap_or_default();
    let bare_host = host.trim_start_matches('[').trim_end_matches(']');
    let port = uri.port_u16().unwrap_or_else(|| default_port(uri));

    let addr = if let Ok(ip) = bare_host.parse::<IpAddr>() {
        SocketAddr::new(ip, port)
    } else {
        resolve_first(bare_host, port).await?
    };

    let ip = addr.ip();
    let family = AddressFamily::of(&ip);
    tracing::debug!(host = bare_host, %ip, %family, "checking resolved address");

    if checker.check_address(ip, family, bare_host) {
        Ok(addr)
    } else {
        Err(GuardError::Rejected {
            host: bare_host.to_owned(),
            ip,
            family,
        })
    }
}

async fn resolve_first(host: &str, port: u16) -> Result<SocketAddr, GuardError> {
    let not_found = || {
        TransportError::new("ENOTFOUND", format!("getaddrinfo ENOTFOUND {host}"))
    };
    let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        let code = io_error_code(&e);
        let err = if code == TransportError::UNKNOWN {
            not_found()
        } else {
            TransportError::new(code, format!("getaddrinfo {code} {host}"))
        };
        GuardError::Resolve(err.with_source(e))
    })?;
    addrs.next().ok_or_else(|| GuardError::Resolve(not_found()))
}

fn default_port(uri: &Uri) -> u16 {
    if uri.scheme() == Some(&http::uri::Scheme::HTTPS) {
        443
    } else {
        80
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_private_ipv4_ranges() {
        let checker = PrivateAddressChecker;
        for ip in ["127.0.0.1", "10.1.2.3", "172.16.0.1", "192.168.1.1", "169.254.169.254", "0.0.0.0", "255.255.255.255"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(!checker.check_address(ip, AddressFamily::of(&ip), "h"), "{ip} should be rejected");
        }
        let public: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(checker.check_address(public, AddressFamily::V4, "example.com"));
    }

    #[test]
    fn test_private_ipv6_ranges() {
        let checker = PrivateAddressChecker;
        for ip in ["::1", "::", "fd00::1", "fe80::1", "::ffff:127.0.0.1"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(!checker.check_address(ip, AddressFamily::V6, "h"), "{ip} should be rejected");
        }
        let public: IpAddr = "2606:2800:220:1:248:1893:25c8:1946".parse().unwrap();
        assert!(checker.check_address(public, AddressFamily::V6, "example.com"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_rejection_is_logged() {
        let ip: IpAddr = "169.254.169.254".parse().unwrap();
        assert!(!PrivateAddressChecker.check_address(ip, AddressFamily::V4, "metadata.internal"));
        assert!(logs_contain("rejected target resolving to a private address"));
        assert!(logs_contain("metadata.internal"));
    }

    #[test]
    fn test_family_numbers() {
        assert_eq!(AddressFamily::V4.as_number(), 4);
        assert_eq!(AddressFamily::V6.as_number(), 6);
        assert_eq!(AddressFamily::V6.to_string(), "IPv6");
    }

    #[tokio::test]
    async fn test_ip_literal_skips_resolution() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_checker = Arc::clone(&seen);
        let checker = move |ip: IpAddr, family: AddressFamily, host: &str| {
            seen_in_checker.lock().push((ip, family, host.to_owned()));
            true
        };

        let uri: Uri = "http://[::1]:8080/path".parse().unwrap();
        let addr = guard(&uri, &checker).await.unwrap();
        assert_eq!(addr, "[::1]:8080".parse::<SocketAddr>().unwrap());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, AddressFamily::V6);
        assert_eq!(seen[0].2, "::1");
    }

    #[tokio::test]
    async fn test_rejection_names_host_and_address() {
        let uri: Uri = "https://127.0.0.1/admin".parse().unwrap();
        let err = guard(&uri, &PrivateAddressChecker).await.unwrap_err();
        match err {
            GuardError::Rejected { host, ip, family } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(ip, IpAddr::from([127, 0, 0, 1]));
                assert_eq!(family, AddressFamily::V4);
            }
            GuardError::Resolve(e) => panic!("unexpected resolve error: {e}"),
        }
    }

    #[tokio::test]
    async fn test_localhost_resolves_and_is_checked() {
        let calls = Arc::new(Mutex::new(0usize));
        let calls_in_checker = Arc::clone(&calls);
        let checker = move |ip: IpAddr, _: AddressFamily, host: &str| {
            *calls_in_checker.lock() += 1;
            assert_eq!(host, "localhost");
            assert!(ip.is_loopback());
            true
        };

        let uri: Uri = "http://localhost/".parse().unwrap();
        let addr = guard(&uri, &checker).await.unwrap();
        assert_eq!(addr.port(), 80);
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_enotfound() {
        let uri: Uri = "http://does-not-exist.invalid/".parse().unwrap();
        let err = guard(&uri, &PrivateAddressChecker).await.unwrap_err();
        match err {
            GuardError::Resolve(e) => assert_eq!(e.code(), "ENOTFOUND"),
            GuardError::Rejected { .. } => panic!("expected resolve error"),
        }
    }
}
