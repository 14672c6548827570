//! TLS setup for the hyper transport.
//!
//! The OS root store is read and parsed at most once per process; lookups can
//! be slow on some platforms and every client builds two connectors.

use crate::config::TlsRootConfig;
use crate::error::HttpClientError;
use hyper_rustls::{ConfigBuilderExt, HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use std::sync::{Arc, OnceLock};

/// Parsed OS roots; may be empty, which is reported when a connector is built
static NATIVE_ROOT_STORE: OnceLock<Arc<RootCertStore>> = OnceLock::new();

fn load_native_root_store() -> Arc<RootCertStore> {
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        tracing::warn!(error = %err, "failed to read a native root certificate");
    }

    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(loaded.certs);
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    tracing::debug!(added, "native root store loaded");
    Arc::new(store)
}

fn native_root_store() -> Arc<RootCertStore> {
    Arc::clone(NATIVE_ROOT_STORE.get_or_init(load_native_root_store))
}

/// Process default provider when installed, otherwise a private aws-lc-rs one
fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn client_config(tls_roots: TlsRootConfig) -> Result<rustls::ClientConfig, HttpClientError> {
    let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpClientError::Tls(Box::new(e)))?;

    let config = match tls_roots {
        TlsRootConfig::WebPki => builder.with_webpki_roots().with_no_client_auth(),
        TlsRootConfig::Native => {
            let store = native_root_store();
            if store.is_empty() {
                return Err(HttpClientError::Tls(
                    "no usable root certificates in the OS certificate store".into(),
                ));
            }
            builder
                .with_root_certificates(store)
                .with_no_client_auth()
        }
    };
    Ok(config)
}

/// Wrap `http` in a connector that speaks TLS for `https://` and passes
/// `http://` through.
///
/// ALPN advertises `h2` only when `allow_h2` is set.
///
/// # Errors
///
/// Returns [`HttpClientError::Tls`] if the root store cannot be built.
pub fn https_connector<R>(
    tls_roots: TlsRootConfig,
    allow_h2: bool,
    http: HttpConnector<R>,
) -> Result<HttpsConnector<HttpConnector<R>>, HttpClientError> {
    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(client_config(tls_roots)?)
        .https_or_http();

    let connector = if allow_h2 {
        builder.enable_all_versions().wrap_connector(http)
    } else {
        builder.enable_http1().wrap_connector(http)
    };
    Ok(connector)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_native_store_loaded_once() {
        let first = native_root_store();
        let second = native_root_store();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_webpki_connector_builds() {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        assert!(https_connector(TlsRootConfig::WebPki, false, http.clone()).is_ok());
        assert!(https_connector(TlsRootConfig::WebPki, true, http).is_ok());
    }

    #[test]
    fn test_native_connector_error_shape() {
        // CI containers may have no OS certificates; only the error shape is checked
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        if let Err(err) = https_connector(TlsRootConfig::Native, false, http) {
            assert!(matches!(err, HttpClientError::Tls(_)));
        }
    }
}
