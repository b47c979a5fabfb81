//! TLS client configuration for proxy links and forwarded `https` targets

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::proxy::transport::BoxConnection;

/// Mozilla's root store, as shipped by `webpki-roots`
pub fn webpki_roots() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Client configuration speaking HTTP/1.1 over TLS, trusting `roots`
pub fn client_config(roots: RootCertStore) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Default configuration: WebPKI roots, HTTP/1.1
pub fn default_client_config() -> Result<Arc<ClientConfig>> {
    client_config(webpki_roots())
}

/// Run a TLS handshake over `conn`. On failure the raw link is dropped.
pub async fn connect(
    config: Arc<ClientConfig>,
    server_name: &str,
    conn: BoxConnection,
) -> Result<BoxConnection> {
    let host = server_name
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(server_name);
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::Tls(format!("invalid server name {:?}: {}", host, e)))?;

    let stream = TlsConnector::from(config)
        .connect(name, conn)
        .await
        .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", host, e)))?;
    debug!(server_name = host, "TLS handshake complete");
    Ok(Box::new(stream))
}
