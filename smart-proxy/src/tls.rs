use crate::transport::BoxedStream;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::sync::Once;
use std::sync::OnceLock;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;
use tracing::warn;

/// Ensures a process-wide rustls crypto provider is installed.
fn ensure_rustls_crypto_provider() {
    static RUSTLS_PROVIDER_INIT: Once = Once::new();
    RUSTLS_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Shared client config trusting the platform's native roots, speaking HTTP/1.1 over ALPN.
pub(crate) fn client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            ensure_rustls_crypto_provider();
            let mut roots = RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                warn!("failed to load native certificate: {err}");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!("loaded {added} native root certificates ({ignored} ignored)");

            let mut config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Arc::new(config)
        })
        .clone()
}

/// Runs a TLS client handshake over an already dialed stream.
pub(crate) async fn connect(stream: BoxedStream, host: &str) -> io::Result<TlsStream<BoxedStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    TlsConnector::from(client_config())
        .connect(server_name, stream)
        .await
}
