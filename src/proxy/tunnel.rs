//! Upstream TLS connections verified against the anchor store.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{CertificateError, ClientConfig};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::verifier::AnchorVerifier;

/// Opens TLS connections whose trust evaluation includes installed anchors.
#[derive(Clone)]
pub struct UpstreamConnector {
    client_config: Arc<ClientConfig>,
}

impl UpstreamConnector {
    pub fn new(verifier: Arc<AnchorVerifier>) -> Self {
        Self {
            client_config: verifier.client_config(),
        }
    }

    /// Opens a TLS session to `addr`, presenting and verifying `sni`.
    ///
    /// A chain the verifier refuses is reported as [`TunnelError::Untrusted`]
    /// so callers can tell a missing anchor from a network failure.
    pub async fn connect_upstream(
        &self,
        addr: SocketAddr,
        sni: &str,
    ) -> Result<TlsStream<TcpStream>, TunnelError> {
        let server_name = ServerName::try_from(sni.to_string())
            .map_err(|_| TunnelError::InvalidSni(sni.to_string()))?;

        let tcp = TcpStream::connect(addr).await.map_err(TunnelError::Connect)?;
        let stream = TlsConnector::from(Arc::clone(&self.client_config))
            .connect(server_name, tcp)
            .await
            .map_err(classify_handshake_error)?;

        debug!("verified {} at {}", sni, addr);
        Ok(stream)
    }

    /// Completes a handshake and reads whatever the server sends before
    /// closing.
    pub async fn probe(&self, addr: SocketAddr, sni: &str) -> Result<Vec<u8>, TunnelError> {
        let mut stream = self.connect_upstream(addr, sni).await?;
        let mut body = Vec::new();
        stream
            .read_to_end(&mut body)
            .await
            .map_err(TunnelError::Io)?;
        Ok(body)
    }
}

/// Separates certificate rejections from other handshake failures.
fn classify_handshake_error(err: io::Error) -> TunnelError {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(rustls::Error::InvalidCertificate(cert_err)) => {
            TunnelError::Untrusted(cert_err.clone())
        }
        _ => TunnelError::TlsHandshake(err),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] io::Error),
    #[error("invalid SNI: {0}")]
    InvalidSni(String),
    #[error("server certificate not trusted: {0:?}")]
    Untrusted(CertificateError),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::TrustAnchorStore;
    use crate::ca::DemoCa;
    use crate::contract::{
        ContextOptions, InstallDecision, InstallError, InstallRequest, InteractionContext,
    };
    use crate::proxy::LoopbackServer;
    use crate::worker::WorkerRegistry;

    /// Tests the whole flow: a handshake against a demo CA fails, a worker
    /// proposes the CA through the contract, the context accepts it, and the
    /// next handshake succeeds.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handshake_after_install() {
        let store = Arc::new(TrustAnchorStore::new());
        let registry = Arc::new(WorkerRegistry::new());
        let ctx = InteractionContext::spawn(
            Arc::clone(&store),
            Arc::clone(&registry),
            ContextOptions::default(),
        )
        .unwrap();
        let handler = Arc::new(|_: &InstallRequest| -> Result<InstallDecision, InstallError> {
            Ok(InstallDecision::Accept)
        });
        ctx.attach_install_handler(&handler);

        let ca = DemoCa::generate("loopback CA").unwrap();
        let server = LoopbackServer::bind(ca.server_config("localhost").unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let verifier = Arc::new(AnchorVerifier::new(Arc::clone(&store), false, ctx.client()));
        let connector = UpstreamConnector::new(verifier);

        assert!(matches!(
            connector.probe(addr, "localhost").await,
            Err(TunnelError::Untrusted(CertificateError::UnknownIssuer))
        ));

        let client = ctx.client();
        let anchor = ca.anchor().unwrap();
        tokio::task::spawn_blocking(move || client.request_install_trusted_anchor(anchor))
            .await
            .unwrap()
            .unwrap();

        let greeting = connector.probe(addr, "localhost").await.unwrap();
        assert_eq!(greeting, crate::proxy::GREETING);
    }

    /// Tests that a name that is not a valid SNI is refused before any
    /// handshake.
    #[tokio::test]
    async fn invalid_sni() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let verifier = Arc::new(AnchorVerifier::new(
            Arc::new(TrustAnchorStore::new()),
            false,
            crate::contract::ContractClient::detached(),
        ));
        let connector = UpstreamConnector::new(verifier);

        assert!(matches!(
            connector.connect_upstream(addr, "not a host name").await,
            Err(TunnelError::InvalidSni(_))
        ));
    }
}
