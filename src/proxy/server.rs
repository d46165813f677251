//! Local TLS endpoint that serves a fixed greeting.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Bytes written to every client that completes a handshake.
pub const GREETING: &[u8] = b"anchor-intercept loopback\n";

/// TLS server on localhost, used to exercise trust evaluation end to end.
pub struct LoopbackServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl LoopbackServer {
    /// Binds to localhost on an ephemeral port.
    pub async fn bind(config: Arc<ServerConfig>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        info!("loopback server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accepts connections forever.
    pub async fn run(self) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let acceptor = self.acceptor.clone();

            tokio::spawn(async move {
                if let Err(e) = greet(stream, acceptor).await {
                    // Expected whenever the client does not trust us yet.
                    warn!("loopback connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn greet(stream: TcpStream, acceptor: TlsAcceptor) -> Result<(), std::io::Error> {
    let mut tls_stream = acceptor.accept(stream).await?;
    debug!("loopback handshake completed");
    tls_stream.write_all(GREETING).await?;
    tls_stream.shutdown().await
}
