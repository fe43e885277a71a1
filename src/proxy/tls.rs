//! Encrypted replay listener
//!
//! Serves the configured certificate; clients must be set up to trust
//! it. No certificates are forged, which is why record mode stays
//! HTTP-only.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::limit::ConnectionLimiter;
use super::service::{handle, ProxyState};
use super::DRAIN_TIMEOUT;
use crate::{ReplayError, Result};

/// TLS listener for encrypted replay with ALPN (`h2`, `http/1.1`)
pub struct TlsReplayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ProxyState>,
    limiter: ConnectionLimiter,
}

impl TlsReplayServer {
    /// Bind the listener with the configured certificate and key
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Tls`] for certificate problems,
    /// [`ReplayError::Privilege`] when the OS refuses the bind
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<ProxyState>,
        certfile: &Path,
        keyfile: &Path,
    ) -> Result<Self> {
        let config = load_tls_config(certfile, keyfile)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ReplayError::Privilege(format!("binding {addr}: {e}"))
            } else {
                ReplayError::Io(e)
            }
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "encrypted replay server listening");

        Ok(Self {
            listener,
            local_addr,
            acceptor,
            state,
            limiter: ConnectionLimiter::default(),
        })
    }

    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve connections until shutdown, then drain
    ///
    /// # Errors
    ///
    /// Returns error if the accept loop fails irrecoverably
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let Some(guard) = self.limiter.try_acquire() else {
                                warn!(%peer, "connection limit reached, rejecting");
                                drop(stream);
                                continue;
                            };
                            let acceptor = self.acceptor.clone();
                            let state = Arc::clone(&self.state);
                            connections.spawn(async move {
                                let _guard = guard;
                                let tls_stream = match acceptor.accept(stream).await {
                                    Ok(tls_stream) => tls_stream,
                                    Err(e) => {
                                        debug!(%peer, "TLS handshake failed: {e}");
                                        return;
                                    }
                                };

                                // SNI is informational only; it never affects matching
                                if let Some(sni) = tls_stream.get_ref().1.server_name() {
                                    debug!(%peer, sni, "TLS session established");
                                }

                                let service = service_fn(move |request| {
                                    handle(Arc::clone(&state), true, request)
                                });
                                let served = hyper_util::server::conn::auto::Builder::new(
                                    TokioExecutor::new(),
                                )
                                .serve_connection(TokioIo::new(tls_stream), service)
                                .await;
                                if let Err(e) = served {
                                    debug!("connection closed with error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("accept error: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(addr = %self.local_addr, "encrypted replay server shutting down");
                    break;
                }
            }
        }

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("drain deadline reached, aborting remaining connections");
            connections.abort_all();
        }
        Ok(())
    }
}

fn load_tls_config(certfile: &Path, keyfile: &Path) -> Result<ServerConfig> {
    let cert_pem = std::fs::File::open(certfile)
        .map_err(|e| ReplayError::Tls(format!("opening {}: {e}", certfile.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem))
        .collect::<std::io::Result<_>>()
        .map_err(|e| ReplayError::Tls(format!("reading {}: {e}", certfile.display())))?;
    if certs.is_empty() {
        return Err(ReplayError::Tls(format!(
            "no certificates in {}",
            certfile.display()
        )));
    }

    let key_pem = std::fs::File::open(keyfile)
        .map_err(|e| ReplayError::Tls(format!("opening {}: {e}", keyfile.display())))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem))
        .map_err(|e| ReplayError::Tls(format!("reading {}: {e}", keyfile.display())))?
        .ok_or_else(|| ReplayError::Tls(format!("no private key in {}", keyfile.display())))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ReplayError::Tls(format!("building TLS config: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}
