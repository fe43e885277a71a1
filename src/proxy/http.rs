//! Plain-TCP replay listener

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::limit::ConnectionLimiter;
use super::service::{handle, ProxyState};
use super::{DRAIN_TIMEOUT, IDLE_TIMEOUT};
use crate::{ReplayError, Result};

/// HTTP/1.1 listener used for plain replay and for record mode
///
/// With `secure` set it runs the multiplexed protocol stack without TLS
/// and suppresses script injection, serving the `no-ssl` variant of the
/// encrypted replay path.
pub struct HttpReplayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ProxyState>,
    limiter: ConnectionLimiter,
    secure: bool,
}

impl HttpReplayServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Privilege`] when the OS refuses the bind
    /// (port 80 normally needs privilege), or an I/O error otherwise
    pub async fn bind(addr: SocketAddr, state: Arc<ProxyState>, secure: bool) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ReplayError::Privilege(format!("binding {addr}: {e}"))
            } else {
                ReplayError::Io(e)
            }
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, secure, "replay server listening");

        Ok(Self {
            listener,
            local_addr,
            state,
            limiter: ConnectionLimiter::default(),
            secure,
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
                            let state = Arc::clone(&self.state);
                            let secure = self.secure;
                            connections.spawn(async move {
                                let _guard = guard;
                                serve_connection(stream, state, secure).await;
                            });
                        }
                        Err(e) => {
                            warn!("accept error: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(addr = %self.local_addr, "replay server shutting down");
                    break;
                }
            }
        }

        // give in-flight handlers the drain window, then cut them off
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

async fn serve_connection(stream: tokio::net::TcpStream, state: Arc<ProxyState>, secure: bool) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |request| handle(Arc::clone(&state), secure, request));

    let served = if secure {
        // no-ssl secure replay still speaks the multiplexed stack
        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| e.to_string())
    } else {
        hyper::server::conn::http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(IDLE_TIMEOUT)
            .keep_alive(true)
            .serve_connection(io, service)
            .await
            .map_err(|e| e.to_string())
    };

    if let Err(e) = served {
        debug!("connection closed with error: {e}");
    }
}
