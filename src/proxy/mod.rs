//! The HTTP(S) replay engine
//!
//! Terminates intercepted TCP flows and either records the exchange
//! against the live origin or answers strictly from the archive.

mod http;
mod inject;
mod limit;
mod origin;
mod service;
mod tls;

pub use http::HttpReplayServer;
pub use inject::{inject, is_html, DETERMINISTIC_SCRIPT};
pub use limit::{ConnectionGuard, ConnectionLimiter};
pub use origin::{fetch_origin, FetchedResponse};
pub use service::{handle, Engine, ProxyState};
pub use tls::TlsReplayServer;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::Result;

/// Maximum number of concurrently served connections
pub const MAX_CONNECTIONS: usize = 4096;

/// Idle keep-alive timeout per connection
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Record-mode origin read timeout
pub const ORIGIN_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Drain window for in-flight handlers during shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The replay server variants; selection is a startup decision
pub enum ReplayServer {
    /// Plain HTTP/1.1 (replay and record), or `no-ssl` secure replay
    Plain(HttpReplayServer),
    /// Encrypted replay behind TLS with ALPN
    Tls(TlsReplayServer),
}

impl ReplayServer {
    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Self::Plain(server) => server.local_addr(),
            Self::Tls(server) => server.local_addr(),
        }
    }

    /// Accept and serve connections until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the accept loop fails irrecoverably
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        match self {
            Self::Plain(server) => server.run(shutdown).await,
            Self::Tls(server) => server.run(shutdown).await,
        }
    }
}
