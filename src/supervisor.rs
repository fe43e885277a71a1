//! Session lifecycle
//!
//! Brings the subsystems up in dependency order (DNS, replay server,
//! traffic shaper), waits for an interrupt, and unwinds them in reverse
//! on every exit path. The supervisor is the single place that
//! guarantees DNS and shaping rules are reverted.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::archive::{epoch_millis, Archive, ArchiveWriter};
use crate::config::{Config, Mode, SecureMode};
use crate::dns::{DnsServer, RealDns, RuleSet};
use crate::platform::{self, PlatformSettings};
use crate::proxy::{HttpReplayServer, ProxyState, ReplayServer, TlsReplayServer, DRAIN_TIMEOUT};
use crate::shaper::TrafficShaper;
use crate::summary::{LogSummarySink, SessionSummary, SummarySink};
use crate::{ReplayError, Result};

const DNS_PORT: u16 = 53;

/// Origin port contacted in record mode (record is HTTP-only)
const ORIGIN_HTTP_PORT: u16 = 80;

/// Run the configured session to completion
///
/// # Errors
///
/// Returns the first fatal error; scoped platform changes are reverted
/// before it propagates
pub async fn run(config: Config) -> Result<()> {
    if let Some(remote) = config.server {
        return run_client(remote).await;
    }
    if config.server_mode {
        return run_server_only(config).await;
    }
    run_session(config).await
}

/// Client mode: point the system DNS at a remote replay host and block
async fn run_client(remote: IpAddr) -> Result<()> {
    let platform = platform::native()?;
    let mut dns_guard = DnsOverrideGuard::set(platform, remote)?;
    info!(%remote, "system DNS pointed at remote replay host; interrupt to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ReplayError::Other(format!("waiting for interrupt: {e}")))?;
    info!("shutting down");

    dns_guard.restore()
}

/// Serve-only mode: replay server on the external address, no local DNS
/// redirection and no shaping
async fn run_server_only(config: Config) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let state = Arc::new(build_state(&config, RealDns::System, &shutdown_tx)?);

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    let server = bind_server(&config, bind_addr, Arc::clone(&state)).await?;
    info!(
        external = %external_ip(),
        port = config.port,
        "server mode: remote clients may point their DNS here"
    );

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(server.run(shutdown_tx.subscribe()));

    let started_at = epoch_millis();
    wait_for_exit(&shutdown_tx, &mut tasks).await;

    shutdown_tx.send(()).ok();
    drain_tasks(&mut tasks).await;

    let archive_id = state.finalize().await?;
    emit_summary(&config, &state, archive_id, started_at)
}

/// Normal session: DNS interceptor, replay server, and traffic shaper
async fn run_session(config: Config) -> Result<()> {
    let platform = platform::native()?;
    let upstream = SocketAddr::new(platform.primary_dns()?, DNS_PORT);
    let host = IpAddr::V4(Ipv4Addr::LOCALHOST);

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let rules = RuleSet::for_session(config.dns_private_passthrough);
    let dns = DnsServer::bind(SocketAddr::new(host, DNS_PORT), upstream, host, rules).await?;
    let resolver = dns.resolver();

    let state = Arc::new(build_state(&config, resolver, &shutdown_tx)?);
    let server = bind_server(&config, SocketAddr::new(host, config.port), Arc::clone(&state)).await?;

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(dns.run(shutdown_tx.subscribe()));
    tasks.spawn(server.run(shutdown_tx.subscribe()));

    let mut dns_guard = if config.dns_forwarding {
        Some(DnsOverrideGuard::set(Arc::clone(&platform), host)?)
    } else {
        None
    };

    let mut shaper = match TrafficShaper::install(
        Arc::clone(&platform),
        host,
        config.port,
        config.profile.clone(),
    ) {
        Ok(shaper) => shaper,
        Err(e) => {
            if let Some(guard) = dns_guard.as_mut() {
                let _ = guard.restore();
            }
            shutdown_tx.send(()).ok();
            drain_tasks(&mut tasks).await;
            return Err(e);
        }
    };

    let started_at = epoch_millis();
    info!(mode = config.mode.as_str(), "session running; interrupt to stop");
    wait_for_exit(&shutdown_tx, &mut tasks).await;

    // teardown in reverse: shaper, then the servers, then the DNS setting
    shutdown_tx.send(()).ok();
    if let Err(e) = shaper.remove() {
        warn!("removing shaping rules: {e}");
    }
    drain_tasks(&mut tasks).await;

    let finalized = state.finalize().await;
    if let Some(guard) = dns_guard.as_mut() {
        if let Err(e) = guard.restore() {
            warn!("restoring primary DNS: {e}");
        }
    }

    let archive_id = finalized?;
    emit_summary(&config, &state, archive_id, started_at)
}

fn build_state(
    config: &Config,
    resolver: RealDns,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<ProxyState> {
    let replay_file = config
        .replay_file
        .as_ref()
        .ok_or_else(|| ReplayError::Argument("must specify a replay_file".to_string()))?;

    match config.mode {
        Mode::Record => {
            let writer = ArchiveWriter::create(replay_file)?;
            Ok(ProxyState::record(
                writer,
                resolver,
                ORIGIN_HTTP_PORT,
                shutdown_tx.clone(),
            ))
        }
        Mode::Replay => {
            let archive = Archive::load(replay_file)?;
            Ok(ProxyState::replay(archive, config.inject_script))
        }
    }
}

async fn bind_server(
    config: &Config,
    addr: SocketAddr,
    state: Arc<ProxyState>,
) -> Result<ReplayServer> {
    match config.secure {
        SecureMode::Tls => {
            let certfile = config.certfile.as_ref().ok_or_else(|| {
                ReplayError::Argument("--spdy requires --certfile".to_string())
            })?;
            let keyfile = config.keyfile.as_ref().ok_or_else(|| {
                ReplayError::Argument("--spdy requires --keyfile".to_string())
            })?;
            Ok(ReplayServer::Tls(
                TlsReplayServer::bind(addr, state, certfile, keyfile).await?,
            ))
        }
        SecureMode::NoSsl => Ok(ReplayServer::Plain(
            HttpReplayServer::bind(addr, state, true).await?,
        )),
        SecureMode::Off => Ok(ReplayServer::Plain(
            HttpReplayServer::bind(addr, state, false).await?,
        )),
    }
}

/// Block until an interrupt arrives, a subsystem aborts the session, or
/// a task exits early
async fn wait_for_exit(shutdown_tx: &broadcast::Sender<()>, tasks: &mut JoinSet<Result<()>>) {
    let mut abort_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = abort_rx.recv() => {
            warn!("session aborted by a subsystem");
        }
        Some(result) = tasks.join_next() => {
            match result {
                Ok(Ok(())) => info!("subsystem exited"),
                Ok(Err(e)) => warn!("subsystem failed: {e}"),
                Err(e) => warn!("subsystem panicked: {e}"),
            }
        }
    }
}

/// Join remaining tasks within the drain window, then abort stragglers
async fn drain_tasks(tasks: &mut JoinSet<Result<()>>) {
    let deadline = DRAIN_TIMEOUT + Duration::from_secs(1);
    let drained = tokio::time::timeout(deadline, async {
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("task exited with error: {e}"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("task panicked: {e}"),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("drain deadline reached, aborting remaining tasks");
        tasks.abort_all();
    }
}

fn emit_summary(
    config: &Config,
    state: &ProxyState,
    archive_id: String,
    started_at: u64,
) -> Result<()> {
    let (hits, misses) = state.hit_miss();
    let summary = SessionSummary {
        mode: config.mode.as_str().to_string(),
        archive_id,
        profile: config.profile.clone(),
        started_at_ms: started_at,
        finished_at_ms: epoch_millis(),
        replay_hits: hits,
        replay_misses: misses,
        urls: state.stats().snapshot(),
    };
    LogSummarySink.emit_summary(&summary)
}

/// The address remote clients should use to reach this host
fn external_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |addr| addr.ip())
}

/// Scoped primary-DNS override; restored exactly once, on drop at the
/// latest
struct DnsOverrideGuard {
    platform: Arc<dyn PlatformSettings>,
    active: bool,
}

impl DnsOverrideGuard {
    fn set(platform: Arc<dyn PlatformSettings>, addr: IpAddr) -> Result<Self> {
        platform.set_primary_dns(addr)?;
        Ok(Self {
            platform,
            active: true,
        })
    }

    fn restore(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.platform.restore_primary_dns()
    }
}

impl Drop for DnsOverrideGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.platform.restore_primary_dns() {
                warn!("restoring primary DNS on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NullSettings;

    #[test]
    fn test_dns_guard_restores_once() {
        let platform = Arc::new(NullSettings::new());
        let addr: IpAddr = "127.0.0.1".parse().unwrap();

        let mut guard = DnsOverrideGuard::set(Arc::clone(&platform) as Arc<dyn PlatformSettings>, addr).unwrap();
        assert_eq!(platform.dns_override(), Some(addr));

        guard.restore().unwrap();
        assert!(platform.dns_override().is_none());

        // drop after explicit restore must not restore again
        platform.set_primary_dns(addr).unwrap();
        drop(guard);
        assert_eq!(platform.dns_override(), Some(addr));
        platform.restore_primary_dns().unwrap();
    }

    #[test]
    fn test_dns_guard_restores_on_drop() {
        let platform = Arc::new(NullSettings::new());
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        {
            let _guard = DnsOverrideGuard::set(Arc::clone(&platform) as Arc<dyn PlatformSettings>, addr).unwrap();
            assert_eq!(platform.dns_override(), Some(addr));
        }
        assert!(platform.dns_override().is_none());
    }

    #[test]
    fn test_external_ip_is_some_address() {
        // must never panic, even without a network
        let _ = external_ip();
    }
}
