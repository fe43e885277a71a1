//! UDP DNS interceptor

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::message::{
    build_answer, build_query, build_servfail, build_servfail_raw, Message, CLASS_IN, TYPE_A,
    TYPE_AAAA,
};
use super::rules::{is_private, RuleAction, RuleSet};
use super::{REDIRECT_TTL_SECS, UPSTREAM_ATTEMPTS, UPSTREAM_TIMEOUT};
use crate::{ReplayError, Result};

/// Maximum UDP payload accepted from clients and upstream
const MAX_PACKET: usize = 4096;

static QUERY_ID: AtomicU16 = AtomicU16::new(1);

/// Resolver capability that never recurses through the local redirector
///
/// Used by the record engine to find origin servers, and by tests to pin
/// resolution to a fixed address.
#[derive(Debug, Clone)]
pub enum RealDns {
    /// Query the given upstream resolver directly
    Upstream(SocketAddr),
    /// Use the system resolver; only safe while it is not redirected
    System,
    /// Always resolve to a fixed address
    Fixed(IpAddr),
}

impl RealDns {
    /// Resolve a host name to an address
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Dns`] if the upstream cannot be reached or
    /// returns no address records
    pub async fn lookup(&self, name: &str) -> Result<IpAddr> {
        match self {
            Self::Fixed(addr) => Ok(*addr),
            Self::System => {
                let mut addrs = tokio::net::lookup_host((name, 0))
                    .await
                    .map_err(|e| ReplayError::Dns(format!("resolving {name}: {e}")))?;
                addrs
                    .next()
                    .map(|addr| addr.ip())
                    .ok_or_else(|| ReplayError::Dns(format!("no addresses for {name}")))
            }
            Self::Upstream(upstream) => {
                // Literal addresses need no round-trip
                if let Ok(ip) = name.parse::<IpAddr>() {
                    return Ok(ip);
                }
                let id = QUERY_ID.fetch_add(1, Ordering::Relaxed);
                let query = build_query(id, name, TYPE_A);
                let reply = exchange(*upstream, &query).await?;
                let parsed = Message::parse(&reply)?;
                parsed
                    .answers
                    .iter()
                    .filter_map(super::message::Answer::ip)
                    .next()
                    .ok_or_else(|| {
                        ReplayError::Dns(format!("no address records for {name}"))
                    })
            }
        }
    }
}

/// UDP resolver that redirects captured names to the replay host
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    rules: Arc<RuleSet>,
    upstream: SocketAddr,
    replay_host: IpAddr,
}

impl DnsServer {
    /// Bind the resolver socket
    ///
    /// # Errors
    ///
    /// Returns error if the UDP socket cannot be bound (port 53 normally
    /// requires privilege)
    pub async fn bind(
        bind_addr: SocketAddr,
        upstream: SocketAddr,
        replay_host: IpAddr,
        rules: RuleSet,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ReplayError::Privilege(format!("binding DNS socket {bind_addr}: {e}"))
            } else {
                ReplayError::Io(e)
            }
        })?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, %upstream, "DNS interceptor bound");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            rules: Arc::new(rules),
            upstream,
            replay_host,
        })
    }

    /// Address the resolver is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Capability handle for real-DNS lookups
    #[must_use]
    pub fn resolver(&self) -> RealDns {
        RealDns::Upstream(self.upstream)
    }

    /// Serve queries until the shutdown signal fires
    ///
    /// Individual query failures are answered with SERVFAIL and logged;
    /// the loop only exits on shutdown.
    ///
    /// # Errors
    ///
    /// Returns error if the receive loop fails irrecoverably
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => {
                            let packet = buf[..len].to_vec();
                            let socket = Arc::clone(&self.socket);
                            let rules = Arc::clone(&self.rules);
                            let upstream = self.upstream;
                            let replay_host = self.replay_host;
                            tokio::spawn(async move {
                                let reply = handle_query(&packet, &rules, upstream, replay_host)
                                    .await
                                    .unwrap_or_else(|e| {
                                        warn!(%peer, "DNS query failed: {e}");
                                        build_servfail_raw(&packet)
                                    });
                                if let Err(e) = socket.send_to(&reply, peer).await {
                                    warn!(%peer, "failed to send DNS reply: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("DNS receive error: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("DNS interceptor shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_query(
    packet: &[u8],
    rules: &RuleSet,
    upstream: SocketAddr,
    replay_host: IpAddr,
) -> Result<Vec<u8>> {
    let query = Message::parse(packet)?;
    let Some(question) = query.question() else {
        return Ok(build_servfail(&query));
    };

    // Only IN A/AAAA are answered directly; everything else goes upstream
    if question.qclass != CLASS_IN || (question.qtype != TYPE_A && question.qtype != TYPE_AAAA) {
        return exchange(upstream, packet).await;
    }

    match rules.evaluate(&question.name) {
        RuleAction::RedirectToReplayHost => {
            debug!(name = %question.name, "redirecting to replay host");
            Ok(redirect(&query, question.qtype, replay_host))
        }
        RuleAction::DelegateUpstream => exchange(upstream, packet).await,
        RuleAction::PassthroughIfPrivate => {
            let reply = exchange(upstream, packet).await?;
            let parsed = Message::parse(&reply)?;
            let has_private = parsed
                .answers
                .iter()
                .filter_map(super::message::Answer::ip)
                .any(is_private);
            if has_private {
                debug!(name = %question.name, "passing through private answer");
                Ok(reply)
            } else {
                debug!(name = %question.name, "redirecting to replay host");
                Ok(redirect(&query, question.qtype, replay_host))
            }
        }
    }
}

/// Synthesise a redirect answer; an AAAA question against an IPv4 replay
/// host gets an empty NOERROR answer so the client falls back to A
fn redirect(query: &Message, qtype: u16, replay_host: IpAddr) -> Vec<u8> {
    let family_matches = matches!(
        (qtype, replay_host),
        (TYPE_A, IpAddr::V4(_)) | (TYPE_AAAA, IpAddr::V6(_))
    );
    if family_matches {
        build_answer(query, &[replay_host], REDIRECT_TTL_SECS)
    } else {
        build_answer(query, &[], REDIRECT_TTL_SECS)
    }
}

/// Forward a raw query to the upstream resolver and return its reply
/// verbatim, within the upstream timeout and retry budget
async fn exchange(upstream: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let mut last_err = None;
    for attempt in 0..UPSTREAM_ATTEMPTS {
        match exchange_once(upstream, query).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                debug!(%upstream, attempt, "upstream exchange failed: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ReplayError::Dns("upstream unreachable".to_string())))
}

async fn exchange_once(upstream: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let bind: SocketAddr = if upstream.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid bind address")
    } else {
        "[::]:0".parse().expect("valid bind address")
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.send_to(query, upstream).await?;

    let mut buf = vec![0u8; MAX_PACKET];
    let (len, _) = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| ReplayError::Transient(format!("upstream DNS timeout ({upstream})")))??;
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::FLAG_RESPONSE;

    async fn spawn_upstream(answers: &'static [&'static str]) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let query = Message::parse(&buf[..len]).unwrap();
                let ips: Vec<IpAddr> = answers.iter().map(|a| a.parse().unwrap()).collect();
                let reply = build_answer(&query, &ips, 300);
                socket.send_to(&reply, peer).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_redirect_rule() {
        let upstream = spawn_upstream(&["93.184.216.34"]).await;
        let rules = RuleSet::for_session(false);
        let query = build_query(1, "www.example.test", TYPE_A);

        let reply = handle_query(&query, &rules, upstream, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let parsed = Message::parse(&reply).unwrap();
        assert_eq!(
            parsed.answers[0].ip().unwrap(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert!(parsed.answers[0].ttl <= 60);
    }

    #[tokio::test]
    async fn test_private_passthrough() {
        let upstream = spawn_upstream(&["192.168.1.50"]).await;
        let rules = RuleSet::for_session(true);
        let query = build_query(2, "printer.corp.test", TYPE_A);

        let reply = handle_query(&query, &rules, upstream, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let parsed = Message::parse(&reply).unwrap();
        assert_eq!(
            parsed.answers[0].ip().unwrap(),
            "192.168.1.50".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_public_answer_redirected() {
        let upstream = spawn_upstream(&["93.184.216.34"]).await;
        let rules = RuleSet::for_session(true);
        let query = build_query(3, "www.example.test", TYPE_A);

        let reply = handle_query(&query, &rules, upstream, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let parsed = Message::parse(&reply).unwrap();
        assert_eq!(
            parsed.answers[0].ip().unwrap(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_aaaa_against_v4_host_is_empty() {
        let upstream = spawn_upstream(&[]).await;
        let rules = RuleSet::for_session(false);
        let query = build_query(4, "www.example.test", TYPE_AAAA);

        let reply = handle_query(&query, &rules, upstream, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let parsed = Message::parse(&reply).unwrap();
        assert_ne!(parsed.flags & FLAG_RESPONSE, 0);
        assert!(parsed.answers.is_empty());
    }

    #[tokio::test]
    async fn test_real_dns_lookup() {
        let upstream = spawn_upstream(&["93.184.216.34"]).await;
        let resolver = RealDns::Upstream(upstream);
        let ip = resolver.lookup("www.example.test").await.unwrap();
        assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_fixed_resolver() {
        let resolver = RealDns::Fixed("127.0.0.1".parse().unwrap());
        let ip = resolver.lookup("anything.test").await.unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_literal_address_short_circuit() {
        let resolver = RealDns::Upstream("127.0.0.1:9".parse().unwrap());
        let ip = resolver.lookup("10.0.0.7").await.unwrap();
        assert_eq!(ip, "10.0.0.7".parse::<IpAddr>().unwrap());
    }
}
