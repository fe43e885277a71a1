//! Linux backend: /etc/resolv.conf and the tc/netem family

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};

use super::{run_tool, run_tool_tolerating, PlatformSettings};
use crate::shaper::ShapingSpec;
use crate::{ReplayError, Result};

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Shaping device; local replay traffic rides the loopback interface
const DEVICE: &str = "lo";

/// Linux platform settings
pub struct LinuxSettings {
    resolv_conf: PathBuf,
    dns_snapshot: Mutex<Option<String>>,
}

impl LinuxSettings {
    /// Create the backend against the system resolv.conf
    #[must_use]
    pub fn new() -> Self {
        Self::with_resolv_conf(PathBuf::from(RESOLV_CONF))
    }

    /// Create the backend against a specific resolver file
    #[must_use]
    pub fn with_resolv_conf(resolv_conf: PathBuf) -> Self {
        Self {
            resolv_conf,
            dns_snapshot: Mutex::new(None),
        }
    }
}

impl Default for LinuxSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformSettings for LinuxSettings {
    fn primary_dns(&self) -> Result<IpAddr> {
        let content = std::fs::read_to_string(&self.resolv_conf)?;
        parse_nameserver(&content).ok_or_else(|| {
            ReplayError::Dns(format!(
                "no nameserver entry in {}",
                self.resolv_conf.display()
            ))
        })
    }

    fn set_primary_dns(&self, addr: IpAddr) -> Result<()> {
        let content = std::fs::read_to_string(&self.resolv_conf)?;

        {
            let mut snapshot = self.dns_snapshot.lock().expect("dns snapshot poisoned");
            // snapshot once; repeated sets keep the original
            if snapshot.is_none() {
                *snapshot = Some(content.clone());
            }
        }

        let updated = replace_nameserver(&content, addr);
        std::fs::write(&self.resolv_conf, updated).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ReplayError::Privilege(format!("writing {}: {e}", self.resolv_conf.display()))
            } else {
                ReplayError::Io(e)
            }
        })?;
        info!(%addr, "primary DNS redirected");
        Ok(())
    }

    fn restore_primary_dns(&self) -> Result<()> {
        let snapshot = self
            .dns_snapshot
            .lock()
            .expect("dns snapshot poisoned")
            .take();
        let Some(content) = snapshot else {
            return Ok(());
        };
        std::fs::write(&self.resolv_conf, content).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ReplayError::Privilege(format!("restoring {}: {e}", self.resolv_conf.display()))
            } else {
                ReplayError::Io(e)
            }
        })?;
        info!("primary DNS restored");
        Ok(())
    }

    fn install_shaping(&self, spec: &ShapingSpec) -> Result<()> {
        let commands = install_commands(spec);
        for (index, args) in commands.iter().enumerate() {
            if let Err(e) = run_tool("tc", args) {
                // roll back whatever made it in
                if index > 0 {
                    let _ = run_tool_tolerating("tc", &delete_root_args(), TOLERATED_DELETE);
                }
                return Err(e);
            }
        }

        if spec.profile.init_cwnd > 0 {
            if let Err(e) = run_tool("ip", &initcwnd_args(spec.profile.init_cwnd)) {
                warn!("initcwnd override not applied: {e}");
            }
        }
        Ok(())
    }

    fn remove_shaping(&self, _spec: &ShapingSpec) -> Result<()> {
        run_tool_tolerating("tc", &delete_root_args(), TOLERATED_DELETE)?;
        Ok(())
    }
}

/// tc errors that mean the rules are already gone
const TOLERATED_DELETE: &[&str] = &["No such file or directory", "Invalid argument"];

fn parse_nameserver(content: &str) -> Option<IpAddr> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse().ok())
        .next()
}

/// Rewrite resolv.conf so `addr` is the only nameserver, keeping every
/// other directive in place
fn replace_nameserver(content: &str, addr: IpAddr) -> String {
    let mut out = String::with_capacity(content.len() + 32);
    out.push_str(&format!("nameserver {addr}\n"));
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("nameserver") && !trimmed.starts_with('#') {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// The tc command sequence for a shaping spec: a prio root, one netem
/// qdisc per direction, and u32 port filters steering traffic into them
fn install_commands(spec: &ShapingSpec) -> Vec<Vec<String>> {
    let mut commands = vec![to_args(&format!(
        "qdisc add dev {DEVICE} root handle 1: prio bands 4"
    ))];

    let upload = netem_terms(
        spec.profile.up.bits_per_sec(),
        spec.profile.delay_ms,
        spec.profile.loss_rate,
    );
    let download = netem_terms(
        spec.profile.down.bits_per_sec(),
        spec.profile.delay_ms,
        spec.profile.loss_rate,
    );

    commands.push(to_args(&format!(
        "qdisc add dev {DEVICE} parent 1:1 handle 10: netem {upload}"
    )));
    commands.push(to_args(&format!(
        "qdisc add dev {DEVICE} parent 1:2 handle 20: netem {download}"
    )));
    commands.push(to_args(&format!(
        "filter add dev {DEVICE} protocol ip parent 1:0 prio 1 u32 \
         match ip dport {} 0xffff flowid 1:1",
        spec.port
    )));
    commands.push(to_args(&format!(
        "filter add dev {DEVICE} protocol ip parent 1:0 prio 1 u32 \
         match ip sport {} 0xffff flowid 1:2",
        spec.port
    )));
    commands
}

fn delete_root_args() -> Vec<String> {
    to_args(&format!("qdisc del dev {DEVICE} root"))
}

fn initcwnd_args(cwnd: u32) -> Vec<String> {
    to_args(&format!(
        "route replace local 127.0.0.0/8 dev {DEVICE} initcwnd {cwnd}"
    ))
}

/// netem parameter string for one direction; empty terms are omitted
fn netem_terms(bits_per_sec: u64, delay_ms: u32, loss_rate: f64) -> String {
    let mut terms = Vec::new();
    if bits_per_sec > 0 {
        terms.push(format!("rate {bits_per_sec}bit"));
    }
    if delay_ms > 0 {
        terms.push(format!("delay {delay_ms}ms"));
    }
    if loss_rate > 0.0 {
        terms.push(format!("loss {}%", loss_rate * 100.0));
    }
    if terms.is_empty() {
        // netem requires at least one parameter; a zero delay is inert
        terms.push("delay 0ms".to_string());
    }
    terms.join(" ")
}

fn to_args(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
