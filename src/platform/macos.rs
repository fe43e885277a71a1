//! macOS backend: networksetup and the pfctl/dummynet family

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use tracing::{info, warn};

use super::{run_tool, run_tool_tolerating, run_tool_with_stdin, PlatformSettings};
use crate::shaper::ShapingSpec;
use crate::{ReplayError, Result};

/// pf anchor owning our dummynet rules
const PF_ANCHOR: &str = "webreplay";

/// macOS platform settings
pub struct MacosSettings {
    dns_snapshot: Mutex<Option<HashMap<String, Vec<String>>>>,
}

impl MacosSettings {
    /// Create the backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            dns_snapshot: Mutex::new(None),
        }
    }

    fn network_services(&self) -> Result<Vec<String>> {
        let listing = run_tool("networksetup", &["-listallnetworkservices".to_string()])?;
        Ok(parse_services(&listing))
    }
}

impl Default for MacosSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformSettings for MacosSettings {
    fn primary_dns(&self) -> Result<IpAddr> {
        for service in self.network_services()? {
            let output =
                run_tool("networksetup", &["-getdnsservers".to_string(), service])?;
            if let Some(addr) = parse_dns_servers(&output).into_iter().next() {
                if let Ok(ip) = addr.parse() {
                    return Ok(ip);
                }
            }
        }
        // services configured by DHCP report no explicit servers; fall
        // back to the resolver file the system keeps in sync
        let content = std::fs::read_to_string("/etc/resolv.conf")?;
        content
            .lines()
            .filter_map(|line| line.trim().strip_prefix("nameserver"))
            .filter_map(|rest| rest.trim().parse().ok())
            .next()
            .ok_or_else(|| ReplayError::Dns("no primary DNS server found".to_string()))
    }

    fn set_primary_dns(&self, addr: IpAddr) -> Result<()> {
        let services = self.network_services()?;

        {
            let mut snapshot = self.dns_snapshot.lock().expect("dns snapshot poisoned");
            if snapshot.is_none() {
                let mut saved = HashMap::new();
                for service in &services {
                    let output = run_tool(
                        "networksetup",
                        &["-getdnsservers".to_string(), service.clone()],
                    )?;
                    saved.insert(service.clone(), parse_dns_servers(&output));
                }
                *snapshot = Some(saved);
            }
        }

        for service in &services {
            run_tool(
                "networksetup",
                &[
                    "-setdnsservers".to_string(),
                    service.clone(),
                    addr.to_string(),
                ],
            )?;
        }
        info!(%addr, "primary DNS redirected");
        Ok(())
    }

    fn restore_primary_dns(&self) -> Result<()> {
        let snapshot = self
            .dns_snapshot
            .lock()
            .expect("dns snapshot poisoned")
            .take();
        let Some(saved) = snapshot else {
            return Ok(());
        };

        for (service, servers) in saved {
            let mut args = vec!["-setdnsservers".to_string(), service];
            if servers.is_empty() {
                args.push("Empty".to_string());
            } else {
                args.extend(servers);
            }
            run_tool("networksetup", &args)?;
        }
        info!("primary DNS restored");
        Ok(())
    }

    fn install_shaping(&self, spec: &ShapingSpec) -> Result<()> {
        for args in pipe_commands(spec) {
            if let Err(e) = run_tool("dnctl", &args) {
                let _ = run_tool_tolerating("dnctl", &flush_args(), &[]);
                return Err(e);
            }
        }

        if let Err(e) = run_tool_with_stdin(
            "pfctl",
            &["-a".to_string(), PF_ANCHOR.to_string(), "-f".to_string(), "-".to_string()],
            &anchor_rules(spec),
        ) {
            let _ = run_tool_tolerating("dnctl", &flush_args(), &[]);
            return Err(e);
        }

        // pf may already be enabled; that is not a failure
        if let Err(e) = run_tool_tolerating("pfctl", &["-E".to_string()], &["pf already enabled"]) {
            warn!("enabling pf: {e}");
        }
        Ok(())
    }

    fn remove_shaping(&self, _spec: &ShapingSpec) -> Result<()> {
        run_tool_tolerating(
            "pfctl",
            &[
                "-a".to_string(),
                PF_ANCHOR.to_string(),
                "-F".to_string(),
                "all".to_string(),
            ],
            &["pf not enabled"],
        )?;
        run_tool_tolerating("dnctl", &flush_args(), &[])?;
        Ok(())
    }
}

fn parse_services(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip(1) // banner line
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .map(str::to_string)
        .collect()
}

fn parse_dns_servers(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.parse::<IpAddr>().is_ok())
        .map(str::to_string)
        .collect()
}

/// dnctl pipe configuration, one pipe per direction
fn pipe_commands(spec: &ShapingSpec) -> Vec<Vec<String>> {
    vec![
        pipe_config(1, spec.profile.up.bits_per_sec(), spec.profile.delay_ms, spec.profile.loss_rate),
        pipe_config(2, spec.profile.down.bits_per_sec(), spec.profile.delay_ms, spec.profile.loss_rate),
    ]
}

fn pipe_config(pipe: u32, bits_per_sec: u64, delay_ms: u32, loss_rate: f64) -> Vec<String> {
    let mut args = vec![
        "pipe".to_string(),
        pipe.to_string(),
        "config".to_string(),
    ];
    if bits_per_sec > 0 {
        args.push("bw".to_string());
        args.push(format!("{bits_per_sec}bit/s"));
    }
    if delay_ms > 0 {
        args.push("delay".to_string());
        args.push(delay_ms.to_string());
    }
    if loss_rate > 0.0 {
        args.push("plr".to_string());
        args.push(loss_rate.to_string());
    }
    args
}

fn flush_args() -> Vec<String> {
    vec!["-q".to_string(), "flush".to_string()]
}

/// pf anchor rules steering replay-port traffic through the pipes
fn anchor_rules(spec: &ShapingSpec) -> String {
    format!(
        "dummynet in proto tcp from any to any port {port} pipe 1\n\
         dummynet out proto tcp from any port {port} to any pipe 2\n",
        port = spec.port
    )
}
