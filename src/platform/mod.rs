//! Per-OS platform settings
//!
//! Capability surface for the two pieces of global mutable state the
//! harness touches: the system's primary DNS resolver and the kernel's
//! packet-scheduling rules. Concrete backends select themselves from the
//! running OS at startup.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;

use std::net::IpAddr;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;

use crate::shaper::ShapingSpec;
use crate::{ReplayError, Result};

/// Capability set over platform-global state
///
/// The DNS snapshot is taken once per process; repeated set/restore
/// calls are idempotent. Operations the OS refuses fail with
/// [`ReplayError::Privilege`] and leave no partial state behind.
pub trait PlatformSettings: Send + Sync {
    /// Current primary DNS resolver address
    ///
    /// # Errors
    ///
    /// Returns error if the resolver configuration cannot be read
    fn primary_dns(&self) -> Result<IpAddr>;

    /// Snapshot the resolver configuration and point it at `addr`
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Privilege`] if the OS refuses the change
    fn set_primary_dns(&self, addr: IpAddr) -> Result<()>;

    /// Reinstate the snapshot taken by `set_primary_dns`
    ///
    /// A no-op when no snapshot exists, so every exit path may call it.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Privilege`] if the OS refuses the change
    fn restore_primary_dns(&self) -> Result<()>;

    /// Install the packet-scheduling rules for a shaping spec
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Privilege`] on refusal; partial rule sets
    /// are rolled back before the error propagates
    fn install_shaping(&self, spec: &ShapingSpec) -> Result<()>;

    /// Remove the packet-scheduling rules for a shaping spec
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Privilege`] if removal is refused
    fn remove_shaping(&self, spec: &ShapingSpec) -> Result<()>;
}

/// Select the backend for the running OS
///
/// # Errors
///
/// Returns [`ReplayError::Privilege`] on platforms without a backend
pub fn native() -> Result<Arc<dyn PlatformSettings>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxSettings::new()))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(macos::MacosSettings::new()))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(ReplayError::Privilege(format!(
            "no platform settings backend for {}",
            std::env::consts::OS
        )))
    }
}

/// Inert backend: records the DNS override in memory and installs no
/// rules. Used by server-only sessions and tests.
#[derive(Debug, Default)]
pub struct NullSettings {
    dns: Mutex<Option<IpAddr>>,
}

impl NullSettings {
    /// Create an inert backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The DNS override currently recorded, if any
    #[must_use]
    pub fn dns_override(&self) -> Option<IpAddr> {
        *self.dns.lock().expect("dns lock poisoned")
    }
}

impl PlatformSettings for NullSettings {
    fn primary_dns(&self) -> Result<IpAddr> {
        Ok(IpAddr::from([127, 0, 0, 1]))
    }

    fn set_primary_dns(&self, addr: IpAddr) -> Result<()> {
        *self.dns.lock().expect("dns lock poisoned") = Some(addr);
        Ok(())
    }

    fn restore_primary_dns(&self) -> Result<()> {
        self.dns.lock().expect("dns lock poisoned").take();
        Ok(())
    }

    fn install_shaping(&self, _spec: &ShapingSpec) -> Result<()> {
        Ok(())
    }

    fn remove_shaping(&self, _spec: &ShapingSpec) -> Result<()> {
        Ok(())
    }
}

/// Run a system tool, treating refusal as a privilege error
#[allow(dead_code)]
fn run_tool(program: &str, args: &[String]) -> Result<String> {
    run_tool_tolerating(program, args, &[])
}

/// Run a system tool; stderr fragments in `tolerated` downgrade a
/// failure to success (used for already-absent rules during teardown)
#[allow(dead_code)]
fn run_tool_tolerating(program: &str, args: &[String], tolerated: &[&str]) -> Result<String> {
    debug!(%program, ?args, "running platform tool");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReplayError::Privilege(format!("'{program}' not found on PATH"))
            } else {
                ReplayError::Privilege(format!("spawning '{program}': {e}"))
            }
        })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if tolerated.iter().any(|fragment| stderr.contains(fragment)) {
        return Ok(String::new());
    }
    Err(ReplayError::Privilege(format!(
        "'{program} {}' failed: {}",
        args.join(" "),
        stderr.trim()
    )))
}

/// Run a system tool with bytes piped to stdin
#[allow(dead_code)]
fn run_tool_with_stdin(program: &str, args: &[String], input: &str) -> Result<String> {
    use std::io::Write;

    debug!(%program, ?args, "running platform tool with stdin");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReplayError::Privilege(format!("'{program}' not found on PATH"))
            } else {
                ReplayError::Privilege(format!("spawning '{program}': {e}"))
            }
        })?;

    child
        .stdin
        .as_mut()
        .expect("stdin was piped")
        .write_all(input.as_bytes())
        .map_err(|e| ReplayError::Privilege(format!("writing to '{program}': {e}")))?;

    let output = child
        .wait_with_output()
        .map_err(|e| ReplayError::Privilege(format!("waiting for '{program}': {e}")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ReplayError::Privilege(format!(
            "'{program}' failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_settings_idempotent() {
        let settings = NullSettings::new();
        assert!(settings.dns_override().is_none());

        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        settings.set_primary_dns(addr).unwrap();
        settings.set_primary_dns(addr).unwrap();
        assert_eq!(settings.dns_override(), Some(addr));

        settings.restore_primary_dns().unwrap();
        settings.restore_primary_dns().unwrap();
        assert!(settings.dns_override().is_none());
    }
}
