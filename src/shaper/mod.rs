//! Traffic shaping between the browser and the replay server

mod profile;

pub use profile::{Bandwidth, NetworkProfile};

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::platform::PlatformSettings;
use crate::Result;

/// The shaping rules requested for one session
#[derive(Debug, Clone)]
pub struct ShapingSpec {
    /// Replay host the rules apply to
    pub host: IpAddr,
    /// Replay server port the rules match on
    pub port: u16,
    /// Emulated network profile
    pub profile: NetworkProfile,
}

/// Scoped traffic-shaping resource
///
/// Rules are active before `install` returns and removed on teardown
/// regardless of exit path; dropping an installed shaper removes them as
/// a last resort.
pub struct TrafficShaper {
    platform: Arc<dyn PlatformSettings>,
    spec: ShapingSpec,
    installed: bool,
}

impl TrafficShaper {
    /// Install shaping rules for the profile
    ///
    /// A profile with no shaping terms installs nothing and tears down
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReplayError::Privilege`] if the OS refuses the
    /// rules; nothing is left partially installed
    pub fn install(
        platform: Arc<dyn PlatformSettings>,
        host: IpAddr,
        port: u16,
        profile: NetworkProfile,
    ) -> Result<Self> {
        let spec = ShapingSpec {
            host,
            port,
            profile,
        };

        if spec.profile.is_unshaped() {
            info!("network profile has no shaping terms; shaper inactive");
            return Ok(Self {
                platform,
                spec,
                installed: false,
            });
        }

        platform.install_shaping(&spec)?;
        info!(
            port = spec.port,
            up_bps = spec.profile.up.bits_per_sec(),
            down_bps = spec.profile.down.bits_per_sec(),
            delay_ms = spec.profile.delay_ms,
            loss = spec.profile.loss_rate,
            "traffic shaping active"
        );
        Ok(Self {
            platform,
            spec,
            installed: true,
        })
    }

    /// Remove the installed rules; idempotent
    ///
    /// # Errors
    ///
    /// Returns error if removal is refused by the OS
    pub fn remove(&mut self) -> Result<()> {
        if !self.installed {
            return Ok(());
        }
        self.installed = false;
        self.platform.remove_shaping(&self.spec)?;
        info!("traffic shaping removed");
        Ok(())
    }

    /// Whether rules are currently installed
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

impl Drop for TrafficShaper {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("failed to remove shaping rules on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NullSettings;

    #[test]
    fn test_unshaped_profile_installs_nothing() {
        let platform = Arc::new(NullSettings::new());
        let shaper = TrafficShaper::install(
            platform,
            "127.0.0.1".parse().unwrap(),
            80,
            NetworkProfile::unshaped(),
        )
        .unwrap();
        assert!(!shaper.is_installed());
    }

    #[test]
    fn test_install_and_remove() {
        let platform = Arc::new(NullSettings::new());
        let profile = NetworkProfile::new("1Mbit/s", "4Mbit/s", 100, 0.0, 0, false).unwrap();
        let mut shaper =
            TrafficShaper::install(platform, "127.0.0.1".parse().unwrap(), 80, profile).unwrap();
        assert!(shaper.is_installed());

        shaper.remove().unwrap();
        assert!(!shaper.is_installed());
        // second remove is a no-op
        shaper.remove().unwrap();
    }
}
