//! Network profile and bandwidth grammar

use serde::{Deserialize, Serialize};

use crate::{ReplayError, Result};

/// A bandwidth cap, `0` meaning unlimited
///
/// Parsed from `<number>[K|M](bit/s|Byte/s)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bandwidth {
    bits_per_sec: u64,
}

impl Bandwidth {
    /// Unlimited bandwidth
    pub const UNLIMITED: Self = Self { bits_per_sec: 0 };

    /// Parse the bandwidth grammar; `"0"` means unlimited
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Argument`] on malformed values
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "0" {
            return Ok(Self::UNLIMITED);
        }

        let digits_end = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (number, unit) = value.split_at(digits_end);
        let number: u64 = number
            .parse()
            .map_err(|_| malformed(value))?;
        if number == 0 {
            return Err(malformed(value));
        }

        let (multiplier, unit) = match unit.chars().next() {
            Some('K') => (1_000, &unit[1..]),
            Some('M') => (1_000_000, &unit[1..]),
            _ => (1, unit),
        };
        let bits_per_sec = match unit {
            "bit/s" => number * multiplier,
            "Byte/s" => number * multiplier * 8,
            _ => return Err(malformed(value)),
        };

        Ok(Self { bits_per_sec })
    }

    /// Whether this cap is unlimited
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.bits_per_sec == 0
    }

    /// The cap in bits per second (0 when unlimited)
    #[must_use]
    pub fn bits_per_sec(&self) -> u64 {
        self.bits_per_sec
    }

    /// The cap in bytes per second (0 when unlimited)
    #[must_use]
    pub fn bytes_per_sec(&self) -> u64 {
        self.bits_per_sec / 8
    }
}

fn malformed(value: &str) -> ReplayError {
    ReplayError::Argument(format!(
        "malformed bandwidth '{value}': expected <number>[K|M](bit/s|Byte/s) or 0"
    ))
}

/// The per-session network emulation profile
///
/// Immutable for the session's lifetime and emitted verbatim in the
/// session summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    /// Upload bandwidth cap
    pub up: Bandwidth,
    /// Download bandwidth cap
    pub down: Bandwidth,
    /// One-way propagation delay in milliseconds
    pub delay_ms: u32,
    /// Packet loss probability in `[0, 1]`
    pub loss_rate: f64,
    /// Initial congestion window override (0 = kernel default)
    pub init_cwnd: u32,
    /// Whether the session replays over the encrypted listener
    pub secure: bool,
}

impl NetworkProfile {
    /// Build and validate a profile from CLI values
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Argument`] for malformed bandwidth values
    /// or a loss rate outside `[0, 1]`
    pub fn new(
        up: &str,
        down: &str,
        delay_ms: u32,
        loss_rate: f64,
        init_cwnd: u32,
        secure: bool,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&loss_rate) {
            return Err(ReplayError::Argument(format!(
                "packet loss rate {loss_rate} outside [0, 1]"
            )));
        }
        Ok(Self {
            up: Bandwidth::parse(up)?,
            down: Bandwidth::parse(down)?,
            delay_ms,
            loss_rate,
            init_cwnd,
            secure,
        })
    }

    /// A profile with no shaping terms
    #[must_use]
    pub fn unshaped() -> Self {
        Self {
            up: Bandwidth::UNLIMITED,
            down: Bandwidth::UNLIMITED,
            delay_ms: 0,
            loss_rate: 0.0,
            init_cwnd: 0,
            secure: false,
        }
    }

    /// Whether the profile requires any packet-scheduling rules
    #[must_use]
    pub fn is_unshaped(&self) -> bool {
        self.up.is_unlimited()
            && self.down.is_unlimited()
            && self.delay_ms == 0
            && self.loss_rate == 0.0
            && self.init_cwnd == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(Bandwidth::parse("0").unwrap(), Bandwidth::UNLIMITED);
        assert_eq!(Bandwidth::parse("300bit/s").unwrap().bits_per_sec(), 300);
        assert_eq!(
            Bandwidth::parse("128KByte/s").unwrap().bits_per_sec(),
            128 * 1000 * 8
        );
        assert_eq!(
            Bandwidth::parse("4Mbit/s").unwrap().bits_per_sec(),
            4_000_000
        );
        assert_eq!(
            Bandwidth::parse("1MByte/s").unwrap().bytes_per_sec(),
            1_000_000
        );
    }

    #[test]
    fn test_parse_malformed() {
        for bad in ["4", "Mbit/s", "4Gbit/s", "4Mbps", "-1Kbit/s", "0Kbit/s", ""] {
            let err = Bandwidth::parse(bad).unwrap_err();
            assert!(matches!(err, ReplayError::Argument(_)), "{bad}");
        }
    }

    #[test]
    fn test_profile_validation() {
        let profile = NetworkProfile::new("1Mbit/s", "4Mbit/s", 100, 0.01, 10, false).unwrap();
        assert!(!profile.is_unshaped());
        assert_eq!(profile.delay_ms, 100);

        let err = NetworkProfile::new("0", "0", 0, 1.5, 0, false).unwrap_err();
        assert!(matches!(err, ReplayError::Argument(_)));
    }

    #[test]
    fn test_unshaped() {
        assert!(NetworkProfile::unshaped().is_unshaped());
        let delayed = NetworkProfile::new("0", "0", 10, 0.0, 0, false).unwrap();
        assert!(!delayed.is_unshaped());
    }
}
