//! DNS interception rules

use std::net::IpAddr;

/// Action taken for a matched name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Answer with the replay host address
    RedirectToReplayHost,
    /// Delegate upstream; keep the real answer only if it is private
    PassthroughIfPrivate,
    /// Delegate upstream and return the answer verbatim
    DelegateUpstream,
}

/// One `(pattern, action)` pair
#[derive(Debug, Clone)]
pub struct DnsRule {
    /// Name pattern: `*`, `*.suffix`, or an exact name
    pub pattern: String,
    /// Action for names matching the pattern
    pub action: RuleAction,
}

/// Ordered rule list, evaluated first-match-wins
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<DnsRule>,
}

impl RuleSet {
    /// Build a rule set from an ordered list
    #[must_use]
    pub fn new(rules: Vec<DnsRule>) -> Self {
        Self { rules }
    }

    /// Default session rules: capture everything, optionally letting
    /// names that resolve to private addresses keep working
    #[must_use]
    pub fn for_session(private_passthrough: bool) -> Self {
        let action = if private_passthrough {
            RuleAction::PassthroughIfPrivate
        } else {
            RuleAction::RedirectToReplayHost
        };
        Self::new(vec![DnsRule {
            pattern: "*".to_string(),
            action,
        }])
    }

    /// Evaluate a name; unmatched names delegate upstream
    #[must_use]
    pub fn evaluate(&self, name: &str) -> RuleAction {
        let name = normalize(name);
        for rule in &self.rules {
            if pattern_matches(&rule.pattern, &name) {
                return rule.action;
            }
        }
        RuleAction::DelegateUpstream
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern = normalize(pattern);
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return name == suffix || name.ends_with(&format!(".{suffix}"));
    }
    name == pattern
}

/// Whether an address belongs to a private, loopback, or link-local range
///
/// Covers RFC1918, 127/8, 169.254/16, and the IPv6 loopback, link-local,
/// and unique-local ranges.
#[must_use]
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || (octets[0] == 169 && octets[1] == 254)
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || (segments[0] & 0xffc0) == 0xfe80
                || (segments[0] & 0xfe00) == 0xfc00
        }
    }
}
