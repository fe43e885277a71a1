//! Local DNS interception
//!
//! Redirects captured names to the replay host while delegating the rest
//! to the real upstream resolver.

pub mod message;
mod rules;
mod server;

pub use rules::{is_private, DnsRule, RuleAction, RuleSet};
pub use server::{DnsServer, RealDns};

use std::time::Duration;

/// TTL for synthesised redirect answers
pub const REDIRECT_TTL_SECS: u32 = 60;

/// Timeout for a single upstream exchange
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// Upstream attempts per query (initial try plus one retry)
pub const UPSTREAM_ATTEMPTS: u32 = 2;
