//! CLI surface and session configuration

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::warn;

use crate::shaper::NetworkProfile;
use crate::{ReplayError, Result};

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Record mode: fetch from live origins and archive the exchanges
    Record,
    /// Replay mode: answer strictly from the archive
    Replay,
}

impl Mode {
    /// Check if mode is Record
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Mode::Record)
    }

    /// Check if mode is Replay
    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, Mode::Replay)
    }

    /// Name used in logs and the session summary
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Record => "record",
            Mode::Replay => "replay",
        }
    }
}

/// How the replay listener speaks to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureMode {
    /// Plain HTTP/1.1
    Off,
    /// Encrypted stack behind TLS
    Tls,
    /// Encrypted stack semantics without TLS framing
    NoSsl,
}

/// Log verbosity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Everything, including per-request detail
    Debug,
    /// Lifecycle events
    Info,
    /// Recoverable problems
    Warning,
    /// Failures
    Error,
    /// Fatal failures only
    Critical,
}

impl LogLevel {
    /// Tracing filter directive for this level
    #[must_use]
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            // tracing has no level above error
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// Replays web pages under simulated network conditions
///
/// Record mode fetches live responses into the archive; replay mode
/// serves them back deterministically, with a 404 for anything the
/// archive does not contain. Must run with enough privilege to bind
/// port 53/80 and adjust system DNS.
#[derive(Debug, Parser)]
#[command(name = "webreplay", version, about, long_about = None)]
pub struct Cli {
    /// Archive file to record to or replay from
    #[arg(value_name = "replay_file")]
    pub replay_file: Option<PathBuf>,

    /// Download real responses and record them to the archive
    #[arg(short = 'r', long)]
    pub record: bool,

    /// Replay over the encrypted stack; `--spdy=no-ssl` skips TLS
    #[arg(
        short = 's',
        long,
        value_name = "MODE",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "ssl"
    )]
    pub spdy: Option<String>,

    /// Upload bandwidth in [K|M]{bit/s|Byte/s}; zero means unlimited
    #[arg(short = 'u', long, default_value = "0")]
    pub up: String,

    /// Download bandwidth in [K|M]{bit/s|Byte/s}; zero means unlimited
    #[arg(short = 'd', long, default_value = "0")]
    pub down: String,

    /// One-way propagation delay in milliseconds
    #[arg(short = 'm', long = "delay_ms", default_value_t = 0)]
    pub delay_ms: u32,

    /// Packet loss rate in [0..1]
    #[arg(short = 'p', long = "packet_loss_rate", default_value_t = 0.0)]
    pub packet_loss_rate: f64,

    /// Initial congestion window override (Linux only)
    #[arg(short = 'w', long = "init_cwnd", default_value_t = 0)]
    pub init_cwnd: u32,

    /// Port the replay server listens on
    #[arg(short = 'o', long, default_value_t = 80)]
    pub port: u16,

    /// Certificate file for the encrypted listener
    #[arg(short = 'c', long)]
    pub certfile: Option<PathBuf>,

    /// Key file for the encrypted listener
    #[arg(short = 'k', long)]
    pub keyfile: Option<PathBuf>,

    /// Point system DNS at a remote replay host and block
    #[arg(short = 'S', long, value_name = "IP")]
    pub server: Option<IpAddr>,

    /// Serve replay and shaping only; no local DNS redirection
    #[arg(short = 'M', long = "server_mode")]
    pub server_mode: bool,

    /// Don't inject the script that pins Date() and Math.random()
    #[arg(short = 'n', long = "no-deterministic_script")]
    pub no_deterministic_script: bool,

    /// Don't redirect system DNS to the local resolver
    #[arg(short = 'x', long = "no-dns_forwarding")]
    pub no_dns_forwarding: bool,

    /// Don't pass through names that resolve to private addresses
    #[arg(short = 'P', long = "no-dns_private_passthrough")]
    pub no_dns_private_passthrough: bool,

    /// Minimum verbosity level to log
    #[arg(short = 'l', long = "log_level", value_enum, default_value = "debug")]
    pub log_level: LogLevel,

    /// Log file to use in addition to stderr
    #[arg(short = 'f', long = "log_file")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Validate the flag combination and build the session configuration
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Argument`] for invalid combinations or
    /// malformed bandwidth/loss values
    pub fn into_config(self) -> Result<Config> {
        if self.server.is_some() && self.server_mode {
            return Err(ReplayError::Argument(
                "cannot run with both --server and --server_mode".to_string(),
            ));
        }
        if self.server.is_none() && self.replay_file.is_none() {
            return Err(ReplayError::Argument(
                "must specify a replay_file".to_string(),
            ));
        }

        if self.record {
            let shaping_flags = [
                ("--up", self.up != "0"),
                ("--down", self.down != "0"),
                ("--delay_ms", self.delay_ms != 0),
                ("--packet_loss_rate", self.packet_loss_rate != 0.0),
                ("--init_cwnd", self.init_cwnd != 0),
            ];
            for (flag, set) in shaping_flags {
                if set {
                    return Err(ReplayError::Argument(format!(
                        "option {flag} cannot be used with --record"
                    )));
                }
            }
            if self.spdy.is_some() {
                return Err(ReplayError::Argument(
                    "option --spdy cannot be used with --record".to_string(),
                ));
            }
        }

        let secure = match self.spdy.as_deref() {
            None => SecureMode::Off,
            Some("no-ssl") => SecureMode::NoSsl,
            Some(_) => SecureMode::Tls,
        };
        if secure == SecureMode::Tls && (self.certfile.is_none() || self.keyfile.is_none()) {
            return Err(ReplayError::Argument(
                "--spdy requires --certfile and --keyfile".to_string(),
            ));
        }

        let inject_script = !self.no_deterministic_script;
        if secure != SecureMode::Off && inject_script {
            warn!("--spdy suppresses deterministic script injection");
        }

        let profile = NetworkProfile::new(
            &self.up,
            &self.down,
            self.delay_ms,
            self.packet_loss_rate,
            self.init_cwnd,
            secure != SecureMode::Off,
        )?;

        Ok(Config {
            mode: if self.record { Mode::Record } else { Mode::Replay },
            replay_file: self.replay_file,
            port: self.port,
            profile,
            secure,
            certfile: self.certfile,
            keyfile: self.keyfile,
            inject_script,
            dns_forwarding: !self.no_dns_forwarding,
            dns_private_passthrough: !self.no_dns_private_passthrough,
            server: self.server,
            server_mode: self.server_mode,
        })
    }
}

/// Validated session configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Operating mode
    pub mode: Mode,
    /// Archive path; absent only in client mode
    pub replay_file: Option<PathBuf>,
    /// Replay server port
    pub port: u16,
    /// Network emulation profile
    pub profile: NetworkProfile,
    /// Listener protocol stack
    pub secure: SecureMode,
    /// Certificate file for the encrypted listener
    pub certfile: Option<PathBuf>,
    /// Key file for the encrypted listener
    pub keyfile: Option<PathBuf>,
    /// Whether replayed HTML gets the deterministic script
    pub inject_script: bool,
    /// Whether system DNS is redirected to the local resolver
    pub dns_forwarding: bool,
    /// Whether private-resolving names bypass the redirect
    pub dns_private_passthrough: bool,
    /// Remote replay host for client mode
    pub server: Option<IpAddr>,
    /// Serve-only mode
    pub server_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        Cli::try_parse_from(std::iter::once("webreplay").chain(args.iter().copied()))
            .map_err(|e| ReplayError::Argument(e.to_string()))?
            .into_config()
    }

    #[test]
    fn test_replay_defaults() {
        let config = parse(&["archive.wpr"]).unwrap();
        assert!(config.mode.is_replay());
        assert_eq!(config.port, 80);
        assert!(config.inject_script);
        assert!(config.dns_forwarding);
        assert!(config.dns_private_passthrough);
        assert!(config.profile.is_unshaped());
        assert_eq!(config.secure, SecureMode::Off);
    }

    #[test]
    fn test_record_mode() {
        let config = parse(&["--record", "archive.wpr"]).unwrap();
        assert!(config.mode.is_record());
    }

    #[test]
    fn test_record_excludes_shaping() {
        for args in [
            vec!["--record", "--up", "1Mbit/s", "archive.wpr"],
            vec!["--record", "--down", "1Mbit/s", "archive.wpr"],
            vec!["--record", "--delay_ms", "10", "archive.wpr"],
            vec!["--record", "--packet_loss_rate", "0.5", "archive.wpr"],
            vec!["--record", "--init_cwnd", "10", "archive.wpr"],
            vec!["--record", "--spdy", "archive.wpr"],
        ] {
            let err = parse(&args).unwrap_err();
            assert!(matches!(err, ReplayError::Argument(_)), "{args:?}");
            assert_eq!(err.exit_code(), 1);
        }
    }

    #[test]
    fn test_replay_file_required() {
        let err = parse(&[]).unwrap_err();
        assert!(matches!(err, ReplayError::Argument(_)));
    }

    #[test]
    fn test_client_mode_needs_no_file() {
        let config = parse(&["--server", "10.0.0.5"]).unwrap();
        assert_eq!(config.server, Some("10.0.0.5".parse().unwrap()));
        assert!(config.replay_file.is_none());
    }

    #[test]
    fn test_server_and_server_mode_exclusive() {
        let err = parse(&["--server", "10.0.0.5", "--server_mode", "a.wpr"]).unwrap_err();
        assert!(matches!(err, ReplayError::Argument(_)));
    }

    #[test]
    fn test_spdy_needs_certs() {
        let err = parse(&["--spdy", "archive.wpr"]).unwrap_err();
        assert!(matches!(err, ReplayError::Argument(_)));

        let config = parse(&[
            "--spdy", "--certfile", "c.pem", "--keyfile", "k.pem", "archive.wpr",
        ])
        .unwrap();
        assert_eq!(config.secure, SecureMode::Tls);
        assert!(config.profile.secure);
    }

    #[test]
    fn test_spdy_no_ssl() {
        let config = parse(&["--spdy=no-ssl", "archive.wpr"]).unwrap();
        assert_eq!(config.secure, SecureMode::NoSsl);
    }

    #[test]
    fn test_shaping_flags_parse() {
        let config = parse(&[
            "--up",
            "128KByte/s",
            "--down",
            "4Mbit/s",
            "--delay_ms",
            "100",
            "--packet_loss_rate",
            "0.01",
            "archive.wpr",
        ])
        .unwrap();
        assert_eq!(config.profile.delay_ms, 100);
        assert_eq!(config.profile.down.bits_per_sec(), 4_000_000);
        assert!(!config.profile.is_unshaped());
    }

    #[test]
    fn test_malformed_bandwidth() {
        let err = parse(&["--up", "fast", "archive.wpr"]).unwrap_err();
        assert!(matches!(err, ReplayError::Argument(_)));
    }

    #[test]
    fn test_negation_flags() {
        let config = parse(&[
            "--no-deterministic_script",
            "--no-dns_forwarding",
            "--no-dns_private_passthrough",
            "archive.wpr",
        ])
        .unwrap();
        assert!(!config.inject_script);
        assert!(!config.dns_forwarding);
        assert!(!config.dns_private_passthrough);
    }

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::Critical.as_filter(), "error");
        assert_eq!(LogLevel::Warning.as_filter(), "warn");
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }
}
