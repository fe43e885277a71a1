//! Error types for webreplay

use std::io;
use thiserror::Error;

/// Result type for webreplay operations
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Errors that can occur in webreplay
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Invalid CLI combination or malformed bandwidth/loss value
    #[error("{0}")]
    Argument(String),

    /// Platform setting or shaper install refused by the OS
    #[error("privilege required: {0}")]
    Privilege(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid archive file format
    #[error("invalid archive format: {0}")]
    InvalidFormat(String),

    /// Archive record corrupted (CRC mismatch)
    #[error("archive corrupted at offset {offset}: expected CRC {expected:#x}, got {actual:#x}")]
    CorruptedData {
        /// Offset of the corrupted record frame
        offset: u64,
        /// Expected CRC32 value
        expected: u32,
        /// Actual CRC32 value
        actual: u32,
    },

    /// Archive file not found
    #[error("archive file not found: {0}")]
    FileNotFound(String),

    /// Record-mode upstream failure
    #[error("origin error: {0}")]
    Origin(String),

    /// DNS query or upstream resolution failure
    #[error("DNS error: {0}")]
    Dns(String),

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Single query/connection failure; the server continues
    #[error("transient error: {0}")]
    Transient(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl ReplayError {
    /// Process exit code for this error kind
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Argument(_) => 1,
            Self::Privilege(_) => 2,
            Self::Io(_)
            | Self::InvalidFormat(_)
            | Self::CorruptedData { .. }
            | Self::FileNotFound(_) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ReplayError::Argument("bad flag".into()).exit_code(), 1);
        assert_eq!(ReplayError::Privilege("tc refused".into()).exit_code(), 2);
        assert_eq!(
            ReplayError::FileNotFound("archive.wpr".into()).exit_code(),
            3
        );
        assert_eq!(
            ReplayError::CorruptedData {
                offset: 9,
                expected: 1,
                actual: 2
            }
            .exit_code(),
            3
        );
        assert_eq!(ReplayError::Origin("refused".into()).exit_code(), 1);
    }
}
