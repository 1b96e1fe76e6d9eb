// src/error.rs

//! Error types shared by the download stack and the swap server
//!
//! Every failure carries a short machine-readable [`ErrorKind`] so callers can
//! decide between mirror failover, giving up, or reporting a configuration
//! problem without inspecting message strings.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure classification surfaced to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Resource absent on this source; try another mirror
    NotFound,
    /// Network, TLS, timeout or protocol failure; eligible for failover
    ConnectionFailed,
    /// Cancelled by the user or the system; terminal
    Interrupted,
    /// Downloaded bytes did not match the expected digest
    VerificationFailed,
    /// Unsupported algorithm, unreadable keystore and similar setup problems
    Configuration,
    /// Local filesystem failure
    Io,
}

impl ErrorKind {
    /// Short identifier used in lifecycle events
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ConnectionFailed => "connection_failed",
            Self::Interrupted => "interrupted",
            Self::VerificationFailed => "verification_failed",
            Self::Configuration => "configuration",
            Self::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Download interrupted")]
    Interrupted,

    /// Server ignored a byte-range request for a partial file
    #[error("Resume not supported: {0}")]
    NoResume(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{algorithm} mismatch: expected {expected}, got {actual}")]
    VerificationFailed {
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Keystore error: {0}")]
    KeyStore(String),

    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Initialization error: {0}")]
    InitError(String),
}

impl Error {
    /// Map this error onto the failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ConnectionFailed(_) | Self::Protocol(_) => ErrorKind::ConnectionFailed,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            Self::UnsupportedAlgorithm(_)
            | Self::Configuration(_)
            | Self::KeyStore(_)
            | Self::Crypto(_)
            | Self::InitError(_) => ErrorKind::Configuration,
            Self::NoResume(_) | Self::IoError(_) | Self::ParseError(_) => ErrorKind::Io,
        }
    }

    /// True for failures that should trigger mirror failover
    pub fn is_failover_candidate(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::ConnectionFailed)
    }

    /// Classify an I/O error raised while talking to `context`
    ///
    /// Socket level failures become `ConnectionFailed`, a missing file becomes
    /// `NotFound`, everything else stays a local I/O error.
    pub fn from_io(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(format!("{context}: {err}")),
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::ConnectionFailed(format!("{context}: {err}")),
            _ => Self::IoError(format!("{context}: {err}")),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_io("I/O failure", err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::NOT_FOUND {
                return Self::NotFound(err.to_string());
            }
            return Self::Protocol(format!("HTTP {status}: {err}"));
        }

        if err.is_builder() {
            return Self::Configuration(err.to_string());
        }

        // connect, timeout, TLS handshake, redirect loops and body decode
        // failures all land here
        Self::ConnectionFailed(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(Error::from(refused).kind(), ErrorKind::ConnectionFailed);

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(Error::from_io("peer", timeout).kind(), ErrorKind::ConnectionFailed);

        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(missing).kind(), ErrorKind::NotFound);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(Error::from(denied).kind(), ErrorKind::Io);
    }

    #[test]
    fn test_failover_candidates() {
        assert!(Error::NotFound("x".into()).is_failover_candidate());
        assert!(Error::ConnectionFailed("x".into()).is_failover_candidate());
        assert!(Error::Protocol("x".into()).is_failover_candidate());
        assert!(!Error::Interrupted.is_failover_candidate());
        assert!(
            !Error::VerificationFailed {
                algorithm: "sha256".into(),
                expected: "a".into(),
                actual: "b".into(),
            }
            .is_failover_candidate()
        );
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(ErrorKind::ConnectionFailed.as_str(), "connection_failed");
        assert_eq!(Error::KeyStore("bad".into()).kind().to_string(), "configuration");
    }
}
