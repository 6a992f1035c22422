//! Error types for toolhost
//!
//! Each subsystem reports through one of the enums defined here. The split
//! follows the propagation rule of the server: per-request errors are caught
//! and logged inside each daemon's accept loop, while only configuration
//! errors and the emergency-lockdown sentinel are allowed to bubble up to the
//! supervisor.

use std::io;

use thiserror::Error;

/// Configuration-related errors
///
/// These are fatal at startup; the process refuses to run with a
/// configuration it cannot fully understand.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Errors returned by a daemon's long-running loop
///
/// A daemon's `start_and_block` only ever returns one of these. The
/// supervisor restarts the daemon on anything except [`DaemonError::Lockdown`],
/// which terminates the whole process.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The process-wide emergency lockdown latch was observed.
    ///
    /// This is a sentinel: every daemon loop polls the latch at its top and
    /// unwinds with this value. Only a process restart clears the condition.
    #[error("emergency lockdown is in effect")]
    Lockdown,

    /// Listener could not be established or died fatally
    #[error("failed to bind {listener}: {source}")]
    Bind {
        listener: String,
        #[source]
        source: io::Error,
    },

    /// Fatal socket error in the accept loop
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// Daemon-specific initialisation failure
    #[error("daemon initialisation failed: {0}")]
    Init(String),
}

impl DaemonError {
    /// True when the error is the emergency-lockdown sentinel
    #[must_use]
    pub fn is_lockdown(&self) -> bool {
        matches!(self, Self::Lockdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockdown_sentinel_detection() {
        assert!(DaemonError::Lockdown.is_lockdown());
        assert!(!DaemonError::Init("x".into()).is_lockdown());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::ValidationError("PerIPLimit must be positive".into());
        assert!(err.to_string().contains("PerIPLimit"));
    }

    #[test]
    fn test_bind_error_names_listener() {
        let err = DaemonError::Bind {
            listener: "dns-udp 127.0.0.1:53".into(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("dns-udp"));
    }
}
