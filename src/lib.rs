//! toolhost: multi-protocol toolbox command server
//!
//! One process hosts several network-facing daemons sharing a common
//! command-execution pipeline: remote operators submit short text commands
//! over whichever channel still works, the server authenticates, sanitises,
//! dispatches and answers. A periodic maintenance loop self-checks the
//! running system and mails a consolidated report.
//!
//! # Architecture
//!
//! ```text
//! DNS | HTTP | SMTP | plain socket | Telegram | sock tunnel
//!       \      |       |      |        /
//!        per-IP admission (token buckets)
//!              |
//!        command pipeline (PIN -> shortcuts -> lint -> feature -> lint)
//!              |
//!        toolbox features (.s shell, .secho echo)
//!
//! maintenance loop: port knocks + self tests + report mail (orthogonal)
//! ```
//!
//! # Modules
//!
//! - [`config`]: the single JSON configuration document
//! - [`supervisor`]: daemon construction, restart and shutdown ordering
//! - [`pipeline`] / [`filter`] / [`toolbox`]: the command machinery
//! - [`dns`]: recursive forwarder with ACL, per-IP quota and blacklist
//! - [`httpd`], [`smtpd`], [`plainsock`], [`telegram`], [`sockd`]: transports
//! - [`maintenance`]: the periodic self-test and housekeeping loop
//! - [`limiter`], [`stats`], [`logbuf`], [`lockdown`]: shared infrastructure

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod httpd;
pub mod limiter;
pub mod lockdown;
pub mod logbuf;
pub mod mailer;
pub mod maintenance;
pub mod pipeline;
pub mod plainsock;
pub mod smtpd;
pub mod sockd;
pub mod stats;
pub mod supervisor;
pub mod telegram;
pub mod toolbox;

pub use config::{load_config, Config};
pub use error::{ConfigError, DaemonError};
pub use pipeline::{CommandPipeline, PipelineError};
pub use supervisor::{Daemon, Supervisor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
