//! Configuration types
//!
//! The whole server is configured by one JSON document. Every top-level key
//! is optional; the presence of a daemon section enables that daemon. Field
//! names in the document are PascalCase and map onto the per-daemon
//! configuration structs defined next to each daemon.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dns::DnsDaemonConfig;
use crate::error::ConfigError;
use crate::filter::FilterChain;
use crate::httpd::{HttpDaemonConfig, HttpHandlersConfig};
use crate::mailer::MailClient;
use crate::maintenance::MaintenanceConfig;
use crate::plainsock::PlainSocketConfig;
use crate::smtpd::MailDaemonConfig;
use crate::sockd::SockDaemonConfig;
use crate::telegram::TelegramBotConfig;

/// Execution deadline configuration for the mail command transport
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MailCommandRunnerConfig {
    /// Seconds a mail-delivered command may run
    #[serde(rename = "CommandTimeoutSec", default)]
    pub command_timeout_sec: Option<u64>,
}

/// Root configuration document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// DNS forwarder daemon
    #[serde(rename = "DNSDaemon", default, skip_serializing_if = "Option::is_none")]
    pub dns_daemon: Option<DnsDaemonConfig>,

    /// HTTP daemon
    #[serde(rename = "HTTPDaemon", default, skip_serializing_if = "Option::is_none")]
    pub http_daemon: Option<HttpDaemonConfig>,

    /// Plain-socket daemon
    #[serde(
        rename = "PlainSocketDaemon",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub plain_socket_daemon: Option<PlainSocketConfig>,

    /// Inbound mail daemon
    #[serde(rename = "MailDaemon", default, skip_serializing_if = "Option::is_none")]
    pub mail_daemon: Option<MailDaemonConfig>,

    /// Password-gated byte forwarder
    #[serde(rename = "SockDaemon", default, skip_serializing_if = "Option::is_none")]
    pub sock_daemon: Option<SockDaemonConfig>,

    /// Telegram bot poller
    #[serde(rename = "TelegramBot", default, skip_serializing_if = "Option::is_none")]
    pub telegram_bot: Option<TelegramBotConfig>,

    /// Toolbox feature configuration, keyed by feature name
    #[serde(rename = "Features", default)]
    pub features: Map<String, Value>,

    /// Filter chain of the HTTP transport
    #[serde(rename = "HTTPFilters", default)]
    pub http_filters: FilterChain,

    /// Filter chain of the mail transport
    #[serde(rename = "MailFilters", default)]
    pub mail_filters: FilterChain,

    /// Filter chain of the plain-socket transport
    #[serde(rename = "PlainSocketFilters", default)]
    pub plain_socket_filters: FilterChain,

    /// Filter chain of the Telegram transport
    #[serde(rename = "TelegramFilters", default)]
    pub telegram_filters: FilterChain,

    /// HTTP endpoint configuration
    #[serde(rename = "HTTPHandlers", default)]
    pub http_handlers: HttpHandlersConfig,

    /// Outbound mail client shared by every component
    #[serde(rename = "MailClient", default)]
    pub mail_client: MailClient,

    /// Mail command execution deadline
    #[serde(rename = "MailCommandRunner", default)]
    pub mail_command_runner: MailCommandRunnerConfig,

    /// Maintenance daemon
    #[serde(rename = "Maintenance", default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<MaintenanceConfig>,

    /// Recipients of daemon-failure notifications from the supervisor
    #[serde(rename = "SupervisorNotificationRecipients", default)]
    pub supervisor_notification_recipients: Vec<String>,

    /// Default tracing level; overridden by `RUST_LOG`
    #[serde(rename = "LogLevel", default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate every present section. The process refuses to start on any
    /// validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(section) = &self.dns_daemon {
            section.validate()?;
        }
        if let Some(section) = &self.http_daemon {
            section.validate()?;
        }
        if let Some(section) = &self.plain_socket_daemon {
            section.validate()?;
        }
        if let Some(section) = &self.mail_daemon {
            section.validate()?;
        }
        if let Some(section) = &self.sock_daemon {
            section.validate()?;
        }
        if let Some(section) = &self.telegram_bot {
            section.validate()?;
        }
        for (name, chain) in [
            ("HTTPFilters", &self.http_filters),
            ("MailFilters", &self.mail_filters),
            ("PlainSocketFilters", &self.plain_socket_filters),
            ("TelegramFilters", &self.telegram_filters),
        ] {
            chain
                .validate()
                .map_err(|e| ConfigError::ValidationError(format!("{name}: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_valid() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert!(config.dns_daemon.is_none());
        assert!(config.maintenance.is_none());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config: Config =
            serde_json::from_str(r#"{"FutureDaemon": {"Port": 1}, "LogLevel": "debug"}"#).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_invalid_section_fails_validation() {
        let config: Config = serde_json::from_str(
            r#"{"DNSDaemon": {"Address": "0.0.0.0", "UDPPort": 53, "PerIPLimit": 0,
                "AllowQueryIPPrefixes": ["192"]}}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_filter_chain_named_in_error() {
        let config: Config = serde_json::from_str(
            r#"{"MailFilters": {"PINAndShortcuts": {"PIN": "x"}}}"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("MailFilters"), "{err}");
    }
}
