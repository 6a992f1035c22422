//! Per-transport filter chain
//!
//! Every transport daemon owns one [`FilterChain`]: the ordered set of
//! transforms wrapped around feature execution. The semantic order is fixed
//! (PIN and shortcuts, then sequence rewrites, then lint, then email
//! mirroring); each stage is optional in configuration and absent stages are
//! the identity.

mod lint;
mod notify;
mod pin;
mod translate;

pub use lint::LintText;
pub use notify::NotifyViaEmail;
pub use pin::PinAndShortcuts;
pub use translate::TranslateSequences;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default feature execution deadline when a chain does not set one
pub const DEFAULT_COMMAND_TIMEOUT_SEC: u64 = 10;

/// One transport's filter configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterChain {
    /// Authentication gate and shortcut table
    #[serde(rename = "PINAndShortcuts", default)]
    pub pin_and_shortcuts: Option<PinAndShortcuts>,

    /// Ordered substring rewrites applied to the command argument
    #[serde(rename = "TranslateSequences", default)]
    pub translate_sequences: Option<TranslateSequences>,

    /// Sanitiser applied to the argument before and the response after
    /// execution
    #[serde(rename = "LintText", default)]
    pub lint_text: Option<LintText>,

    /// Fire-and-forget command mirroring
    #[serde(rename = "NotifyViaEmail", default)]
    pub notify_via_email: Option<NotifyViaEmail>,

    /// Feature execution deadline in seconds for this transport
    #[serde(rename = "CommandTimeoutSec", default)]
    pub command_timeout_sec: Option<u64>,
}

impl FilterChain {
    /// Validate stage configuration; a present PIN stage must carry a
    /// usable PIN.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(gate) = &self.pin_and_shortcuts {
            gate.validate()?;
        }
        if let Some(timeout) = self.command_timeout_sec {
            if timeout == 0 {
                return Err(ConfigError::ValidationError(
                    "CommandTimeoutSec must be positive when present".into(),
                ));
            }
        }
        Ok(())
    }

    /// The execution deadline for this chain
    #[must_use]
    pub fn timeout_sec(&self) -> u64 {
        self.command_timeout_sec
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SEC)
    }

    /// Lint with this chain's settings; identity when the stage is absent
    #[must_use]
    pub fn lint(&self, text: &str) -> String {
        match &self.lint_text {
            Some(lint) => lint.lint(text),
            None => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chain_is_identity() {
        let chain = FilterChain::default();
        assert_eq!(chain.lint(" raw \x01 text "), " raw \x01 text ");
        assert_eq!(chain.timeout_sec(), DEFAULT_COMMAND_TIMEOUT_SEC);
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let chain = FilterChain {
            command_timeout_sec: Some(0),
            ..FilterChain::default()
        };
        assert!(chain.validate().is_err());
    }

    #[test]
    fn test_deserialise_full_document() {
        let chain: FilterChain = serde_json::from_str(
            r#"{
                "LintText": {
                    "CompressSpaces": true,
                    "CompressToSingleLine": true,
                    "KeepVisible7BitCharOnly": true,
                    "MaxLength": 35,
                    "TrimSpaces": true
                },
                "PINAndShortcuts": {
                    "PIN": "verysecret",
                    "Shortcuts": {"httpshortcut": ".secho httpshortcut"}
                },
                "TranslateSequences": {"Sequences": [["alpha", "beta"]]},
                "NotifyViaEmail": {"Recipients": ["howard@localhost"]}
            }"#,
        )
        .unwrap();
        assert!(chain.validate().is_ok());
        assert_eq!(chain.pin_and_shortcuts.as_ref().unwrap().pin, "verysecret");
        assert_eq!(chain.lint_text.as_ref().unwrap().max_length, 35);
        assert!(chain.notify_via_email.as_ref().unwrap().is_configured());
    }
}
