//! PIN authentication and shortcut expansion
//!
//! The PIN is the first gate of the command pipeline: it must appear as a
//! bare prefix of the trimmed request body, and it is stripped before the
//! shortcut table is consulted. Looking shortcuts up first would let a
//! shortcut key bypass authentication entirely, so the order here is load
//! bearing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// PIN gate plus static shortcut table for one transport
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PinAndShortcuts {
    /// The password prefix every command must carry
    #[serde(rename = "PIN", default)]
    pub pin: String,

    /// Exact-match phrases substituted by their command form after the PIN
    /// has been stripped
    #[serde(rename = "Shortcuts", default)]
    pub shortcuts: HashMap<String, String>,
}

impl PinAndShortcuts {
    /// Reject configurations whose PIN would be trivially guessable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pin.len() < 7 {
            return Err(ConfigError::ValidationError(
                "PINAndShortcuts.PIN must be at least 7 characters".into(),
            ));
        }
        Ok(())
    }

    /// Authenticate `body` and strip the PIN prefix.
    ///
    /// Returns the remainder after the PIN and its single separator
    /// character, or `None` when the PIN is not a bare prefix of the trimmed
    /// body.
    #[must_use]
    pub fn strip_pin<'a>(&self, body: &'a str) -> Option<&'a str> {
        let body = body.trim();
        let rest = body.strip_prefix(self.pin.as_str())?;
        if rest.is_empty() {
            return Some(rest);
        }
        // The PIN must stand alone: "verysecretfoo" does not authenticate.
        let mut chars = rest.chars();
        if chars.next().is_some_and(char::is_whitespace) {
            Some(chars.as_str())
        } else {
            None
        }
    }

    /// Substitute the whole body if it exactly equals a shortcut key.
    #[must_use]
    pub fn expand<'a>(&'a self, body: &'a str) -> &'a str {
        // Exact equality only; substring matches do not expand.
        match self.shortcuts.get(body) {
            Some(command) => command.as_str(),
            None => body,
        }
    }
}
