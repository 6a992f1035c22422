//! Toolbox feature registry
//!
//! A *feature* is a named command handler selected by a short trigger prefix
//! (`.s` runs the shell, `.secho` echoes). Every transport funnels into the
//! same registry, so there is exactly one feature per trigger system-wide,
//! and a feature is dispatched only when it is both configured and
//! initialised.
//!
//! # Contract
//!
//! ```text
//! trigger()        stable prefix, e.g. ".s"
//! is_configured()  has enough configuration to be usable
//! initialise()     one-time setup, fatal at startup on failure
//! self_test()      cheap health probe, safe to run concurrently with execute
//! execute()        run one command argument under a deadline
//! ```

mod echo;
mod shell;

pub use echo::Echo;
pub use shell::Shell;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::error::ConfigError;

/// Errors produced by feature initialisation, self test and execution
#[derive(Debug, Error)]
pub enum FeatureError {
    /// The subprocess or remote call outlived its wall-clock deadline
    #[error("feature timed out")]
    TimedOut,

    /// The feature lacks configuration required to run
    #[error("feature is not configured")]
    NotConfigured,

    /// Any other execution failure, with detail
    #[error("{0}")]
    Failed(String),
}

/// A named, trigger-prefixed command handler
#[async_trait]
pub trait Feature: Send + Sync {
    /// The trigger prefix that selects this feature
    fn trigger(&self) -> &'static str;

    /// Whether the feature has enough configuration to be usable
    fn is_configured(&self) -> bool;

    /// One-time setup; failure refuses process startup
    fn initialise(&mut self) -> Result<(), FeatureError>;

    /// Health probe. Must be idempotent and safe to run concurrently with
    /// [`Feature::execute`].
    async fn self_test(&self) -> Result<(), FeatureError>;

    /// Run one command argument; `timeout_sec` is a hard wall-clock bound.
    async fn execute(&self, arg: &str, timeout_sec: u64) -> Result<String, FeatureError>;
}

/// All configured features, indexed by trigger
pub struct FeatureSet {
    lookup_by_trigger: HashMap<&'static str, Arc<dyn Feature>>,
}

impl FeatureSet {
    /// Build the registry from the `Features` configuration document.
    ///
    /// Keys are normalised (trimmed, lowercased) before matching feature
    /// names, so the casing used in the JSON does not matter. Unknown keys
    /// are logged and skipped so configurations can carry sections this
    /// build does not understand.
    pub fn from_config(config: &serde_json::Map<String, Value>) -> Result<Self, ConfigError> {
        let mut normalised: HashMap<String, &Value> = HashMap::new();
        for (key, value) in config {
            normalised.insert(key.trim().to_ascii_lowercase(), value);
        }

        let mut features: Vec<Box<dyn Feature>> = vec![Box::new(Echo::new())];
        if let Some(raw) = normalised.remove("shell") {
            let shell: Shell = serde_json::from_value(raw.clone()).map_err(|e| {
                ConfigError::ParseError(format!("Features.Shell is malformed: {e}"))
            })?;
            features.push(Box::new(shell));
        }
        for unknown in normalised.keys() {
            if unknown != "echo" {
                warn!(feature = %unknown, "ignoring unknown feature configuration");
            }
        }
        Self::initialise(features)
    }

    /// A registry with only the built-in echo feature, for transports under
    /// test.
    pub fn minimal() -> Result<Self, ConfigError> {
        Self::initialise(vec![Box::new(Echo::new())])
    }

    fn initialise(features: Vec<Box<dyn Feature>>) -> Result<Self, ConfigError> {
        let mut lookup_by_trigger: HashMap<&'static str, Arc<dyn Feature>> = HashMap::new();
        for mut feature in features {
            if !feature.is_configured() {
                continue;
            }
            feature.initialise().map_err(|e| {
                ConfigError::ValidationError(format!(
                    "feature {} failed to initialise: {e}",
                    feature.trigger()
                ))
            })?;
            let trigger = feature.trigger();
            if lookup_by_trigger.insert(trigger, Arc::from(feature)).is_some() {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate feature trigger {trigger}"
                )));
            }
        }
        Ok(Self { lookup_by_trigger })
    }

    /// Find the feature owning `trigger`
    #[must_use]
    pub fn lookup_by_trigger(&self, trigger: &str) -> Option<&Arc<dyn Feature>> {
        self.lookup_by_trigger.get(trigger)
    }

    /// Triggers of all dispatchable features
    #[must_use]
    pub fn triggers(&self) -> Vec<&'static str> {
        let mut triggers: Vec<&'static str> = self.lookup_by_trigger.keys().copied().collect();
        triggers.sort_unstable();
        triggers
    }

    /// Run every configured feature's self test concurrently.
    ///
    /// Returns a map of trigger to failure message; an empty map means all
    /// features are healthy.
    pub async fn self_test(&self) -> HashMap<&'static str, String> {
        let mut handles = Vec::with_capacity(self.lookup_by_trigger.len());
        for feature in self.lookup_by_trigger.values() {
            let feature = Arc::clone(feature);
            handles.push(tokio::spawn(async move {
                (feature.trigger(), feature.self_test().await)
            }));
        }
        let mut failures = HashMap::new();
        for handle in handles {
            match handle.await {
                Ok((trigger, Err(err))) => {
                    failures.insert(trigger, err.to_string());
                }
                Ok((_, Ok(()))) => {}
                Err(join_err) => {
                    failures.insert("(panicked)", join_err.to_string());
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features_json(body: &str) -> serde_json::Map<String, Value> {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_echo_always_registered() {
        let set = FeatureSet::minimal().unwrap();
        assert!(set.lookup_by_trigger(".secho").is_some());
        assert!(set.lookup_by_trigger(".s").is_none());
    }

    #[test]
    fn test_shell_registered_from_config() {
        let set =
            FeatureSet::from_config(&features_json(r#"{"Shell": {"InterpreterPath": "/bin/sh"}}"#))
                .unwrap();
        assert!(set.lookup_by_trigger(".s").is_some());
        assert_eq!(set.triggers(), vec![".s", ".secho"]);
    }

    #[test]
    fn test_feature_keys_normalised() {
        // Casing of the JSON key does not matter
        for key in ["Shell", "shell", "SHELL", " shell "] {
            let doc = features_json(&format!(r#"{{"{key}": {{"InterpreterPath": "/bin/sh"}}}}"#));
            let set = FeatureSet::from_config(&doc).unwrap();
            assert!(set.lookup_by_trigger(".s").is_some(), "key {key:?}");
        }
    }

    #[test]
    fn test_unknown_feature_key_skipped() {
        let set = FeatureSet::from_config(&features_json(
            r#"{"Frobnicator": {"Knob": 7}, "Shell": {"InterpreterPath": "/bin/sh"}}"#,
        ))
        .unwrap();
        assert_eq!(set.triggers().len(), 2);
    }

    #[test]
    fn test_bad_interpreter_fails_initialise() {
        let result = FeatureSet::from_config(&features_json(
            r#"{"Shell": {"InterpreterPath": "/no/such/interpreter"}}"#,
        ));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_self_test_all_healthy() {
        let set =
            FeatureSet::from_config(&features_json(r#"{"Shell": {"InterpreterPath": "/bin/sh"}}"#))
                .unwrap();
        let failures = set.self_test().await;
        assert!(failures.is_empty(), "{failures:?}");
    }
}
