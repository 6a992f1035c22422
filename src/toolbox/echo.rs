//! Echo feature
//!
//! Returns its argument verbatim. Exists mainly so transports can be
//! exercised end to end without side effects.

use async_trait::async_trait;

use super::{Feature, FeatureError};

/// Secure echo, trigger `.secho`
#[derive(Debug, Clone, Default)]
pub struct Echo;

impl Echo {
    /// Create the echo feature
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Feature for Echo {
    fn trigger(&self) -> &'static str {
        ".secho"
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn initialise(&mut self) -> Result<(), FeatureError> {
        Ok(())
    }

    async fn self_test(&self) -> Result<(), FeatureError> {
        Ok(())
    }

    async fn execute(&self, arg: &str, _timeout_sec: u64) -> Result<String, FeatureError> {
        Ok(arg.to_string())
    }
}
