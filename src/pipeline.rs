//! The command pipeline
//!
//! Every transport daemon funnels inbound text through one
//! [`CommandPipeline`]: authenticate, expand, parse, rewrite, sanitise,
//! dispatch, sanitise again, mirror. The pipeline is protocol-agnostic; the
//! transports only differ in how they frame the request and whether they
//! echo errors back (text transports do, DNS never does).
//!
//! # Flow
//!
//! ```text
//! raw body
//!   | PIN check + strip           (UnauthorizedPin)
//!   | shortcut expansion          (exact match only)
//!   | trigger/argument parse      (EmptyCommand, NoSuchFeature)
//!   | sequence rewrites
//!   | argument lint
//!   | feature execute w/ deadline (FeatureTimedOut, Feature)
//!   | response lint
//!   | async email mirror          (never blocks, never fails)
//!   v
//! response text
//! ```
//!
//! The PIN is stripped before the shortcut table is consulted; reordering
//! those two stages would let shortcut keys bypass authentication.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::filter::FilterChain;
use crate::mailer::MailClient;
use crate::toolbox::{FeatureError, FeatureSet};

/// Client-visible pipeline failures
///
/// These render as short stable strings. Text transports echo them to the
/// operator; the DNS transport never does.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The body did not begin with the configured PIN
    #[error("unauthorized PIN")]
    UnauthorizedPin,

    /// The first token matched no configured feature trigger
    #[error("no such feature")]
    NoSuchFeature,

    /// Nothing remained after authentication
    #[error("empty command")]
    EmptyCommand,

    /// The feature gave up at its wall-clock deadline
    #[error("feature timed out")]
    FeatureTimedOut,

    /// The feature failed, with detail
    #[error("feature error: {0}")]
    Feature(String),
}

/// One transport's view of the shared command machinery
pub struct CommandPipeline {
    chain: FilterChain,
    features: Arc<FeatureSet>,
    mailer: Arc<MailClient>,
}

impl CommandPipeline {
    /// Build a pipeline for one transport's filter chain
    #[must_use]
    pub fn new(chain: FilterChain, features: Arc<FeatureSet>, mailer: Arc<MailClient>) -> Self {
        Self {
            chain,
            features,
            mailer,
        }
    }

    /// The filter chain this pipeline runs
    #[must_use]
    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// Run one raw request body through the full pipeline.
    #[instrument(skip_all, fields(len = raw.len()))]
    pub async fn invoke(&self, raw: &str) -> Result<String, PipelineError> {
        // 1. Authentication. The PIN gate is the first stage by design.
        let body = match &self.chain.pin_and_shortcuts {
            Some(gate) => gate.strip_pin(raw).ok_or(PipelineError::UnauthorizedPin)?,
            None => raw.trim(),
        };
        if body.is_empty() {
            return Err(PipelineError::EmptyCommand);
        }

        // 2. Shortcut expansion, exact match only.
        let body = match &self.chain.pin_and_shortcuts {
            Some(gate) => gate.expand(body),
            None => body,
        };

        // 3. Trigger and verbatim argument.
        let (trigger, argument) = match body.split_once(char::is_whitespace) {
            Some((trigger, rest)) => (trigger, rest.trim_start()),
            None => (body, ""),
        };
        let feature = self
            .features
            .lookup_by_trigger(trigger)
            .ok_or(PipelineError::NoSuchFeature)?;

        // 4 + 5. Sequence rewrites, then pre-execution lint.
        let argument = match &self.chain.translate_sequences {
            Some(translate) => translate.translate(argument),
            None => argument.to_string(),
        };
        let argument = self.chain.lint(&argument);

        // 6. Dispatch under the chain's deadline.
        debug!(trigger, "dispatching feature");
        let response = feature
            .execute(&argument, self.chain.timeout_sec())
            .await
            .map_err(|err| match err {
                FeatureError::TimedOut => PipelineError::FeatureTimedOut,
                other => PipelineError::Feature(other.to_string()),
            })?;

        // 7. Post-execution lint.
        let response = self.chain.lint(&response);

        // 8. Fire-and-forget mirror.
        if let Some(notify) = &self.chain.notify_via_email {
            notify.send(&self.mailer, trigger, &argument, &response);
        }

        Ok(response)
    }
}
