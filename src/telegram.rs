//! Telegram bot transport
//!
//! A long-poll adapter: `getUpdates` delivers operator messages, each
//! message body runs through the command pipeline, and the result goes back
//! via `sendMessage`. Messages sent while the process was down are dropped
//! using the startup-time anchor, so a backlog of queued commands cannot
//! replay against a freshly restarted server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, DaemonError};
use crate::limiter::RateLimiter;
use crate::lockdown::{self, StartupTime};
use crate::pipeline::CommandPipeline;
use crate::stats::MetricsSink;

/// Long-poll hold time requested from the API
const POLL_TIMEOUT_SEC: u64 = 30;

/// Pause between polls after an API failure
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Configuration of the Telegram bot
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramBotConfig {
    /// Bot API token from BotFather
    #[serde(rename = "AuthorizationToken", default)]
    pub authorization_token: String,

    /// Commands admitted per user per second
    #[serde(rename = "PerUserLimit", default = "default_per_user_limit")]
    pub per_user_limit: u32,
}

fn default_per_user_limit() -> u32 {
    2
}

impl TelegramBotConfig {
    /// Validate the section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.authorization_token.is_empty() {
            return Err(ConfigError::ValidationError(
                "TelegramBot.AuthorizationToken must be present".into(),
            ));
        }
        if self.per_user_limit == 0 {
            return Err(ConfigError::ValidationError(
                "TelegramBot.PerUserLimit must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct UpdateBatch {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<InboundMessage>,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(default)]
    date: i64,
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// The Telegram bot daemon
pub struct TelegramBot {
    config: TelegramBotConfig,
    pipeline: Arc<CommandPipeline>,
    limiter: Arc<RateLimiter>,
    sink: Arc<MetricsSink>,
    startup: Arc<StartupTime>,
    client: reqwest::Client,
    api_base: String,
    running: AtomicBool,
    stop_notify: Notify,
}

impl TelegramBot {
    /// Build the bot; validates configuration.
    pub fn new(
        config: TelegramBotConfig,
        pipeline: Arc<CommandPipeline>,
        sink: Arc<MetricsSink>,
        startup: Arc<StartupTime>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(config.per_user_limit)),
            config,
            pipeline,
            sink,
            startup,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(POLL_TIMEOUT_SEC + 10))
                .build()
                .unwrap_or_default(),
            api_base: "https://api.telegram.org".to_string(),
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    /// Rate limiter handle, for the supervisor's sweeper wiring
    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base, self.config.authorization_token, method
        )
    }

    /// Long-poll until stopped or lockdown.
    pub async fn start_and_block(&self) -> Result<(), DaemonError> {
        self.running.store(true, Ordering::SeqCst);
        info!("telegram bot polling for messages");
        let mut offset: i64 = 0;
        // The lockdown latch is checked on a tick as well, because one long
        // poll holds the loop for over half a minute.
        let mut lockdown_tick = tokio::time::interval(crate::dns::LOCKDOWN_POLL_INTERVAL);
        loop {
            let poll = self.poll_updates(offset);
            tokio::pin!(poll);
            let batch = loop {
                tokio::select! {
                    _ = lockdown_tick.tick() => {
                        if lockdown::is_locked_down() {
                            self.running.store(false, Ordering::SeqCst);
                            return Err(DaemonError::Lockdown);
                        }
                    }
                    () = self.stop_notify.notified() => {
                        info!("telegram bot stopping");
                        return Ok(());
                    }
                    result = &mut poll => break result,
                }
            };
            match batch {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.handle_update(update).await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "getUpdates failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// Signal the poll loop to stop; idempotent.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stop_notify.notify_one();
        }
    }

    async fn poll_updates(&self, offset: i64) -> Result<Vec<Update>, reqwest::Error> {
        let batch: UpdateBatch = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&[
                ("timeout", POLL_TIMEOUT_SEC.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?
            .json()
            .await?;
        if !batch.ok {
            debug!("getUpdates replied ok=false");
        }
        Ok(batch.result)
    }

    async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let Some(text) = message.text.clone() else {
            return;
        };
        let started = std::time::Instant::now();
        let Some(reply) = self
            .decide_reply(message.chat.id, message.date, &text)
            .await
        else {
            return;
        };
        if let Err(err) = self.send_message(message.chat.id, &reply).await {
            warn!(chat = message.chat.id, error = %err, "sendMessage failed");
            return;
        }
        self.sink.record("telegram", started.elapsed());
    }

    /// Admission, staleness and pipeline in one testable step. `None` means
    /// the message is dropped without a reply.
    async fn decide_reply(&self, chat_id: i64, date: i64, text: &str) -> Option<String> {
        if !self.limiter.register(&chat_id.to_string()) {
            debug!(chat = chat_id, "user rate limited, message dropped");
            return None;
        }
        if self.is_stale(date) {
            debug!(chat = chat_id, "message predates startup, dropped");
            return None;
        }
        Some(match self.pipeline.invoke(text).await {
            Ok(response) => response,
            Err(err) => err.to_string(),
        })
    }

    /// A message older than process startup was queued while the server was
    /// down; executing it now would be a surprise.
    fn is_stale(&self, message_date: i64) -> bool {
        let startup_epoch = self
            .startup
            .wall()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        message_date < startup_epoch
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), reqwest::Error> {
        self.client
            .post(self.api_url("sendMessage"))
            .form(&[("chat_id", chat_id.to_string()), ("text", text.to_string())])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
