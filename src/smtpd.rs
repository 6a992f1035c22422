//! Mail command transport
//!
//! A deliberately small ESMTP acceptor: enough protocol to take one `DATA`
//! body per transaction, nothing more. Inbound mail is a command transport,
//! not a mail store. A message whose body authenticates against the command
//! pipeline runs as a toolbox command and the output is mailed back to the
//! sender; everything else is forwarded verbatim to the configured
//! forwarding addresses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, DaemonError};
use crate::limiter::RateLimiter;
use crate::lockdown;
use crate::mailer::MailClient;
use crate::pipeline::{CommandPipeline, PipelineError};
use crate::stats::MetricsSink;

/// Upper bound on one message body
const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Whole-conversation deadline
const CONVERSATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration of the mail daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailDaemonConfig {
    /// Listen address
    #[serde(rename = "Address", default = "default_address")]
    pub address: String,

    /// Listener port; conventionally 25
    #[serde(rename = "Port", default)]
    pub port: u16,

    /// Connections admitted per source IP per second
    #[serde(rename = "PerIPLimit", default = "default_per_ip_limit")]
    pub per_ip_limit: u32,

    /// Domains this server accepts recipients for
    #[serde(rename = "MyDomains", default)]
    pub my_domains: Vec<String>,

    /// Addresses non-command mail is forwarded to
    #[serde(rename = "ForwardTo", default)]
    pub forward_to: Vec<String>,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_per_ip_limit() -> u32 {
    4
}

impl MailDaemonConfig {
    /// Validate the section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "MailDaemon.Port must be positive".into(),
            ));
        }
        if self.my_domains.is_empty() {
            return Err(ConfigError::ValidationError(
                "MailDaemon.MyDomains must name at least one domain".into(),
            ));
        }
        if self.forward_to.is_empty() {
            return Err(ConfigError::ValidationError(
                "MailDaemon.ForwardTo must name at least one address".into(),
            ));
        }
        if self.per_ip_limit == 0 {
            return Err(ConfigError::ValidationError(
                "MailDaemon.PerIPLimit must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// What became of one accepted message
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The body authenticated and ran as a command
    CommandResponse(String),

    /// The body did not authenticate; the message went to `ForwardTo`
    Forwarded,
}

/// The inbound mail daemon
pub struct MailDaemon {
    config: MailDaemonConfig,
    pipeline: Arc<CommandPipeline>,
    mailer: Arc<MailClient>,
    limiter: Arc<RateLimiter>,
    sink: Arc<MetricsSink>,
    running: AtomicBool,
    stop_notify: Notify,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl MailDaemon {
    /// Build the daemon; validates configuration.
    pub fn new(
        config: MailDaemonConfig,
        pipeline: Arc<CommandPipeline>,
        mailer: Arc<MailClient>,
        sink: Arc<MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(config.per_ip_limit)),
            config,
            pipeline,
            mailer,
            sink,
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            local_addr: RwLock::new(None),
        })
    }

    /// Rate limiter handle, for the supervisor's sweeper wiring
    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Bound address once running
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Run the listener until stopped or lockdown.
    pub async fn start_and_block(&self) -> Result<(), DaemonError> {
        if lockdown::is_locked_down() {
            return Err(DaemonError::Lockdown);
        }
        self.running.store(true, Ordering::SeqCst);

        let addr = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| DaemonError::Bind {
            listener: format!("smtpd {addr}"),
            source: e,
        })?;
        *self.local_addr.write() = listener.local_addr().ok();
        info!(addr = ?listener.local_addr().ok(), "mail daemon listening");

        let mut lockdown_tick = tokio::time::interval(crate::dns::LOCKDOWN_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = lockdown_tick.tick() => {
                    if lockdown::is_locked_down() {
                        self.running.store(false, Ordering::SeqCst);
                        return Err(DaemonError::Lockdown);
                    }
                }
                () = self.stop_notify.notified() => {
                    info!("mail daemon stopping");
                    return Ok(());
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if self.limiter.register(&peer.ip().to_string()) {
                                self.spawn_conversation(stream, peer);
                            }
                        }
                        Err(err) => debug!(error = %err, "accept error"),
                    }
                }
            }
        }
    }

    /// Signal the daemon loop to stop; idempotent.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stop_notify.notify_one();
        }
    }

    fn spawn_conversation(&self, stream: TcpStream, peer: SocketAddr) {
        let context = ConversationContext {
            pipeline: Arc::clone(&self.pipeline),
            mailer: Arc::clone(&self.mailer),
            forward_to: self.config.forward_to.clone(),
            my_domains: self.config.my_domains.clone(),
            sink: Arc::clone(&self.sink),
        };
        tokio::spawn(async move {
            let result =
                tokio::time::timeout(CONVERSATION_TIMEOUT, context.serve(stream)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(client = %peer, error = %err, "SMTP conversation failed"),
                Err(_) => debug!(client = %peer, "SMTP conversation timed out"),
            }
        });
    }

    /// Route one accepted message without speaking SMTP: the command path
    /// runs the pipeline and mails the output back, everything else goes to
    /// the forwarding addresses.
    pub async fn route_message(&self, from: &str, raw_message: &str) -> Disposition {
        ConversationContext {
            pipeline: Arc::clone(&self.pipeline),
            mailer: Arc::clone(&self.mailer),
            forward_to: self.config.forward_to.clone(),
            my_domains: self.config.my_domains.clone(),
            sink: Arc::clone(&self.sink),
        }
        .route(from, raw_message)
        .await
    }
}

/// Everything one SMTP conversation task needs
struct ConversationContext {
    pipeline: Arc<CommandPipeline>,
    mailer: Arc<MailClient>,
    forward_to: Vec<String>,
    my_domains: Vec<String>,
    sink: Arc<MetricsSink>,
}

impl ConversationContext {
    async fn serve(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        writer.write_all(b"220 toolhost ESMTP\r\n").await?;

        let mut from = String::new();
        let mut rcpt_accepted = false;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end().to_string();
            let upper = line.to_ascii_uppercase();

            if upper.starts_with("EHLO") || upper.starts_with("HELO") {
                writer.write_all(b"250 toolhost\r\n").await?;
            } else if upper.starts_with("MAIL FROM:") {
                from = line[10..].trim().trim_matches(['<', '>']).to_string();
                writer.write_all(b"250 OK\r\n").await?;
            } else if upper.starts_with("RCPT TO:") {
                let rcpt = line[8..].trim().trim_start_matches('<');
                if recipient_domain_matches(&self.my_domains, rcpt) {
                    rcpt_accepted = true;
                    writer.write_all(b"250 OK\r\n").await?;
                } else {
                    writer.write_all(b"550 not a local domain\r\n").await?;
                }
            } else if upper == "DATA" {
                if !rcpt_accepted {
                    writer.write_all(b"503 RCPT first\r\n").await?;
                    continue;
                }
                writer.write_all(b"354 end with <CRLF>.<CRLF>\r\n").await?;
                let message = read_data(&mut reader).await?;
                writer.write_all(b"250 queued\r\n").await?;
                self.dispatch(from.clone(), message);
            } else if upper == "QUIT" {
                writer.write_all(b"221 bye\r\n").await?;
                return Ok(());
            } else if upper == "RSET" || upper == "NOOP" {
                writer.write_all(b"250 OK\r\n").await?;
            } else {
                writer.write_all(b"502 command not implemented\r\n").await?;
            }
        }
    }

    /// Routing happens off the SMTP socket so a slow feature cannot stall
    /// the conversation.
    fn dispatch(&self, from: String, message: String) {
        let context = ConversationContext {
            pipeline: Arc::clone(&self.pipeline),
            mailer: Arc::clone(&self.mailer),
            forward_to: self.forward_to.clone(),
            my_domains: self.my_domains.clone(),
            sink: Arc::clone(&self.sink),
        };
        tokio::spawn(async move {
            let started = Instant::now();
            let channel = match context.route(&from, &message).await {
                Disposition::CommandResponse(_) => "mailcmd",
                Disposition::Forwarded => "smtpd",
            };
            context.sink.record(channel, started.elapsed());
        });
    }

    async fn route(&self, from: &str, raw_message: &str) -> Disposition {
        let body = message_body(raw_message);
        match self.pipeline.invoke(body).await {
            Ok(response) => {
                self.reply_to_sender(from, &response).await;
                Disposition::CommandResponse(response)
            }
            Err(PipelineError::UnauthorizedPin) => {
                // Ordinary mail: pass it along untouched
                if let Err(err) = self
                    .mailer
                    .send("forwarded mail", raw_message, &self.forward_to)
                    .await
                {
                    warn!(error = %err, "failed to forward mail");
                }
                Disposition::Forwarded
            }
            Err(other) => {
                let rendered = other.to_string();
                self.reply_to_sender(from, &rendered).await;
                Disposition::CommandResponse(rendered)
            }
        }
    }

    async fn reply_to_sender(&self, from: &str, response: &str) {
        if from.is_empty() {
            return;
        }
        if let Err(err) = self
            .mailer
            .send("mail command", response, &[from.to_string()])
            .await
        {
            warn!(error = %err, "failed to mail command response");
        }
    }
}

/// True when the recipient's domain is one of ours.
fn recipient_domain_matches(my_domains: &[String], recipient: &str) -> bool {
    let cleaned = recipient.trim_end_matches('>');
    let domain = cleaned.rsplit_once('@').map_or(cleaned, |(_, d)| d);
    my_domains.iter().any(|d| domain.eq_ignore_ascii_case(d))
}

/// Header/body split: the command text is everything after the first blank
/// line; a message without headers is all body.
fn message_body(raw: &str) -> &str {
    match raw.split_once("\r\n\r\n").or_else(|| raw.split_once("\n\n")) {
        Some((_headers, body)) => body,
        None => raw,
    }
}

async fn read_data(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<String> {
    let mut message = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed mid-DATA",
            ));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "." {
            return Ok(message);
        }
        // Reverse dot stuffing
        let content = trimmed.strip_prefix('.').unwrap_or(trimmed);
        message.push_str(content);
        message.push('\n');
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "message too large",
            ));
        }
    }
}
