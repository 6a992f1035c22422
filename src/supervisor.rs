//! Daemon supervision
//!
//! The supervisor turns one configuration document into a running process:
//! it builds the shared components (metrics sink, mail client, feature set,
//! per-transport pipelines), instantiates every daemon whose configuration
//! section is present, and keeps them running. A daemon that fails is
//! restarted after a backoff; a daemon that returns the lockdown sentinel
//! takes the whole process down. On shutdown, daemons stop in reverse start
//! order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dns::DnsDaemon;
use crate::error::{ConfigError, DaemonError};
use crate::filter::FilterChain;
use crate::httpd::{HandlerCollection, HttpDaemon};
use crate::limiter::RateLimiter;
use crate::lockdown::StartupTime;
use crate::logbuf::LogRing;
use crate::mailer::MailClient;
use crate::maintenance::{MaintenanceDaemon, MaintenanceDeps};
use crate::pipeline::CommandPipeline;
use crate::plainsock::PlainSocketDaemon;
use crate::smtpd::MailDaemon;
use crate::sockd::SockDaemon;
use crate::stats::MetricsSink;
use crate::telegram::TelegramBot;
use crate::toolbox::FeatureSet;

/// Pause before restarting a daemon that errored out
const RESTART_BACKOFF: Duration = Duration::from_secs(10);

/// The long-running daemon contract
#[async_trait]
pub trait Daemon: Send + Sync {
    /// Short stable name, used in logs and notifications
    fn name(&self) -> &'static str;

    /// Run until stopped; per-request errors never escape this method
    async fn start_and_block(&self) -> Result<(), DaemonError>;

    /// Ask the loop to wind down; idempotent
    fn stop(&self);
}

macro_rules! impl_daemon {
    ($type:ty, $name:literal) => {
        #[async_trait]
        impl Daemon for $type {
            fn name(&self) -> &'static str {
                $name
            }
            async fn start_and_block(&self) -> Result<(), DaemonError> {
                <$type>::start_and_block(self).await
            }
            fn stop(&self) {
                <$type>::stop(self);
            }
        }
    };
}

impl_daemon!(DnsDaemon, "dnsd");
impl_daemon!(HttpDaemon, "httpd");
impl_daemon!(MailDaemon, "smtpd");
impl_daemon!(PlainSocketDaemon, "plainsock");
impl_daemon!(SockDaemon, "sockd");
impl_daemon!(TelegramBot, "telegram");
impl_daemon!(MaintenanceDaemon, "maintenance");

/// Builds and supervises every enabled daemon
pub struct Supervisor {
    daemons: Vec<Arc<dyn Daemon>>,
    limiters: Vec<Arc<RateLimiter>>,
    mailer: Arc<MailClient>,
    notification_recipients: Vec<String>,
}

impl Supervisor {
    /// Wire the whole process up from one configuration document.
    pub fn from_config(config: &Config, log_ring: Arc<LogRing>) -> Result<Self, ConfigError> {
        config.validate()?;

        let sink = Arc::new(MetricsSink::new());
        let startup = Arc::new(StartupTime::now());
        let mailer = Arc::new(config.mail_client.clone());
        let features = Arc::new(FeatureSet::from_config(&config.features)?);

        let pipeline_for = |chain: &FilterChain| {
            Arc::new(CommandPipeline::new(
                chain.clone(),
                Arc::clone(&features),
                Arc::clone(&mailer),
            ))
        };

        let mut daemons: Vec<Arc<dyn Daemon>> = Vec::new();
        let mut limiters: Vec<Arc<RateLimiter>> = Vec::new();
        let mut blacklist = None;
        let mut http_handlers = None;

        if let Some(dns_config) = &config.dns_daemon {
            let daemon = Arc::new(DnsDaemon::new(dns_config.clone(), Arc::clone(&sink))?);
            blacklist = Some(daemon.blacklist_store());
            limiters.push(daemon.limiter());
            daemons.push(daemon);
        }
        if let Some(http_config) = &config.http_daemon {
            let handlers = Arc::new(HandlerCollection::new(
                config.http_handlers.clone(),
                http_config.serve_directories.clone(),
            ));
            http_handlers = Some(Arc::clone(&handlers));
            let daemon = Arc::new(HttpDaemon::new(
                http_config.clone(),
                handlers,
                pipeline_for(&config.http_filters),
                Arc::clone(&sink),
                Arc::clone(&startup),
            )?);
            limiters.push(daemon.limiter());
            daemons.push(daemon);
        }
        if let Some(mail_config) = &config.mail_daemon {
            // The mail transport takes its execution deadline from the
            // dedicated MailCommandRunner section
            let mut chain = config.mail_filters.clone();
            if chain.command_timeout_sec.is_none() {
                chain.command_timeout_sec = config.mail_command_runner.command_timeout_sec;
            }
            let daemon = Arc::new(MailDaemon::new(
                mail_config.clone(),
                pipeline_for(&chain),
                Arc::clone(&mailer),
                Arc::clone(&sink),
            )?);
            limiters.push(daemon.limiter());
            daemons.push(daemon);
        }
        if let Some(plain_config) = &config.plain_socket_daemon {
            let daemon = Arc::new(PlainSocketDaemon::new(
                plain_config.clone(),
                pipeline_for(&config.plain_socket_filters),
                Arc::clone(&sink),
            )?);
            limiters.push(daemon.limiter());
            daemons.push(daemon);
        }
        if let Some(sock_config) = &config.sock_daemon {
            let daemon = Arc::new(SockDaemon::new(sock_config.clone(), Arc::clone(&sink))?);
            limiters.push(daemon.limiter());
            daemons.push(daemon);
        }
        if let Some(telegram_config) = &config.telegram_bot {
            let daemon = Arc::new(TelegramBot::new(
                telegram_config.clone(),
                pipeline_for(&config.telegram_filters),
                Arc::clone(&sink),
                Arc::clone(&startup),
            )?);
            limiters.push(daemon.limiter());
            daemons.push(daemon);
        }
        if let Some(maintenance_config) = &config.maintenance {
            let deps = MaintenanceDeps {
                mailer: Arc::clone(&mailer),
                features: Arc::clone(&features),
                http_handlers,
                blacklist,
                sink: Arc::clone(&sink),
                log_ring,
                startup: Arc::clone(&startup),
            };
            daemons.push(Arc::new(MaintenanceDaemon::new(
                maintenance_config.clone(),
                deps,
            )?));
        }

        if daemons.is_empty() {
            return Err(ConfigError::ValidationError(
                "no daemon sections are present in the configuration".into(),
            ));
        }

        Ok(Self {
            daemons,
            limiters,
            mailer,
            notification_recipients: config.supervisor_notification_recipients.clone(),
        })
    }

    /// Names of the daemons that will run, in start order
    #[must_use]
    pub fn daemon_names(&self) -> Vec<&'static str> {
        self.daemons.iter().map(|d| d.name()).collect()
    }

    /// Run every daemon until `shutdown` resolves or lockdown latches.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        for limiter in &self.limiters {
            limiter.start_sweeper();
        }

        let (err_tx, mut err_rx) = mpsc::channel::<DaemonError>(self.daemons.len().max(1));
        for daemon in &self.daemons {
            let daemon = Arc::clone(daemon);
            let err_tx = err_tx.clone();
            let mailer = Arc::clone(&self.mailer);
            let recipients = self.notification_recipients.clone();
            tokio::spawn(async move {
                loop {
                    info!(daemon = daemon.name(), "starting daemon");
                    match daemon.start_and_block().await {
                        Ok(()) => {
                            info!(daemon = daemon.name(), "daemon stopped");
                            return;
                        }
                        Err(err) if err.is_lockdown() => {
                            error!(daemon = daemon.name(), "daemon hit emergency lockdown");
                            let _ = err_tx.send(DaemonError::Lockdown).await;
                            return;
                        }
                        Err(err) => {
                            warn!(daemon = daemon.name(), error = %err, "daemon failed, restarting after backoff");
                            let body = format!("daemon {} failed: {err}", daemon.name());
                            if let Err(mail_err) =
                                mailer.send("supervisor", &body, &recipients).await
                            {
                                warn!(error = %mail_err, "failed to mail supervisor notification");
                            }
                            tokio::time::sleep(RESTART_BACKOFF).await;
                        }
                    }
                }
            });
        }

        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            () = &mut shutdown => {
                info!("shutdown requested");
                Ok(())
            }
            received = err_rx.recv() => {
                match received {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        };
        self.stop_all();
        outcome
    }

    /// Stop every daemon in reverse start order.
    pub fn stop_all(&self) {
        for daemon in self.daemons.iter().rev() {
            daemon.stop();
        }
    }
}
