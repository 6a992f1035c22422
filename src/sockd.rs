//! Password-gated byte forwarder
//!
//! The sock daemon tunnels raw TCP for an operator who can reach nothing
//! else: the first line of a connection carries the shared password and the
//! destination (`password host:port`), everything after it is copied
//! byte-for-byte in both directions. A wrong password closes the connection
//! without a reply.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{ConfigError, DaemonError};
use crate::limiter::RateLimiter;
use crate::lockdown;
use crate::stats::MetricsSink;

/// Dial deadline towards the requested destination
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest accepted handshake line
const MAX_HANDSHAKE_LINE: usize = 1024;

/// Configuration of the sock daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SockDaemonConfig {
    /// Listen address
    #[serde(rename = "Address", default = "default_address")]
    pub address: String,

    /// TCP listener port
    #[serde(rename = "TCPPort", default)]
    pub tcp_port: u16,

    /// Accepted for configuration compatibility; the forwarder serves TCP
    #[serde(rename = "UDPPort", default)]
    pub udp_port: u16,

    /// Connections admitted per source IP per second
    #[serde(rename = "PerIPLimit", default = "default_per_ip_limit")]
    pub per_ip_limit: u32,

    /// Shared tunnel password
    #[serde(rename = "Password", default)]
    pub password: String,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_per_ip_limit() -> u32 {
    10
}

impl SockDaemonConfig {
    /// Validate the section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_port == 0 {
            return Err(ConfigError::ValidationError(
                "SockDaemon.TCPPort must be positive".into(),
            ));
        }
        if self.password.len() < 7 {
            return Err(ConfigError::ValidationError(
                "SockDaemon.Password must be at least 7 characters".into(),
            ));
        }
        if self.per_ip_limit == 0 {
            return Err(ConfigError::ValidationError(
                "SockDaemon.PerIPLimit must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// The sock daemon
pub struct SockDaemon {
    config: SockDaemonConfig,
    limiter: Arc<RateLimiter>,
    sink: Arc<MetricsSink>,
    running: AtomicBool,
    stop_notify: Notify,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl SockDaemon {
    /// Build the daemon; validates configuration.
    pub fn new(config: SockDaemonConfig, sink: Arc<MetricsSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(config.per_ip_limit)),
            config,
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

        let addr = format!("{}:{}", self.config.address, self.config.tcp_port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| DaemonError::Bind {
            listener: format!("sockd {addr}"),
            source: e,
        })?;
        *self.local_addr.write() = listener.local_addr().ok();
        info!(addr = ?listener.local_addr().ok(), "sock daemon listening");

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
                    info!("sock daemon stopping");
                    return Ok(());
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if self.limiter.register(&peer.ip().to_string()) {
                                let password = self.config.password.clone();
                                let sink = Arc::clone(&self.sink);
                                tokio::spawn(async move {
                                    if let Err(err) = tunnel(stream, peer, &password, &sink).await {
                                        debug!(client = %peer, error = %err, "tunnel closed");
                                    }
                                });
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
}

async fn tunnel(
    stream: TcpStream,
    peer: SocketAddr,
    password: &str,
    sink: &MetricsSink,
) -> std::io::Result<()> {
    let started = Instant::now();
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    let read = tokio::io::AsyncReadExt::take(&mut reader, (MAX_HANDSHAKE_LINE + 1) as u64)
        .read_line(&mut line)
        .await?;
    if read == 0 || read > MAX_HANDSHAKE_LINE {
        return Ok(());
    }
    let Some(destination) = parse_handshake(&line, password) else {
        // Wrong password or malformed handshake: close without a reply
        debug!(client = %peer, "sock handshake rejected");
        return Ok(());
    };

    let mut upstream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&destination))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "destination dial timed out"))??;
    debug!(client = %peer, destination = %destination, "tunnel established");

    // Bytes the client sent right behind the handshake may already sit in
    // the read buffer; flush them before handing over to the raw copy.
    let buffered = reader.buffer().to_vec();
    if !buffered.is_empty() {
        tokio::io::AsyncWriteExt::write_all(&mut upstream, &buffered).await?;
    }
    let mut client = reader.into_inner();
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    sink.record("sockd.tcp", started.elapsed());
    Ok(())
}

/// Handshake is `password host:port`; anything else is rejected.
fn parse_handshake(line: &str, password: &str) -> Option<String> {
    let line = line.trim();
    let (supplied, destination) = line.split_once(char::is_whitespace)?;
    if supplied != password || destination.is_empty() {
        return None;
    }
    let destination = destination.trim();
    destination.parse::<SocketAddr>().ok()?;
    Some(destination.to_string())
}
