//! Plain-socket command transport
//!
//! The simplest transport: a UDP datagram or one newline-delimited TCP line
//! is the request body, the pipeline's output (or its client-visible error
//! string) is written straight back. Useful over netcat when everything else
//! is down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{ConfigError, DaemonError};
use crate::limiter::RateLimiter;
use crate::lockdown;
use crate::pipeline::CommandPipeline;
use crate::stats::MetricsSink;

/// Longest accepted request line or datagram
const MAX_REQUEST_SIZE: usize = 32 * 1024;

/// Idle deadline for a TCP conversation
const CONVERSATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration of the plain-socket daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlainSocketConfig {
    /// Listen address for both transports
    #[serde(rename = "Address", default = "default_address")]
    pub address: String,

    /// TCP listener port; 0 disables
    #[serde(rename = "TCPPort", default)]
    pub tcp_port: u16,

    /// UDP listener port; 0 disables
    #[serde(rename = "UDPPort", default)]
    pub udp_port: u16,

    /// Requests admitted per source IP per second
    #[serde(rename = "PerIPLimit", default = "default_per_ip_limit")]
    pub per_ip_limit: u32,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_per_ip_limit() -> u32 {
    5
}

impl PlainSocketConfig {
    /// Validate the section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_port == 0 && self.udp_port == 0 {
            return Err(ConfigError::ValidationError(
                "PlainSocketDaemon needs TCPPort or UDPPort".into(),
            ));
        }
        if self.per_ip_limit == 0 {
            return Err(ConfigError::ValidationError(
                "PlainSocketDaemon.PerIPLimit must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Plain text command daemon over TCP lines and UDP datagrams
pub struct PlainSocketDaemon {
    config: PlainSocketConfig,
    pipeline: Arc<CommandPipeline>,
    limiter: Arc<RateLimiter>,
    sink: Arc<MetricsSink>,
    running: AtomicBool,
    stop_notify: Notify,
    tcp_addr: RwLock<Option<SocketAddr>>,
    udp_addr: RwLock<Option<SocketAddr>>,
}

impl PlainSocketDaemon {
    /// Build the daemon; validates configuration.
    pub fn new(
        config: PlainSocketConfig,
        pipeline: Arc<CommandPipeline>,
        sink: Arc<MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(config.per_ip_limit)),
            config,
            pipeline,
            sink,
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            tcp_addr: RwLock::new(None),
            udp_addr: RwLock::new(None),
        })
    }

    /// Rate limiter handle, for the supervisor's sweeper wiring
    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Bound TCP address once running
    #[must_use]
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.read()
    }

    /// Bound UDP address once running
    #[must_use]
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.read()
    }

    /// Run both listeners until stopped or lockdown.
    pub async fn start_and_block(&self) -> Result<(), DaemonError> {
        if lockdown::is_locked_down() {
            return Err(DaemonError::Lockdown);
        }
        self.running.store(true, Ordering::SeqCst);

        let tcp = if self.config.tcp_port == 0 {
            None
        } else {
            let addr = format!("{}:{}", self.config.address, self.config.tcp_port);
            let listener = TcpListener::bind(&addr).await.map_err(|e| DaemonError::Bind {
                listener: format!("plainsock-tcp {addr}"),
                source: e,
            })?;
            *self.tcp_addr.write() = listener.local_addr().ok();
            info!(addr = ?listener.local_addr().ok(), "plain socket TCP listener bound");
            Some(listener)
        };
        let udp = if self.config.udp_port == 0 {
            None
        } else {
            let addr = format!("{}:{}", self.config.address, self.config.udp_port);
            let socket = UdpSocket::bind(&addr).await.map_err(|e| DaemonError::Bind {
                listener: format!("plainsock-udp {addr}"),
                source: e,
            })?;
            *self.udp_addr.write() = socket.local_addr().ok();
            info!(addr = ?socket.local_addr().ok(), "plain socket UDP listener bound");
            Some(Arc::new(socket))
        };

        let mut lockdown_tick = tokio::time::interval(crate::dns::LOCKDOWN_POLL_INTERVAL);
        let mut udp_buf = vec![0u8; MAX_REQUEST_SIZE];
        loop {
            tokio::select! {
                _ = lockdown_tick.tick() => {
                    if lockdown::is_locked_down() {
                        self.running.store(false, Ordering::SeqCst);
                        return Err(DaemonError::Lockdown);
                    }
                }
                () = self.stop_notify.notified() => {
                    info!("plain socket daemon stopping");
                    return Ok(());
                }
                result = accept_or_pending(tcp.as_ref()) => {
                    match result {
                        Ok((stream, peer)) => {
                            if self.limiter.register(&peer.ip().to_string()) {
                                let pipeline = Arc::clone(&self.pipeline);
                                let sink = Arc::clone(&self.sink);
                                tokio::spawn(serve_tcp(stream, peer, pipeline, sink));
                            }
                            // Rejected: the stream drops, closing without reply
                        }
                        Err(err) => debug!(error = %err, "TCP accept error"),
                    }
                }
                result = recv_or_pending(udp.as_deref(), &mut udp_buf) => {
                    match result {
                        Ok((len, peer)) => {
                            if let Some(socket) = &udp {
                                if self.limiter.register(&peer.ip().to_string()) {
                                    let body = String::from_utf8_lossy(&udp_buf[..len]).into_owned();
                                    let socket = Arc::clone(socket);
                                    let pipeline = Arc::clone(&self.pipeline);
                                    let sink = Arc::clone(&self.sink);
                                    tokio::spawn(async move {
                                        let started = Instant::now();
                                        let reply = run_pipeline(&pipeline, &body).await;
                                        if socket.send_to(reply.as_bytes(), peer).await.is_ok() {
                                            sink.record("plainsock.udp", started.elapsed());
                                        }
                                    });
                                }
                            }
                        }
                        Err(err) => debug!(error = %err, "UDP receive error"),
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

/// Text transports echo pipeline errors to the operator.
async fn run_pipeline(pipeline: &CommandPipeline, body: &str) -> String {
    match pipeline.invoke(body).await {
        Ok(response) => response,
        Err(err) => err.to_string(),
    }
}

async fn serve_tcp(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<CommandPipeline>,
    sink: Arc<MetricsSink>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let mut line = Vec::new();
        let read = tokio::time::timeout(
            CONVERSATION_TIMEOUT,
            (&mut reader)
                .take((MAX_REQUEST_SIZE + 1) as u64)
                .read_until(b'\n', &mut line),
        )
        .await;
        let read = match read {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                debug!(client = %peer, error = %err, "TCP read error");
                break;
            }
        };
        if read > MAX_REQUEST_SIZE {
            debug!(client = %peer, "request line too long, closing");
            break;
        }

        let started = Instant::now();
        let body = String::from_utf8_lossy(&line).into_owned();
        let mut reply = run_pipeline(&pipeline, &body).await;
        reply.push('\n');
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
        sink.record("plainsock.tcp", started.elapsed());
    }
}

async fn accept_or_pending(
    listener: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn recv_or_pending(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterChain, PinAndShortcuts};
    use crate::mailer::MailClient;
    use crate::toolbox::FeatureSet;
    use std::collections::HashMap;

    fn test_pipeline() -> Arc<CommandPipeline> {
        let chain = FilterChain {
            pin_and_shortcuts: Some(PinAndShortcuts {
                pin: "verysecret".into(),
                shortcuts: HashMap::new(),
            }),
            ..FilterChain::default()
        };
        Arc::new(CommandPipeline::new(
            chain,
            Arc::new(FeatureSet::minimal().unwrap()),
            Arc::new(MailClient::default()),
        ))
    }

    async fn spawn_daemon(tcp: bool, udp: bool) -> Arc<PlainSocketDaemon> {
        let tcp_port = if tcp {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = probe.local_addr().unwrap().port();
            drop(probe);
            port
        } else {
            0
        };
        let udp_port = if udp {
            let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let port = probe.local_addr().unwrap().port();
            drop(probe);
            port
        } else {
            0
        };
        let config = PlainSocketConfig {
            address: "127.0.0.1".into(),
            tcp_port,
            udp_port,
            per_ip_limit: 50,
        };
        let daemon = Arc::new(
            PlainSocketDaemon::new(config, test_pipeline(), Arc::new(MetricsSink::new())).unwrap(),
        );
        let runner = Arc::clone(&daemon);
        tokio::spawn(async move { runner.start_and_block().await });
        for _ in 0..100 {
            let tcp_ready = !tcp || daemon.tcp_local_addr().is_some();
            let udp_ready = !udp || daemon.udp_local_addr().is_some();
            if tcp_ready && udp_ready {
                return daemon;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("plain socket daemon did not bind in time");
    }

    #[tokio::test]
    async fn test_tcp_command_round_trip() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let daemon = spawn_daemon(true, false).await;
        let addr = daemon.tcp_local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"verysecret .secho hello there\n")
            .await
            .unwrap();
        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "hello there\n");

        daemon.stop();
    }

    #[tokio::test]
    async fn test_tcp_multiple_commands_one_connection() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let daemon = spawn_daemon(true, false).await;
        let addr = daemon.tcp_local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"verysecret .secho one\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "one\n");

        reply.clear();
        reader
            .get_mut()
            .write_all(b"verysecret .secho two\n")
            .await
            .unwrap();
        reader.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "two\n");

        daemon.stop();
    }

    #[tokio::test]
    async fn test_tcp_errors_echoed_to_client() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let daemon = spawn_daemon(true, false).await;
        let addr = daemon.tcp_local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"badpin .secho hi\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "unauthorized PIN\n");

        daemon.stop();
    }

    #[tokio::test]
    async fn test_udp_command_round_trip() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let daemon = spawn_daemon(false, true).await;
        let addr = daemon.udp_local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"verysecret .secho datagram", addr)
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("expected UDP reply")
            .unwrap();
        assert_eq!(&buf[..len], b"datagram");

        daemon.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let daemon = spawn_daemon(true, false).await;
        daemon.stop();
        daemon.stop();
        daemon.stop();
    }
}
