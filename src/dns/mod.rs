//! DNS recursive forwarder daemon
//!
//! Serves DNS over UDP and TCP. The daemon does not resolve anything itself:
//! admitted queries are relayed verbatim to public recursive resolvers and
//! the answers relayed back, except for names on the ad/malware blacklist,
//! which receive a synthesised `0.0.0.0` answer.
//!
//! # Request flow
//!
//! ```text
//! packet/connection
//!     | source IP prefix ACL          (fail: drop silently)
//!     | per-IP token bucket           (fail: drop silently)
//!     | first QNAME extraction        (malformed: forward unmodified)
//!     | blacklist lookup              (hit: synthesise 0.0.0.0)
//!     v
//! round-robin upstream, 3 s deadline, reply relayed verbatim
//! ```

pub mod blacklist;
pub mod message;
pub mod upstream;

pub use blacklist::{Blacklist, BlacklistStore};
pub use upstream::UpstreamPool;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, DaemonError};
use crate::limiter::RateLimiter;
use crate::lockdown;
use crate::stats::MetricsSink;

/// Largest inbound query either transport accepts
const MAX_QUERY_SIZE: usize = 4096;

/// Whole-conversation deadline for one inbound TCP query
const TCP_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// How often daemon loops poll the lockdown latch
pub(crate) const LOCKDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration of the DNS daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsDaemonConfig {
    /// Listen address for both transports
    #[serde(rename = "Address", default = "default_address")]
    pub address: String,

    /// TCP listener port; 0 disables the TCP transport
    #[serde(rename = "TCPPort", default)]
    pub tcp_port: u16,

    /// UDP listener port; 0 disables the UDP transport
    #[serde(rename = "UDPPort", default)]
    pub udp_port: u16,

    /// Queries admitted per source IP per second
    #[serde(rename = "PerIPLimit", default = "default_per_ip_limit")]
    pub per_ip_limit: u32,

    /// Source addresses must string-prefix-match one of these in dotted
    /// form; `"192"` matches every address starting with 192
    #[serde(rename = "AllowQueryIPPrefixes", default)]
    pub allow_query_ip_prefixes: Vec<String>,

    /// Upstream resolver addresses; built-in public resolvers when empty
    #[serde(rename = "Forwarders", default)]
    pub forwarders: Vec<String>,

    /// Blacklist hosts-file sources; built-in defaults when empty
    #[serde(rename = "BlacklistURLs", default)]
    pub blacklist_urls: Vec<String>,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_per_ip_limit() -> u32 {
    10
}

impl DnsDaemonConfig {
    /// Validate the section; called at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_port == 0 && self.udp_port == 0 {
            return Err(ConfigError::ValidationError(
                "DNSDaemon needs TCPPort or UDPPort".into(),
            ));
        }
        if self.per_ip_limit == 0 {
            return Err(ConfigError::ValidationError(
                "DNSDaemon.PerIPLimit must be positive".into(),
            ));
        }
        if self.allow_query_ip_prefixes.iter().all(String::is_empty) {
            return Err(ConfigError::ValidationError(
                "DNSDaemon.AllowQueryIPPrefixes must name at least one prefix".into(),
            ));
        }
        for forwarder in &self.forwarders {
            forwarder.parse::<SocketAddr>().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "DNSDaemon.Forwarders entry {forwarder:?} is not host:port"
                ))
            })?;
        }
        Ok(())
    }
}

/// The DNS forwarder daemon
pub struct DnsDaemon {
    config: DnsDaemonConfig,
    limiter: Arc<RateLimiter>,
    blacklist: Arc<BlacklistStore>,
    upstreams: Arc<UpstreamPool>,
    sink: Arc<MetricsSink>,
    running: AtomicBool,
    stop_notify: Notify,
    udp_addr: RwLock<Option<SocketAddr>>,
    tcp_addr: RwLock<Option<SocketAddr>>,
}

impl DnsDaemon {
    /// Build the daemon; validates configuration.
    pub fn new(config: DnsDaemonConfig, sink: Arc<MetricsSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let forwarders = config
            .forwarders
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(config.per_ip_limit)),
            blacklist: Arc::new(BlacklistStore::new(config.blacklist_urls.clone())),
            upstreams: Arc::new(UpstreamPool::new(forwarders)),
            sink,
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            udp_addr: RwLock::new(None),
            tcp_addr: RwLock::new(None),
            config,
        })
    }

    /// The blacklist holder, for the maintenance loop's periodic refresh
    #[must_use]
    pub fn blacklist_store(&self) -> Arc<BlacklistStore> {
        Arc::clone(&self.blacklist)
    }

    /// Rate limiter handle, for the supervisor's sweeper wiring
    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Bound UDP address once the daemon is running
    #[must_use]
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.read()
    }

    /// Bound TCP address once the daemon is running
    #[must_use]
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.read()
    }

    fn ip_allowed(&self, ip: IpAddr) -> bool {
        let dotted = ip.to_string();
        self.config
            .allow_query_ip_prefixes
            .iter()
            .filter(|p| !p.is_empty())
            .any(|prefix| dotted.starts_with(prefix.as_str()))
    }

    /// Both admission gates; failures are silent by design.
    fn admit(&self, ip: IpAddr) -> bool {
        if !self.ip_allowed(ip) {
            debug!(client = %ip, "query source outside allowed prefixes, dropped");
            return false;
        }
        if !self.limiter.register(&ip.to_string()) {
            debug!(client = %ip, "query rate limited, dropped");
            return false;
        }
        true
    }

    /// Run both listeners until [`stop`](Self::stop) or lockdown.
    pub async fn start_and_block(&self) -> Result<(), DaemonError> {
        if lockdown::is_locked_down() {
            return Err(DaemonError::Lockdown);
        }
        self.running.store(true, Ordering::SeqCst);

        let udp = if self.config.udp_port == 0 {
            None
        } else {
            let addr = format!("{}:{}", self.config.address, self.config.udp_port);
            let socket = UdpSocket::bind(&addr).await.map_err(|e| DaemonError::Bind {
                listener: format!("dns-udp {addr}"),
                source: e,
            })?;
            *self.udp_addr.write() = socket.local_addr().ok();
            info!(addr = ?socket.local_addr().ok(), "DNS UDP listener bound");
            Some(Arc::new(socket))
        };
        let tcp = if self.config.tcp_port == 0 {
            None
        } else {
            let addr = format!("{}:{}", self.config.address, self.config.tcp_port);
            let listener = TcpListener::bind(&addr).await.map_err(|e| DaemonError::Bind {
                listener: format!("dns-tcp {addr}"),
                source: e,
            })?;
            *self.tcp_addr.write() = listener.local_addr().ok();
            info!(addr = ?listener.local_addr().ok(), "DNS TCP listener bound");
            Some(listener)
        };

        // Initial blacklist build happens off the accept path
        {
            let blacklist = Arc::clone(&self.blacklist);
            tokio::spawn(async move {
                blacklist.refresh().await;
            });
        }

        let mut lockdown_tick = tokio::time::interval(LOCKDOWN_POLL_INTERVAL);
        let mut udp_buf = vec![0u8; MAX_QUERY_SIZE];
        loop {
            tokio::select! {
                _ = lockdown_tick.tick() => {
                    if lockdown::is_locked_down() {
                        self.running.store(false, Ordering::SeqCst);
                        return Err(DaemonError::Lockdown);
                    }
                }
                () = self.stop_notify.notified() => {
                    info!("DNS daemon stopping");
                    return Ok(());
                }
                result = recv_or_pending(udp.as_deref(), &mut udp_buf) => {
                    match result {
                        Ok((len, peer)) => {
                            if let Some(socket) = &udp {
                                if self.admit(peer.ip()) {
                                    self.spawn_udp_handler(Arc::clone(socket), peer, udp_buf[..len].to_vec());
                                }
                            }
                        }
                        Err(err) => debug!(error = %err, "UDP receive error"),
                    }
                }
                result = accept_or_pending(tcp.as_ref()) => {
                    match result {
                        Ok((stream, peer)) => {
                            if self.admit(peer.ip()) {
                                self.spawn_tcp_handler(stream, peer);
                            }
                            // Not admitted: stream drops here, closing the
                            // connection without a reply
                        }
                        Err(err) => debug!(error = %err, "TCP accept error"),
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

    fn spawn_udp_handler(&self, socket: Arc<UdpSocket>, peer: SocketAddr, packet: Vec<u8>) {
        let blacklist = Arc::clone(&self.blacklist);
        let upstreams = Arc::clone(&self.upstreams);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let started = Instant::now();
            if let Some(reply) = resolve(&blacklist, &upstreams, &packet, false).await {
                match socket.send_to(&reply, peer).await {
                    Ok(_) => sink.record("dns.udp", started.elapsed()),
                    Err(err) => warn!(client = %peer, error = %err, "failed to send UDP reply"),
                }
            }
        });
    }

    fn spawn_tcp_handler(&self, stream: TcpStream, peer: SocketAddr) {
        let blacklist = Arc::clone(&self.blacklist);
        let upstreams = Arc::clone(&self.upstreams);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let started = Instant::now();
            let result = tokio::time::timeout(
                TCP_QUERY_TIMEOUT,
                serve_tcp_query(stream, &blacklist, &upstreams),
            )
            .await;
            match result {
                Ok(Ok(())) => sink.record("dns.tcp", started.elapsed()),
                Ok(Err(err)) => debug!(client = %peer, error = %err, "TCP query failed"),
                Err(_) => debug!(client = %peer, "TCP query timed out"),
            }
        });
    }
}

/// Answer one query: blocked names synthesise, everything else relays.
async fn resolve(
    blacklist: &BlacklistStore,
    upstreams: &UpstreamPool,
    packet: &[u8],
    via_tcp: bool,
) -> Option<Vec<u8>> {
    if let Some(name) = message::first_query_name(packet) {
        if blacklist.snapshot().is_blocked(&name) {
            debug!(name, "answering blacklisted name with 0.0.0.0");
            return message::blocked_response(packet);
        }
    }
    // Malformed packets fall through here and are relayed unmodified
    let relayed = if via_tcp {
        upstreams.forward_tcp(packet).await
    } else {
        upstreams.forward_udp(packet).await
    };
    match relayed {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            debug!(error = %err, "upstream relay failed, no reply sent");
            None
        }
    }
}

async fn serve_tcp_query(
    mut stream: TcpStream,
    blacklist: &BlacklistStore,
    upstreams: &UpstreamPool,
) -> std::io::Result<()> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let query_len = usize::from(u16::from_be_bytes(len_buf));
    if query_len == 0 || query_len > MAX_QUERY_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "query length out of range",
        ));
    }
    let mut query = vec![0u8; query_len];
    stream.read_exact(&mut query).await?;

    if let Some(reply) = resolve(blacklist, upstreams, &query, true).await {
        let len = u16::try_from(reply.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "oversized reply"))?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&reply).await?;
    }
    Ok(())
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

async fn accept_or_pending(
    listener: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Message;
    use hickory_proto::rr::RData;
    use hickory_proto::serialize::binary::BinDecodable;
    use std::sync::atomic::AtomicUsize;

    fn test_config(udp_port: u16, tcp_port: u16) -> DnsDaemonConfig {
        DnsDaemonConfig {
            address: "127.0.0.1".into(),
            tcp_port,
            udp_port,
            per_ip_limit: 5,
            allow_query_ip_prefixes: vec!["127".into()],
            // Closed port: the startup refresh fails fast and loudly
            forwarders: Vec::new(),
            blacklist_urls: vec!["http://127.0.0.1:1/hosts".into()],
        }
    }

    // ========================================================================
    // Configuration Tests
    // ========================================================================

    #[test]
    fn test_config_requires_a_port() {
        let mut config = test_config(0, 0);
        assert!(config.validate().is_err());
        config.udp_port = 5353;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_requires_prefixes() {
        let mut config = test_config(5353, 0);
        config.allow_query_ip_prefixes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_bad_forwarder() {
        let mut config = test_config(5353, 0);
        config.forwarders = vec!["not-an-address".into()];
        assert!(config.validate().is_err());
    }

    // ========================================================================
    // ACL Tests
    // ========================================================================

    #[test]
    fn test_prefix_acl() {
        let mut config = test_config(5353, 0);
        config.allow_query_ip_prefixes = vec!["192".into(), "10.0".into()];
        let daemon = DnsDaemon::new(config, Arc::new(MetricsSink::new())).unwrap();

        assert!(daemon.ip_allowed("192.168.1.1".parse().unwrap()));
        assert!(daemon.ip_allowed("192.0.0.7".parse().unwrap()));
        assert!(daemon.ip_allowed("10.0.0.1".parse().unwrap()));
        assert!(!daemon.ip_allowed("10.1.0.1".parse().unwrap()));
        assert!(!daemon.ip_allowed("172.16.0.1".parse().unwrap()));
    }

    // ========================================================================
    // End-to-End Tests
    // ========================================================================

    /// Fake upstream resolver that answers every query with the query bytes
    /// themselves and counts what it saw.
    async fn spawn_fake_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let _ = socket.send_to(&buf[..len], peer).await;
            }
        });
        (addr, hits)
    }

    async fn spawn_daemon(upstream: SocketAddr) -> (Arc<DnsDaemon>, SocketAddr) {
        // Grab an ephemeral port from the OS for the daemon to bind
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut config = test_config(port, 0);
        config.forwarders = vec![upstream.to_string()];

        let daemon = Arc::new(DnsDaemon::new(config, Arc::new(MetricsSink::new())).unwrap());
        let runner = Arc::clone(&daemon);
        tokio::spawn(async move { runner.start_and_block().await });

        // Wait for the listener to come up
        for _ in 0..100 {
            if let Some(addr) = daemon.udp_local_addr() {
                return (daemon, addr);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("DNS daemon did not bind in time");
    }

    #[tokio::test]
    async fn test_udp_forwarding_and_blacklist_rewrite() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let (upstream_addr, hits) = spawn_fake_upstream().await;
        let (daemon, dns_addr) = spawn_daemon(upstream_addr).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // A clean name is relayed verbatim
        let query = message::sample_query(0x1111, "example.com.");
        client.send_to(&query, dns_addr).await.unwrap();
        let mut buf = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("expected relayed answer")
            .unwrap();
        assert_eq!(&buf[..len], &query[..], "upstream answer relayed verbatim");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A blacklisted subdomain is rewritten locally, never forwarded
        daemon
            .blacklist_store()
            .install(Blacklist::from_names(["ads.example.com"]));
        let query = message::sample_query(0x2222, "banner.ads.example.com.");
        client.send_to(&query, dns_addr).await.unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("expected synthesised answer")
            .unwrap();
        let reply = Message::from_bytes(&buf[..len]).unwrap();
        assert_eq!(reply.header().id(), 0x2222);
        match reply.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, std::net::Ipv4Addr::UNSPECIFIED),
            other => panic!("expected A 0.0.0.0, got {other:?}"),
        }
        assert_eq!(reply.answers()[0].ttl(), message::BLOCKED_RESPONSE_TTL);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "blocked query must not reach upstream");

        daemon.stop();
    }

    #[tokio::test]
    async fn test_udp_per_ip_rate_limit() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let (upstream_addr, hits) = spawn_fake_upstream().await;
        let (daemon, dns_addr) = spawn_daemon(upstream_addr).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = message::sample_query(0x3333, "example.org.");

        // 10 queries well inside one second: exactly the per-IP limit of 5
        // may reach the upstream wire.
        for _ in 0..10 {
            client.send_to(&query, dns_addr).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 5);

        daemon.stop();
    }

    #[tokio::test]
    async fn test_tcp_blocked_query_answered_locally() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let tcp_port = probe.local_addr().unwrap().port();
        drop(probe);

        // No working upstream: a blocked name must still be answered,
        // because the rewrite never touches the upstream wire.
        let mut config = test_config(0, tcp_port);
        config.forwarders = vec!["127.0.0.1:1".into()];
        let daemon = Arc::new(DnsDaemon::new(config, Arc::new(MetricsSink::new())).unwrap());
        daemon
            .blacklist_store()
            .install(Blacklist::from_names(["ads.example.com"]));
        let runner = Arc::clone(&daemon);
        tokio::spawn(async move { runner.start_and_block().await });
        let mut tcp_addr = None;
        for _ in 0..100 {
            tcp_addr = daemon.tcp_local_addr();
            if tcp_addr.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let tcp_addr = tcp_addr.expect("TCP listener did not bind");

        let query = message::sample_query(0x4444, "ads.example.com.");
        let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
        stream
            .write_all(&(query.len() as u16).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&query).await.unwrap();

        let mut len_buf = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut len_buf))
            .await
            .expect("expected length prefix")
            .unwrap();
        let mut reply = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        stream.read_exact(&mut reply).await.unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();
        assert_eq!(parsed.header().id(), 0x4444);
        match parsed.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, std::net::Ipv4Addr::UNSPECIFIED),
            other => panic!("expected A 0.0.0.0, got {other:?}"),
        }

        daemon.stop();
    }
}
