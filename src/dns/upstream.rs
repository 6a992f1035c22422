//! Upstream resolver pool
//!
//! The forwarder relays raw query bytes to public recursive resolvers and
//! returns whatever they answer, verbatim. Selection is round-robin over the
//! configured addresses. Each relay is bounded by a 3-second deadline, and a
//! process-wide semaphore caps the number of in-flight upstream queries in
//! addition to the per-client admission bucket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tracing::trace;

/// Public resolvers used when the configuration names none
pub const DEFAULT_FORWARDERS: &[&str] = &["8.8.8.8:53", "8.8.4.4:53", "1.1.1.1:53", "1.0.0.1:53"];

/// Deadline for one upstream exchange
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on concurrent upstream exchanges across the whole process
const MAX_INFLIGHT: usize = 64;

/// Largest upstream response the UDP path will accept
const MAX_UDP_RESPONSE: usize = 4096;

/// Largest upstream response the TCP path will accept
const MAX_TCP_RESPONSE: usize = 65535;

/// Round-robin pool of upstream resolvers
pub struct UpstreamPool {
    forwarders: Vec<SocketAddr>,
    next: AtomicUsize,
    inflight: Semaphore,
}

impl UpstreamPool {
    /// Create a pool; an empty address list falls back to
    /// [`DEFAULT_FORWARDERS`].
    #[must_use]
    pub fn new(mut forwarders: Vec<SocketAddr>) -> Self {
        if forwarders.is_empty() {
            forwarders = DEFAULT_FORWARDERS
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect();
        }
        Self {
            forwarders,
            next: AtomicUsize::new(0),
            inflight: Semaphore::new(MAX_INFLIGHT),
        }
    }

    /// The configured upstream addresses
    #[must_use]
    pub fn forwarders(&self) -> &[SocketAddr] {
        &self.forwarders
    }

    fn pick(&self) -> SocketAddr {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.forwarders[index % self.forwarders.len()]
    }

    /// Relay one query over UDP and return the raw response bytes.
    pub async fn forward_udp(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "upstream pool closed"))?;
        let upstream = self.pick();
        tokio::time::timeout(UPSTREAM_TIMEOUT, async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(upstream).await?;
            socket.send(query).await?;
            let mut buf = vec![0u8; MAX_UDP_RESPONSE];
            let len = socket.recv(&mut buf).await?;
            buf.truncate(len);
            trace!(upstream = %upstream, len, "upstream UDP answer");
            Ok(buf)
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream query timed out"))?
    }

    /// Relay one query over TCP (2-byte length prefix both ways) and return
    /// the raw response bytes.
    pub async fn forward_tcp(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "upstream pool closed"))?;
        let upstream = self.pick();
        tokio::time::timeout(UPSTREAM_TIMEOUT, async {
            let mut stream = TcpStream::connect(upstream).await?;
            let len = u16::try_from(query.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "query too large"))?;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(query).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let response_len = usize::from(u16::from_be_bytes(len_buf));
            if response_len > MAX_TCP_RESPONSE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized upstream response",
                ));
            }
            let mut buf = vec![0u8; response_len];
            stream.read_exact(&mut buf).await?;
            trace!(upstream = %upstream, len = response_len, "upstream TCP answer");
            Ok(buf)
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream query timed out"))?
    }
}
