//! Per-daemon latency statistics
//!
//! Every daemon records the duration of each successfully handled request
//! into a shared [`MetricsSink`]. The sink is handed to daemons at
//! construction time; it knows nothing about the daemons themselves, which
//! keeps the maintenance report (the only consumer of the formatted
//! snapshot) free of cyclic dependencies on the transport modules.
//!
//! Counters are write-only atomics. Reads may race with writes and observe a
//! slightly stale snapshot, which is acceptable for reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Latency histogram for one channel (low/avg/high/total and count)
#[derive(Debug, Default)]
pub struct DurationStats {
    /// Lowest observed duration in nanoseconds (u64::MAX until first sample)
    low_ns: AtomicU64,
    /// Highest observed duration in nanoseconds
    high_ns: AtomicU64,
    /// Sum of all observed durations in nanoseconds
    total_ns: AtomicU64,
    /// Number of samples
    count: AtomicU64,
}

impl DurationStats {
    /// Create an empty histogram
    #[must_use]
    pub fn new() -> Self {
        Self {
            low_ns: AtomicU64::new(u64::MAX),
            high_ns: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one sample
    pub fn record(&self, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.low_ns.fetch_min(ns, Ordering::Relaxed);
        self.high_ns.fetch_max(ns, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of samples recorded
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as `low/avg/high/total seconds (count)` with the given number
    /// of decimal places.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn format(&self, decimals: usize) -> String {
        let count = self.count();
        if count == 0 {
            return format!(
                "{:.*}/{:.*}/{:.*}/{:.*} (0)",
                decimals, 0.0, decimals, 0.0, decimals, 0.0, decimals, 0.0
            );
        }
        let factor = 1_000_000_000.0;
        let low = self.low_ns.load(Ordering::Relaxed) as f64 / factor;
        let high = self.high_ns.load(Ordering::Relaxed) as f64 / factor;
        let total = self.total_ns.load(Ordering::Relaxed) as f64 / factor;
        let avg = total / count as f64;
        format!(
            "{:.*}/{:.*}/{:.*}/{:.*} ({})",
            decimals, low, decimals, avg, decimals, high, decimals, total, count
        )
    }
}

/// Shared sink of per-channel latency histograms
///
/// Channels are identified by a short static label such as `"dns.udp"` or
/// `"plainsock.tcp"`. Entries are created lazily on first record.
#[derive(Debug, Default)]
pub struct MetricsSink {
    channels: DashMap<&'static str, DurationStats>,
}

/// Channel labels in the order the report presents them
pub const REPORT_CHANNELS: &[&str] = &[
    "httpd",
    "dns.tcp",
    "dns.udp",
    "mailcmd",
    "plainsock.tcp",
    "plainsock.udp",
    "smtpd",
    "sockd.tcp",
    "telegram",
];

impl MetricsSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample on a channel, creating the channel if needed
    pub fn record(&self, channel: &'static str, elapsed: Duration) {
        self.channels
            .entry(channel)
            .or_insert_with(DurationStats::new)
            .record(elapsed);
    }

    /// Total samples across all channels
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.channels.iter().map(|e| e.value().count()).sum()
    }

    /// Format all report channels, one `label: low/avg/high/total (count)`
    /// line each. Channels without samples render with zeroes so the report
    /// layout is stable.
    #[must_use]
    pub fn format_report(&self) -> String {
        let mut out = String::new();
        for &label in REPORT_CHANNELS {
            let line = match self.channels.get(label) {
                Some(stats) => stats.format(2),
                None => DurationStats::new().format(2),
            };
            out.push_str(&format!("{label:<16}{line}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_stats_empty_format() {
        let stats = DurationStats::new();
        assert_eq!(stats.format(2), "0.00/0.00/0.00/0.00 (0)");
    }

    #[test]
    fn test_duration_stats_record() {
        let stats = DurationStats::new();
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        assert_eq!(stats.count(), 2);
        let formatted = stats.format(2);
        // low 0.01, avg 0.02, high 0.03, total 0.04
        assert_eq!(formatted, "0.01/0.02/0.03/0.04 (2)");
    }

    #[test]
    fn test_sink_lazily_creates_channels() {
        let sink = MetricsSink::new();
        assert_eq!(sink.total_count(), 0);
        sink.record("dns.udp", Duration::from_millis(1));
        sink.record("dns.udp", Duration::from_millis(1));
        sink.record("telegram", Duration::from_millis(1));
        assert_eq!(sink.total_count(), 3);
    }

    #[test]
    fn test_report_has_stable_layout() {
        let sink = MetricsSink::new();
        sink.record("dns.udp", Duration::from_millis(5));
        let report = sink.format_report();
        for &label in REPORT_CHANNELS {
            assert!(report.contains(label), "missing channel {label}");
        }
        assert_eq!(report.lines().count(), REPORT_CHANNELS.len());
    }

    #[test]
    fn test_concurrent_record() {
        use std::sync::Arc;
        let sink = Arc::new(MetricsSink::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        sink.record("plainsock.tcp", Duration::from_micros(50));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sink.total_count(), 400);
    }
}
