//! In-memory ring buffer of recent log events
//!
//! The maintenance report embeds the most recent log lines and the most
//! recent warnings. This module provides a `tracing_subscriber` [`Layer`]
//! that copies every formatted event into two bounded ring buffers, one for
//! all events and one for WARN-and-above.

use std::collections::VecDeque;
use std::fmt::Write as _;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// How many recent events each ring retains
const RING_CAPACITY: usize = 128;

/// Bounded buffers of recently formatted log events
#[derive(Debug, Default)]
pub struct LogRing {
    all: Mutex<VecDeque<String>>,
    warnings: Mutex<VecDeque<String>>,
}

impl LogRing {
    /// Create an empty ring
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, level: &Level, line: String) {
        if *level <= Level::WARN {
            push_bounded(&mut self.warnings.lock(), line.clone());
        }
        push_bounded(&mut self.all.lock(), line);
    }

    /// Recent events of any level, oldest first, one per line
    #[must_use]
    pub fn recent_logs(&self) -> String {
        self.all.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Recent WARN and ERROR events, oldest first, one per line
    #[must_use]
    pub fn recent_warnings(&self) -> String {
        self.warnings
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn push_bounded(ring: &mut VecDeque<String>, line: String) {
    if ring.len() == RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(line);
}

/// `tracing_subscriber` layer feeding a [`LogRing`]
pub struct LogRingLayer {
    ring: std::sync::Arc<LogRing>,
}

impl LogRingLayer {
    /// Create a layer writing into the given ring
    #[must_use]
    pub fn new(ring: std::sync::Arc<LogRing>) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut line = format!("{} {}: ", meta.level(), meta.target());
        let mut visitor = LineVisitor { line: &mut line };
        event.record(&mut visitor);
        self.ring.push(meta.level(), line);
    }
}

struct LineVisitor<'a> {
    line: &'a mut String,
}

impl Visit for LineVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.line, "{value:?} ");
        } else {
            let _ = write!(self.line, "{}={:?} ", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded() {
        let ring = LogRing::new();
        for i in 0..(RING_CAPACITY + 10) {
            ring.push(&Level::INFO, format!("line {i}"));
        }
        let logs = ring.recent_logs();
        assert_eq!(logs.lines().count(), RING_CAPACITY);
        // Oldest lines fell off the front
        assert!(!logs.contains("line 0\n"));
        assert!(logs.contains(&format!("line {}", RING_CAPACITY + 9)));
    }

    #[test]
    fn test_warnings_filtered_by_level() {
        let ring = LogRing::new();
        ring.push(&Level::INFO, "routine".into());
        ring.push(&Level::WARN, "trouble".into());
        ring.push(&Level::ERROR, "disaster".into());
        let warnings = ring.recent_warnings();
        assert!(!warnings.contains("routine"));
        assert!(warnings.contains("trouble"));
        assert!(warnings.contains("disaster"));
        assert_eq!(ring.recent_logs().lines().count(), 3);
    }
}
