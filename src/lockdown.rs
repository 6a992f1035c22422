//! Process-wide emergency state
//!
//! Two pieces of state are deliberately process-wide rather than injected:
//!
//! - The **emergency lockdown latch**: a one-way boolean. Once set, every
//!   daemon loop unwinds with [`DaemonError::Lockdown`](crate::error::DaemonError)
//!   within one iteration and the supervisor exits. Only a process restart
//!   resets it.
//! - The **startup time anchor**: used to detect stale inbound commands
//!   (e.g. Telegram messages queued while the process was down). If the wall
//!   clock is ever corrected backwards so far that startup appears to lie in
//!   the future, the maintenance loop clamps the anchor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;
use tracing::error;

static EMERGENCY_LOCKDOWN: AtomicBool = AtomicBool::new(false);

/// Latch the emergency lockdown flag.
///
/// Safe to call from any task; calling it more than once has no further
/// effect. Every daemon polls [`is_locked_down`] at the top of its loop.
pub fn trigger_lockdown(reason: &str) {
    if !EMERGENCY_LOCKDOWN.swap(true, Ordering::SeqCst) {
        error!(reason, "EMERGENCY LOCKDOWN triggered, all daemons will terminate");
    }
}

/// Read the lockdown latch.
#[must_use]
pub fn is_locked_down() -> bool {
    EMERGENCY_LOCKDOWN.load(Ordering::SeqCst)
}

/// Reset the latch. Test use only; production code never unlatches.
#[cfg(test)]
pub(crate) fn reset_lockdown_for_test() {
    EMERGENCY_LOCKDOWN.store(false, Ordering::SeqCst);
}

/// Excludes tests that latch the global flag from tests that run daemon
/// loops, since the latch is process-wide and cargo runs tests in parallel
/// threads. Loop tests take `read`, latching tests take `write`.
#[cfg(test)]
pub(crate) static TEST_LOCKDOWN_GUARD: parking_lot::RwLock<()> = parking_lot::RwLock::new(());

/// Startup time anchor
///
/// Holds both the wall-clock and monotonic instants captured when the
/// process started. The wall-clock value may be clamped once by the
/// maintenance loop if severe clock skew is detected; the monotonic value
/// never moves.
pub struct StartupTime {
    wall: RwLock<SystemTime>,
    mono: Instant,
}

impl StartupTime {
    /// Capture the current instant as the process start.
    #[must_use]
    pub fn now() -> Self {
        Self {
            wall: RwLock::new(SystemTime::now()),
            mono: Instant::now(),
        }
    }

    /// Wall-clock startup time, possibly clamped.
    #[must_use]
    pub fn wall(&self) -> SystemTime {
        *self.wall.read()
    }

    /// Elapsed time since startup on the monotonic clock.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.mono.elapsed()
    }

    /// Clamp the anchor if it lies in the future.
    ///
    /// Returns true when a clamp happened. The anchor is moved to
    /// `now - margin` so that downstream staleness checks become sane again.
    pub fn clamp_if_skewed(&self, margin: Duration) -> bool {
        let now = SystemTime::now();
        let mut wall = self.wall.write();
        if *wall > now {
            *wall = now - margin;
            true
        } else {
            false
        }
    }
}

impl Default for StartupTime {
    fn default() -> Self {
        Self::now()
    }
}
