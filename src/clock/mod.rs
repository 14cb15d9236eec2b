//! Media clocks and clock synchronization.
//!
//! Every pipeline runs against one active [`MediaClock`]. The clock is either
//! supplied from outside (typically a PTP-disciplined clock owned by the
//! host) or derived from the RTP timestamps seen on the receive path:
//!
//! ```text
//! rx packets → (arrival, rtp ts) → Regression → ClockFit → SlavedClock
//! ```
//!
//! [`ClockSync`] owns that choice and the one-way "synced" gate that push
//! and pull consult before moving audio.

mod regression;
mod sync;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use regression::{ClockFit, Regression, MIN_OBSERVATIONS, WINDOW};
pub use sync::{ClockMode, ClockSource, ClockStats, ClockSync, SYNTHETIC_TICK};

/// A monotonic media clock.
///
/// Implementations must be cheap to read; `now()` is called on every packet.
pub trait MediaClock: Send + Sync {
    /// Current time on this clock.
    fn now(&self) -> Duration;
}

/// Free-running local clock, counted from its creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock starting at zero now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaClock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock whose time is set from outside.
///
/// Hosts that run their own PTP client feed it here; tests use it to drive
/// time explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos() as u64),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now: Duration) {
        self.nanos.store(now.as_nanos() as u64, Ordering::Release);
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl MediaClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

/// Clock derived from a local clock through a regression fit.
pub(crate) struct SlavedClock {
    internal: Arc<dyn MediaClock>,
    fit: parking_lot::RwLock<ClockFit>,
}

impl SlavedClock {
    pub(crate) fn new(internal: Arc<dyn MediaClock>) -> Self {
        Self {
            internal,
            fit: parking_lot::RwLock::new(ClockFit::IDENTITY),
        }
    }

    pub(crate) fn update(&self, fit: ClockFit) {
        *self.fit.write() = fit;
    }

    pub(crate) fn fit(&self) -> ClockFit {
        *self.fit.read()
    }
}

impl MediaClock for SlavedClock {
    fn now(&self) -> Duration {
        self.fit.read().apply(self.internal.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_secs(5));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Duration::from_millis(5250));
        clock.set(Duration::ZERO);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_slaved_clock_applies_fit() {
        let internal = Arc::new(ManualClock::new(Duration::from_secs(1)));
        let slaved = SlavedClock::new(internal.clone());
        assert_eq!(slaved.now(), Duration::from_secs(1));

        slaved.update(ClockFit {
            slope: 1.0,
            intercept_ns: 2_000_000_000.0,
            r_squared: 1.0,
        });
        assert_eq!(slaved.now(), Duration::from_secs(3));
        internal.advance(Duration::from_secs(1));
        assert_eq!(slaved.now(), Duration::from_secs(4));
    }
}
