//! Clock sync controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::{ClockFit, MediaClock, Regression, SlavedClock, SystemClock};

/// Interval between synthetic clock observations.
#[cfg(windows)]
pub const SYNTHETIC_TICK: Duration = Duration::from_millis(1000);

/// Interval between synthetic clock observations.
#[cfg(not(windows))]
pub const SYNTHETIC_TICK: Duration = Duration::from_millis(100);

/// Where a pipeline's clock comes from.
#[derive(Clone)]
pub enum ClockSource {
    /// Use the supplied clock as is. Synced immediately.
    External(Arc<dyn MediaClock>),
    /// Derive the clock from received RTP timestamps.
    Synthetic,
}

impl std::fmt::Debug for ClockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External(_) => write!(f, "External"),
            Self::Synthetic => write!(f, "Synthetic"),
        }
    }
}

/// Active clock mode of a [`ClockSync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// An externally supplied clock is installed.
    External,
    /// The clock is derived from observations.
    Synthetic,
}

/// Snapshot of a clock's state, used for clock quality reporting.
#[derive(Debug, Clone)]
pub struct ClockStats {
    /// Active mode.
    pub mode: ClockMode,
    /// Whether the clock is usable.
    pub synced: bool,
    /// Observations in the regression window (synthetic mode only).
    pub observations: usize,
    /// Current fit (synthetic mode only, once synced).
    pub fit: Option<ClockFit>,
}

/// Owns a pipeline's timing reference and its "synced" gate.
///
/// The synced flag only ever moves from `false` to `true` on its own. The
/// one way back is [`install`](Self::install), which is an explicit clock
/// switch done while the pipeline is paused.
pub struct ClockSync {
    internal: Arc<dyn MediaClock>,
    active: RwLock<Arc<dyn MediaClock>>,
    slaved: Arc<SlavedClock>,
    regression: Mutex<Regression>,
    synthetic: AtomicBool,
    synced: AtomicBool,
    sample_rate: u32,
}

impl ClockSync {
    /// Creates a controller for a stream at `sample_rate`.
    pub fn new(source: ClockSource, sample_rate: u32) -> Self {
        let internal: Arc<dyn MediaClock> = Arc::new(SystemClock::new());
        let slaved = Arc::new(SlavedClock::new(internal.clone()));
        let sync = Self {
            internal: internal.clone(),
            active: RwLock::new(internal),
            slaved,
            regression: Mutex::new(Regression::default()),
            synthetic: AtomicBool::new(true),
            synced: AtomicBool::new(false),
            sample_rate: sample_rate.max(1),
        };
        sync.install(source);
        sync
    }

    /// Returns true once the clock can be used for media.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Active mode.
    pub fn mode(&self) -> ClockMode {
        if self.synthetic.load(Ordering::Acquire) {
            ClockMode::Synthetic
        } else {
            ClockMode::External
        }
    }

    /// Time on the active clock.
    pub fn now(&self) -> Duration {
        self.active.read().now()
    }

    /// Time on the free-running local clock. Arrival times are stamped with it.
    pub fn internal_now(&self) -> Duration {
        self.internal.now()
    }

    /// Installs a new clock source, resetting the synced gate accordingly.
    ///
    /// Only call this with the pipeline paused.
    pub fn install(&self, source: ClockSource) {
        self.regression.lock().clear();
        match source {
            ClockSource::External(clock) => {
                *self.active.write() = clock;
                self.synthetic.store(false, Ordering::Release);
                self.synced.store(true, Ordering::Release);
            }
            ClockSource::Synthetic => {
                *self.active.write() = self.internal.clone();
                self.synthetic.store(true, Ordering::Release);
                self.synced.store(false, Ordering::Release);
            }
        }
    }

    /// Feeds one observation: a packet that arrived at internal time
    /// `arrival` carrying extended RTP timestamp `rtp_ts`.
    ///
    /// Returns true if this observation synced the clock. Ignored when an
    /// external clock is installed.
    pub fn observe(&self, arrival: Duration, rtp_ts: u64) -> bool {
        if !self.synthetic.load(Ordering::Acquire) {
            return false;
        }

        let external_ns = u128::from(rtp_ts) * 1_000_000_000 / u128::from(self.sample_rate);
        let external = Duration::from_nanos(external_ns as u64);

        let Some(fit) = self.regression.lock().add(arrival, external) else {
            return false;
        };
        self.slaved.update(fit);

        if self
            .synced
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.active.write() = self.slaved.clone();
            return true;
        }
        false
    }

    /// Current clock state.
    pub fn stats(&self) -> ClockStats {
        let mode = self.mode();
        let synced = self.is_synced();
        ClockStats {
            mode,
            synced,
            observations: self.regression.lock().len(),
            fit: (mode == ClockMode::Synthetic && synced).then(|| self.slaved.fit()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MIN_OBSERVATIONS};

    #[test]
    fn test_external_is_synced_immediately() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(42)));
        let sync = ClockSync::new(ClockSource::External(clock), 48000);
        assert!(sync.is_synced());
        assert_eq!(sync.mode(), ClockMode::External);
        assert_eq!(sync.now(), Duration::from_secs(42));
        assert!(!sync.observe(Duration::ZERO, 0));
    }

    #[test]
    fn test_synthetic_syncs_exactly_once() {
        let sync = ClockSync::new(ClockSource::Synthetic, 48000);
        assert!(!sync.is_synced());

        let mut flips = 0;
        for i in 0..20u64 {
            let arrival = Duration::from_millis(i * 100);
            // 100ms of audio at 48kHz per tick
            if sync.observe(arrival, 1_000_000 + i * 4800) {
                flips += 1;
                assert_eq!(i as usize, MIN_OBSERVATIONS - 1);
            }
            if i as usize >= MIN_OBSERVATIONS - 1 {
                assert!(sync.is_synced());
            }
        }
        assert_eq!(flips, 1);

        let stats = sync.stats();
        let fit = stats.fit.unwrap();
        assert!((fit.slope - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_stalled_timestamps_never_sync() {
        let sync = ClockSync::new(ClockSource::Synthetic, 48000);
        for i in 0..20u64 {
            assert!(!sync.observe(Duration::from_millis(i * 100), 777));
        }
        assert!(!sync.is_synced());
    }

    #[test]
    fn test_install_switches_mode() {
        let sync = ClockSync::new(ClockSource::Synthetic, 8000);
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1)));
        sync.install(ClockSource::External(clock));
        assert!(sync.is_synced());
        assert_eq!(sync.mode(), ClockMode::External);

        sync.install(ClockSource::Synthetic);
        assert!(!sync.is_synced());
        assert_eq!(sync.stats().observations, 0);
    }
}
