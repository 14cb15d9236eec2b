//! Frame pacing for session threads that play or discard silence.

use std::time::{Duration, Instant};

/// Sleeps a caller to a steady frame cadence.
///
/// Used whenever a session cannot move real audio (no pipeline, clock not
/// synced, reload in progress) so the call core keeps its normal rhythm
/// instead of spinning.
#[derive(Debug, Default)]
pub struct Pacer {
    next: Option<Instant>,
}

impl Pacer {
    /// Creates an idle pacer; the first tick returns immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the next deadline and schedules the one after it.
    ///
    /// A caller more than one interval late is resynchronized to now
    /// rather than allowed to burst.
    pub fn tick(&mut self, interval: Duration) {
        let now = Instant::now();
        let deadline = match self.next {
            Some(next) if next + interval >= now => next,
            _ => now,
        };
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.next = Some(deadline + interval);
    }

    /// Forgets the schedule. Called when real audio moves again.
    pub fn reset(&mut self) {
        self.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_tick_is_immediate() {
        let mut pacer = Pacer::new();
        let start = Instant::now();
        pacer.tick(Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_ticks_keep_cadence() {
        let mut pacer = Pacer::new();
        let start = Instant::now();
        for _ in 0..4 {
            pacer.tick(Duration::from_millis(10));
        }
        // Three full intervals after the immediate first tick
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_late_caller_is_resynced() {
        let mut pacer = Pacer::new();
        pacer.tick(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        pacer.tick(Duration::from_millis(5));
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn test_reset() {
        let mut pacer = Pacer::new();
        pacer.tick(Duration::from_millis(500));
        pacer.reset();
        let start = Instant::now();
        pacer.tick(Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(250));
    }
}
