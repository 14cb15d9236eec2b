//! Least-squares clock slaving filter.

use std::collections::VecDeque;
use std::time::Duration;

/// Number of observations kept in the sliding window.
pub const WINDOW: usize = 32;

/// Observations needed before a fit is attempted.
pub const MIN_OBSERVATIONS: usize = 4;

/// Linear mapping from internal time to external time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockFit {
    /// External nanoseconds per internal nanosecond.
    pub slope: f64,
    /// External time at internal time zero, in nanoseconds.
    pub intercept_ns: f64,
    /// Coefficient of determination of the fit.
    pub r_squared: f64,
}

impl ClockFit {
    /// The fit that maps every time onto itself.
    pub const IDENTITY: Self = Self {
        slope: 1.0,
        intercept_ns: 0.0,
        r_squared: 1.0,
    };

    /// Maps an internal time onto the external timeline.
    #[must_use]
    pub fn apply(&self, internal: Duration) -> Duration {
        let ns = self.slope * internal.as_nanos() as f64 + self.intercept_ns;
        Duration::from_nanos(ns.max(0.0) as u64)
    }
}

/// Sliding-window linear regression over (internal, external) observations.
#[derive(Debug, Clone)]
pub struct Regression {
    samples: VecDeque<(u64, u64)>,
    window: usize,
}

impl Default for Regression {
    fn default() -> Self {
        Self::new(WINDOW)
    }
}

impl Regression {
    /// Creates a filter keeping the last `window` observations.
    pub fn new(window: usize) -> Self {
        let window = window.max(MIN_OBSERVATIONS);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Adds an observation and returns the new fit, if it is usable.
    pub fn add(&mut self, internal: Duration, external: Duration) -> Option<ClockFit> {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples
            .push_back((internal.as_nanos() as u64, external.as_nanos() as u64));
        self.fit()
    }

    /// Number of observations currently in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if no observations are stored.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drops all observations.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Fits the current window.
    ///
    /// Returns `None` for degenerate input: too few points, constant internal
    /// times, or a slope that is not a positive finite number.
    pub fn fit(&self) -> Option<ClockFit> {
        if self.samples.len() < MIN_OBSERVATIONS {
            return None;
        }

        // Work relative to the first point to keep the sums small.
        let (x0, y0) = self.samples[0];
        let n = self.samples.len() as f64;
        let points = || {
            self.samples
                .iter()
                .map(move |&(x, y)| (x as f64 - x0 as f64, y as f64 - y0 as f64))
        };

        let (sum_x, sum_y) = points().fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
        let mean_x = sum_x / n;
        let mean_y = sum_y / n;

        let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
        for (x, y) in points() {
            let dx = x - mean_x;
            let dy = y - mean_y;
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
        }

        if sxx <= f64::EPSILON {
            return None;
        }
        let slope = sxy / sxx;
        if !slope.is_finite() || slope <= 0.0 {
            return None;
        }

        let intercept_ns = (mean_y + y0 as f64) - slope * (mean_x + x0 as f64);
        let r_squared = if syy > 0.0 {
            (sxy * sxy) / (sxx * syy)
        } else {
            0.0
        };

        Some(ClockFit {
            slope,
            intercept_ns,
            r_squared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_needs_min_observations() {
        let mut reg = Regression::default();
        for i in 0..(MIN_OBSERVATIONS as u64 - 1) {
            assert!(reg.add(ms(i * 100), ms(5000 + i * 100)).is_none());
        }
        assert!(reg.add(ms(300), ms(5300)).is_some());
    }

    #[test]
    fn test_fits_offset_line() {
        let mut reg = Regression::default();
        let mut fit = None;
        for i in 0..10u64 {
            fit = reg.add(ms(i * 100), ms(7000 + i * 100));
        }
        let fit = fit.unwrap();
        assert!((fit.slope - 1.0).abs() < 1e-9);
        assert!((fit.intercept_ns - 7e9).abs() < 1.0);
        assert!(fit.r_squared > 0.999);
        assert_eq!(fit.apply(ms(2000)), ms(9000));
    }

    #[test]
    fn test_constant_external_is_degenerate() {
        let mut reg = Regression::default();
        for i in 0..8u64 {
            assert!(reg.add(ms(i * 100), ms(1000)).is_none());
        }
    }

    #[test]
    fn test_constant_internal_is_degenerate() {
        let mut reg = Regression::default();
        for i in 0..8u64 {
            assert!(reg.add(ms(100), ms(1000 + i)).is_none());
        }
    }

    #[test]
    fn test_window_slides() {
        let mut reg = Regression::new(8);
        for i in 0..20u64 {
            reg.add(ms(i * 10), ms(i * 10));
        }
        assert_eq!(reg.len(), 8);
        reg.clear();
        assert!(reg.is_empty());
    }
}
