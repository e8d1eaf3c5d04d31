//! Timing-driven load balancing.
//!
//! Each worker accumulates the wall time it spends in coefficient and
//! force work; the per-worker timings are all-reduced and turned into
//! relative processing rates (faster worker, larger rate). Repartitioning
//! only fires when some worker's rate has drifted past a relative
//! threshold, so a steady cluster never thrashes.

use std::time::Instant;

/// Cumulative wall timer for the force-work section.
#[derive(Debug, Default)]
pub struct WorkTimer {
    start: Option<Instant>,
    accum: f64,
}

impl WorkTimer {
    /// Start (or restart) the current interval.
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
    }

    /// Close the current interval and fold it into the total.
    pub fn stop(&mut self) {
        if let Some(t0) = self.start.take() {
            self.accum += t0.elapsed().as_secs_f64();
        }
    }

    /// Total accumulated seconds.
    pub fn seconds(&self) -> f64 {
        self.accum
    }

    /// Clear the total for the next balancing window.
    pub fn reset(&mut self) {
        self.start = None;
        self.accum = 0.0;
    }
}

/// Derive normalized processing rates from per-worker timings: rate is
/// proportional to inverse time. A worker that reported no time is treated
/// as no faster than the fastest one that did.
pub fn derive_rates(timings: &[f64]) -> Vec<f64> {
    let floor = timings
        .iter()
        .copied()
        .filter(|&t| t > 0.0)
        .fold(f64::INFINITY, f64::min);
    let floor = if floor.is_finite() { floor } else { 1.0 };

    let inv: Vec<f64> = timings.iter().map(|&t| 1.0 / t.max(floor)).collect();
    let sum: f64 = inv.iter().sum();
    inv.into_iter().map(|r| r / sum).collect()
}

/// True when any worker's new rate deviates from its old one by more than
/// `thresh`, relative to the old rate.
pub fn needs_rebalance(old: &[f64], new: &[f64], thresh: f64) -> bool {
    old.iter()
        .zip(new.iter())
        .any(|(&o, &n)| o > 0.0 && ((o - n) / o).abs() > thresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_timings_give_equal_rates() {
        let rates = derive_rates(&[1.0, 1.0, 1.0, 1.0]);
        for r in &rates {
            assert!((r - 0.25).abs() < 1e-15);
        }
    }

    #[test]
    fn slower_worker_gets_smaller_rate() {
        let rates = derive_rates(&[1.0, 3.0]);
        assert!((rates[0] - 0.75).abs() < 1e-15);
        assert!((rates[1] - 0.25).abs() < 1e-15);
        assert!((rates.iter().sum::<f64>() - 1.0).abs() < 1e-15);
    }

    #[test]
    fn zero_timing_is_clamped_not_infinite() {
        // A worker that reported no time is clamped to the fastest one that
        // did: both end up with the same rate, never an infinite one.
        let rates = derive_rates(&[0.0, 2.0]);
        assert!(rates.iter().all(|r| r.is_finite()));
        assert!((rates[0] - 0.5).abs() < 1e-15);
        assert!((rates[1] - 0.5).abs() < 1e-15);
    }

    #[test]
    fn all_zero_timings_fall_back_to_equal_rates() {
        let rates = derive_rates(&[0.0, 0.0, 0.0]);
        assert!(rates.iter().all(|r| r.is_finite()));
        for r in &rates {
            assert!((r - 1.0 / 3.0).abs() < 1e-15);
        }
    }

    #[test]
    fn hysteresis_holds_under_threshold() {
        let old = [0.25, 0.25, 0.25, 0.25];
        let near = [0.26, 0.24, 0.25, 0.25];
        assert!(!needs_rebalance(&old, &near, 0.05));
        let far = [0.30, 0.20, 0.25, 0.25];
        assert!(needs_rebalance(&old, &far, 0.05));
    }

    #[test]
    fn timer_accumulates_across_intervals() {
        let mut t = WorkTimer::default();
        t.start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        t.stop();
        let first = t.seconds();
        assert!(first > 0.0);
        t.start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        t.stop();
        assert!(t.seconds() > first);
        t.reset();
        assert_eq!(t.seconds(), 0.0);
    }
}
