use std::time::{Duration, Instant};

/// Configuration for a [`RatioMeter`] window.
#[derive(Debug, Clone, Copy)]
pub struct MeterOptions {
    /// Number of buckets in the sliding window.
    pub buckets: usize,
    /// Width of a single bucket.
    pub resolution: Duration,
    /// Samples required in the live window before the rating is trusted.
    pub min_samples: u64,
}

impl Default for MeterOptions {
    fn default() -> Self {
        Self {
            buckets: 10,
            resolution: Duration::from_secs(1),
            min_samples: 10,
        }
    }
}

/// Sliding-window success-ratio estimator for one backend.
///
/// Observations land in a ring of time buckets; the rating is the share of
/// favorable outcomes over the buckets still inside the window. Until the
/// window holds `min_samples` observations the meter reports not-ready and
/// its rating must not drive decisions.
#[derive(Debug)]
pub struct RatioMeter {
    buckets: Vec<Bucket>,
    resolution: Duration,
    min_samples: u64,
    epoch: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    tick: u64,
    good: u64,
    bad: u64,
}

impl RatioMeter {
    pub fn new(options: MeterOptions) -> Self {
        Self {
            buckets: vec![Bucket::default(); options.buckets.max(1)],
            resolution: options.resolution,
            min_samples: options.min_samples,
            epoch: Instant::now(),
        }
    }

    /// Record one observation.
    pub fn record(&mut self, favorable: bool) {
        self.record_at(favorable, Instant::now());
    }

    /// Share of favorable outcomes over the live window. With no samples the
    /// meter reports a perfect score; [`RatioMeter::is_ready`] gates use.
    pub fn rating(&self) -> f64 {
        self.rating_at(Instant::now())
    }

    /// Whether enough samples are in the window to trust the rating.
    pub fn is_ready(&self) -> bool {
        self.total_at(Instant::now()) >= self.min_samples
    }

    /// Total observations currently inside the window.
    pub fn total(&self) -> u64 {
        self.total_at(Instant::now())
    }

    fn tick_of(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch);
        (elapsed.as_nanos() / self.resolution.as_nanos().max(1)) as u64
    }

    fn record_at(&mut self, favorable: bool, now: Instant) {
        let tick = self.tick_of(now);
        let len = self.buckets.len() as u64;
        let bucket = &mut self.buckets[(tick % len) as usize];
        if bucket.tick != tick {
            // The ring wrapped past this slot; it belongs to the new tick now.
            *bucket = Bucket {
                tick,
                good: 0,
                bad: 0,
            };
        }
        if favorable {
            bucket.good += 1;
        } else {
            bucket.bad += 1;
        }
    }

    fn totals_at(&self, now: Instant) -> (u64, u64) {
        let tick = self.tick_of(now);
        let len = self.buckets.len() as u64;
        let oldest = tick.saturating_sub(len - 1);
        let mut good = 0;
        let mut bad = 0;
        for bucket in &self.buckets {
            if bucket.tick >= oldest && bucket.tick <= tick {
                good += bucket.good;
                bad += bucket.bad;
            }
        }
        (good, bad)
    }

    fn total_at(&self, now: Instant) -> u64 {
        let (good, bad) = self.totals_at(now);
        good + bad
    }

    fn rating_at(&self, now: Instant) -> f64 {
        let (good, bad) = self.totals_at(now);
        if good + bad == 0 {
            return 1.0;
        }
        good as f64 / (good + bad) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meter() -> RatioMeter {
        RatioMeter::new(MeterOptions {
            buckets: 10,
            resolution: Duration::from_secs(1),
            min_samples: 10,
        })
    }

    #[test]
    fn test_rating_is_favorable_share() {
        let mut meter = test_meter();
        for _ in 0..8 {
            meter.record(true);
        }
        for _ in 0..2 {
            meter.record(false);
        }
        assert!((meter.rating() - 0.8).abs() < f64::EPSILON);
        assert_eq!(meter.total(), 10);
    }

    #[test]
    fn test_not_ready_until_min_samples() {
        let mut meter = test_meter();
        for _ in 0..9 {
            meter.record(true);
        }
        assert!(!meter.is_ready());
        meter.record(true);
        assert!(meter.is_ready());
    }

    #[test]
    fn test_empty_meter_reports_perfect_rating() {
        let meter = test_meter();
        assert_eq!(meter.rating(), 1.0);
        assert!(!meter.is_ready());
    }

    #[test]
    fn test_samples_age_out_of_the_window() {
        let mut meter = test_meter();
        let start = meter.epoch;
        meter.record_at(false, start);
        meter.record_at(false, start);
        assert_eq!(meter.total_at(start), 2);

        // Eleven resolutions later the failures have left the window.
        let later = start + Duration::from_secs(11);
        assert_eq!(meter.total_at(later), 0);
        assert_eq!(meter.rating_at(later), 1.0);

        meter.record_at(true, later);
        assert_eq!(meter.total_at(later), 1);
        assert_eq!(meter.rating_at(later), 1.0);
    }

    #[test]
    fn test_window_mixes_recent_buckets_only() {
        let mut meter = test_meter();
        let start = meter.epoch;
        for i in 0..5 {
            meter.record_at(false, start + Duration::from_secs(i));
        }
        // Five seconds later the early failures are still inside the window.
        let mid = start + Duration::from_secs(5);
        for _ in 0..5 {
            meter.record_at(true, mid);
        }
        assert_eq!(meter.total_at(mid), 10);
        assert!((meter.rating_at(mid) - 0.5).abs() < f64::EPSILON);
    }
}
