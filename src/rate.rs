use serde::Serialize;
use std::time::{Duration, Instant};

/// Default interval between periodic rate emissions.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Computes an instantaneous bit rate from a cumulative byte count and the
/// elapsed wall-clock time.
///
/// Returns `0.0` when the elapsed time is zero (or effectively zero), so the
/// caller never has to guard against division by zero.
///
/// # Examples
///
/// ```
/// use netgauge::rate::bits_per_second;
/// use std::time::Duration;
///
/// assert_eq!(bits_per_second(1000, Duration::from_secs(1)), 8000.0);
/// assert_eq!(bits_per_second(1000, Duration::ZERO), 0.0);
/// ```
pub fn bits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 * 8.0) / secs
    } else {
        0.0
    }
}

/// A single throughput sample: cumulative bytes, elapsed time since the
/// measurement start, and the derived bit rate.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateSample {
    pub bytes: u64,
    pub elapsed: Duration,
    pub bits_per_second: f64,
}

/// Accumulates per-read/write byte counts for one direction and emits a
/// [`RateSample`] whenever at least the sampling interval has passed since
/// the previous emission.
///
/// The cadence is opportunistic: it is checked on every [`record`] call
/// rather than driven by a timer, so emission frequency is proportional to
/// I/O activity. The rate always covers the cumulative transfer since the
/// reporter was created.
///
/// [`record`]: RateReporter::record
///
/// # Examples
///
/// ```
/// use netgauge::rate::RateReporter;
/// use std::time::Duration;
///
/// let mut reporter = RateReporter::new(Duration::from_millis(250));
/// // Within the first interval nothing is emitted.
/// assert!(reporter.record(1024).is_none());
/// assert_eq!(reporter.total(), 1024);
/// ```
#[derive(Debug)]
pub struct RateReporter {
    start: Instant,
    last_emit: Instant,
    interval: Duration,
    total: u64,
}

impl RateReporter {
    /// Creates a reporter that starts counting now.
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_emit: now,
            interval,
            total: 0,
        }
    }

    /// Records `count` transferred bytes and returns a sample if the
    /// sampling interval has elapsed since the last emission.
    pub fn record(&mut self, count: u64) -> Option<RateSample> {
        self.total += count;
        if self.last_emit.elapsed() >= self.interval {
            self.last_emit = Instant::now();
            Some(self.sample())
        } else {
            None
        }
    }

    /// Returns a sample covering everything recorded so far.
    pub fn sample(&self) -> RateSample {
        let elapsed = self.start.elapsed();
        RateSample {
            bytes: self.total,
            elapsed,
            bits_per_second: bits_per_second(self.total, elapsed),
        }
    }

    /// Total bytes recorded since creation.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Elapsed time since the reporter was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
