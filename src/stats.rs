//! Descriptive latency statistics for the final report.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Percentiles included in every [`Statistics`] snapshot.
pub const REPORTED_PERCENTILES: [f64; 6] = [50.0, 75.0, 90.0, 95.0, 99.0, 99.9];

// 1µs to 1h at three significant digits
const LOWEST_MICROS: u64 = 1;
const HIGHEST_MICROS: u64 = 3_600_000_000;
const SIGFIG: u8 = 3;

fn micros_to_millis(micros: f64) -> f64 {
    micros / 1000.0
}

/// One entry of the reported latency distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileValue {
    /// Percentile in `(0, 100]`.
    pub percentile: f64,
    /// Latency at that percentile, in milliseconds.
    pub latency_ms: f64,
}

/// Immutable snapshot of the latencies observed during the stabilization phase.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    /// Number of successful operations.
    pub count: u64,
    /// Mean latency in milliseconds.
    pub mean_ms: f64,
    /// Standard deviation of the latency in milliseconds.
    pub stddev_ms: f64,
    /// Fastest operation in milliseconds.
    pub min_ms: f64,
    /// Slowest operation in milliseconds.
    pub max_ms: f64,
    /// Fraction of operations that finished within the delay limit.
    pub compliance_ratio: f64,
    /// Latency at each of the [`REPORTED_PERCENTILES`].
    pub percentiles: Vec<PercentileValue>,
    #[serde(skip)]
    histogram: Histogram<u64>,
}

impl Statistics {
    /// Latency below which `percentile` percent of operations finished.
    pub fn latency_at(&self, percentile: f64) -> Duration {
        Duration::from_micros(self.histogram.value_at_percentile(percentile))
    }

    /// Mean latency.
    pub fn mean(&self) -> Duration {
        Duration::from_secs_f64(self.mean_ms.max(0.0) / 1000.0)
    }

    /// True if no operation completed during the measurement.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "operations: {}", self.count)?;
        writeln!(f, "on time:    {:.3}", self.compliance_ratio)?;
        writeln!(
            f,
            "latency:    mean {:.2}ms, stddev {:.2}ms, min {:.2}ms, max {:.2}ms",
            self.mean_ms, self.stddev_ms, self.min_ms, self.max_ms
        )?;
        for p in &self.percentiles {
            writeln!(f, "  p{:<5} {:.2}ms", p.percentile, p.latency_ms)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Accumulated {
    histogram: Histogram<u64>,
    on_time: u64,
}

/// Accumulates latencies into a histogram until a [`Statistics`] snapshot is taken.
///
/// Safe to share between workers.
#[derive(Debug)]
pub struct StatisticsCalculator {
    delay_limit: Duration,
    inner: Mutex<Accumulated>,
}

impl StatisticsCalculator {
    /// Start an empty calculator. `delay_limit` decides which samples count as on time.
    pub fn new(delay_limit: Duration) -> Self {
        let histogram = Histogram::new_with_bounds(LOWEST_MICROS, HIGHEST_MICROS, SIGFIG)
            .expect("histogram bounds are valid");
        Self {
            delay_limit,
            inner: Mutex::new(Accumulated {
                histogram,
                on_time: 0,
            }),
        }
    }

    /// Add one latency. Values beyond an hour are clamped.
    pub fn append(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::max_value());
        let mut inner = self.inner.lock();
        inner.histogram.saturating_record(micros.max(LOWEST_MICROS));
        if latency <= self.delay_limit {
            inner.on_time += 1;
        }
    }

    /// Number of latencies added so far.
    pub fn count(&self) -> u64 {
        self.inner.lock().histogram.len()
    }

    /// Snapshot everything added so far.
    pub fn calculate(&self) -> Statistics {
        let inner = self.inner.lock();
        let histogram = inner.histogram.clone();
        let count = histogram.len();
        let compliance_ratio = if count == 0 {
            0.0
        } else {
            inner.on_time as f64 / count as f64
        };

        let percentiles = REPORTED_PERCENTILES
            .iter()
            .map(|&percentile| PercentileValue {
                percentile,
                latency_ms: micros_to_millis(histogram.value_at_percentile(percentile) as f64),
            })
            .collect();

        Statistics {
            count,
            mean_ms: micros_to_millis(histogram.mean()),
            stddev_ms: micros_to_millis(histogram.stdev()),
            min_ms: micros_to_millis(histogram.min() as f64),
            max_ms: micros_to_millis(histogram.max() as f64),
            compliance_ratio,
            percentiles,
            histogram,
        }
    }
}
