//! Decides, under sampling noise, whether the current worker count meets the objective.

use crate::error::Result;
use crate::signal::StopSignal;
use crate::tracker::ComplianceSignal;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Samples the compliance ratio over time and renders a verdict.
///
/// A verdict needs `samples_required` ratios taken `wait_time` apart. If they are all above the
/// threshold and never decrease, the worker count complies. If they are not all above the
/// threshold and never increase, it does not. Anything else is ambiguous: the newest ratio is
/// kept, the interval is multiplied by `samples_required`, and sampling continues. If the
/// coarser samples are still ambiguous, the verdict is a single instantaneous comparison.
pub struct ComplianceOracle {
    signal: Arc<dyn ComplianceSignal>,
    samples_required: usize,
    threshold: f64,
    stop: StopSignal,
}

impl fmt::Debug for ComplianceOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplianceOracle")
            .field("samples_required", &self.samples_required)
            .field("threshold", &self.threshold)
            .field("stop", &self.stop)
            .finish()
    }
}

impl ComplianceOracle {
    /// Build an oracle over `signal`. Every sleep races `stop`.
    pub fn new(
        signal: Arc<dyn ComplianceSignal>,
        samples_required: usize,
        threshold: f64,
        stop: StopSignal,
    ) -> Self {
        Self {
            signal,
            samples_required: samples_required.max(1),
            threshold,
            stop,
        }
    }

    /// Whether the system currently complies, sampling every `wait_time` to start with.
    ///
    /// Fails with [`Cancelled`](crate::BenchmarkError::Cancelled) if a stop is requested while
    /// waiting.
    pub async fn is_complying(&self, wait_time: Duration) -> Result<bool> {
        let samples = self.samples_required;
        let mut wait_time = wait_time;
        let mut coarsened = false;
        let mut ratios = Vec::with_capacity(samples);

        loop {
            trace!(?wait_time, "compliance check, waiting");
            self.stop.sleep(wait_time).await?;

            let ratio = self.signal.compliance_ratio();
            trace!(ratio, "current compliance ratio");
            ratios.push(ratio);
            if ratios.len() < samples {
                continue;
            }

            let complies = ratios.iter().all(|&r| r > self.threshold);
            let increasing = is_increasing(ratios.iter().copied());
            let decreasing = is_increasing(ratios.iter().map(|r| -r));
            debug!(
                samples,
                complies, increasing, decreasing, "collected compliance ratios"
            );

            if complies && increasing {
                return Ok(true);
            } else if !complies && decreasing {
                return Ok(false);
            } else if coarsened {
                break;
            }

            // ambiguous: take fewer, longer-spaced samples once
            let last = ratios[ratios.len() - 1];
            ratios.clear();
            ratios.push(last);
            let factor = u32::try_from(samples).unwrap_or(u32::max_value());
            wait_time = wait_time.checked_mul(factor).unwrap_or(Duration::MAX);
            coarsened = true;
        }

        let ratio = self.signal.compliance_ratio();
        trace!(ratio, "final compliance check on instant ratio");
        Ok(ratio > self.threshold)
    }
}

fn is_increasing(values: impl Iterator<Item = f64>) -> bool {
    let mut last = None;
    for value in values {
        if let Some(prev) = last {
            if value < prev {
                return false;
            }
        }
        last = Some(value);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BenchmarkError;
    use crate::signal::stop_channel;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Plays back a fixed sequence of ratios, repeating the last one forever.
    struct Scripted {
        ratios: Mutex<VecDeque<f64>>,
        reads: AtomicUsize,
    }

    impl Scripted {
        fn new(ratios: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                ratios: Mutex::new(ratios.iter().copied().collect()),
                reads: AtomicUsize::new(0),
            })
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl ComplianceSignal for Scripted {
        fn compliance_ratio(&self) -> f64 {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut ratios = self.ratios.lock();
            if ratios.len() > 1 {
                ratios.pop_front().unwrap()
            } else {
                ratios[0]
            }
        }
    }

    fn oracle(signal: &Arc<Scripted>) -> ComplianceOracle {
        ComplianceOracle::new(signal.clone(), 3, 0.95, StopSignal::never())
    }

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn increasing_above_threshold_complies() {
        let signal = Scripted::new(&[0.96, 0.97, 0.99]);
        let start = Instant::now();
        assert!(oracle(&signal).is_complying(WAIT).await.unwrap());
        assert_eq!(signal.reads(), 3);
        assert_eq!(start.elapsed(), 3 * WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn decreasing_below_threshold_does_not_comply() {
        let signal = Scripted::new(&[0.9, 0.8, 0.5]);
        assert!(!oracle(&signal).is_complying(WAIT).await.unwrap());
        assert_eq!(signal.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flat_at_threshold_does_not_comply() {
        // not strictly above the threshold, and trivially non-increasing
        let signal = Scripted::new(&[0.95]);
        assert!(!oracle(&signal).is_complying(WAIT).await.unwrap());
        assert_eq!(signal.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flat_perfect_complies() {
        let signal = Scripted::new(&[1.0]);
        assert!(oracle(&signal).is_complying(WAIT).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_coarsens_then_decides() {
        // first round oscillates, coarse round is cleanly improving
        let signal = Scripted::new(&[0.96, 0.94, 0.96, 0.97, 0.98]);
        let start = Instant::now();
        assert!(oracle(&signal).is_complying(WAIT).await.unwrap());
        assert_eq!(signal.reads(), 5);
        // three base waits, then two waits three times as long
        assert_eq!(start.elapsed(), 3 * WAIT + 2 * 3 * WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn still_ambiguous_falls_back_to_instant_ratio() {
        let signal = Scripted::new(&[0.96, 0.94, 0.96, 0.97, 0.90, 0.99]);
        let start = Instant::now();
        assert!(oracle(&signal).is_complying(WAIT).await.unwrap());
        assert_eq!(signal.reads(), 6);
        assert_eq!(start.elapsed(), 3 * WAIT + 2 * 3 * WAIT);

        let signal = Scripted::new(&[0.96, 0.94, 0.96, 0.97, 0.90, 0.5]);
        assert!(!oracle(&signal).is_complying(WAIT).await.unwrap());
        assert_eq!(signal.reads(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn single_sample_always_decides() {
        let signal = Scripted::new(&[0.5]);
        let oracle = ComplianceOracle::new(signal.clone(), 1, 0.95, StopSignal::never());
        assert!(!oracle.is_complying(WAIT).await.unwrap());
        assert_eq!(signal.reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_promptly() {
        let signal = Scripted::new(&[0.96, 0.94]);
        let (trigger, stop) = stop_channel();
        let oracle = ComplianceOracle::new(signal.clone(), 3, 0.95, stop);

        let start = Instant::now();
        let check = tokio::spawn(async move { oracle.is_complying(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();

        let result = check.await.unwrap();
        assert!(matches!(result, Err(BenchmarkError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(signal.reads(), 0);
    }

    #[test]
    fn monotonicity() {
        assert!(is_increasing([0.1, 0.1, 0.2].iter().copied()));
        assert!(!is_increasing([0.2, 0.1].iter().copied()));
        assert!(is_increasing(std::iter::empty()));
        assert!(is_increasing([0.3, 0.2, 0.2].iter().map(|r: &f64| -r)));
    }
}
