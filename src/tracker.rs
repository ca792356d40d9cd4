//! Rolling latency history used to decide compliance.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Something that can report the current on-time ratio.
///
/// [`ComplianceTracker`] is the real implementation; tests substitute scripted sequences.
pub trait ComplianceSignal: Send + Sync {
    /// Fraction in `[0, 1]` of recent operations that finished within the delay limit.
    fn compliance_ratio(&self) -> f64;
}

/// Keeps the most recent latencies and reports which fraction of them were on time.
///
/// The history only makes sense for a single worker count, so the driver calls
/// [`reset`](ComplianceTracker::reset) after every resize.
#[derive(Debug)]
pub struct ComplianceTracker {
    delay_limit: Duration,
    capacity: usize,
    history: Mutex<VecDeque<Duration>>,
}

impl ComplianceTracker {
    /// Track up to `capacity` latencies, counting those at or under `delay_limit` as on time.
    pub fn new(delay_limit: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            delay_limit,
            capacity,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record one completed operation, evicting the oldest one if the history is full.
    pub fn append(&self, latency: Duration) {
        let mut history = self.history.lock();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(latency);
    }

    /// Forget everything recorded so far.
    pub fn reset(&self) {
        self.history.lock().clear();
    }

    /// Number of latencies currently in the history.
    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    /// True if nothing has been recorded since the last reset.
    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    /// The latency at or under which an operation counts as on time.
    pub fn delay_limit(&self) -> Duration {
        self.delay_limit
    }

    /// Fraction of the history that was on time. An empty history is not compliant, so this is
    /// zero until the first sample arrives.
    pub fn compliance_ratio(&self) -> f64 {
        let history = self.history.lock();
        if history.is_empty() {
            return 0.0;
        }
        let on_time = history.iter().filter(|&&l| l <= self.delay_limit).count();
        on_time as f64 / history.len() as f64
    }
}

impl ComplianceSignal for ComplianceTracker {
    fn compliance_ratio(&self) -> f64 {
        ComplianceTracker::compliance_ratio(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn empty_is_not_compliant() {
        let tracker = ComplianceTracker::new(ms(100), 10);
        assert!(tracker.is_empty());
        assert_eq!(tracker.compliance_ratio(), 0.0);
    }

    #[test]
    fn limit_is_inclusive() {
        let tracker = ComplianceTracker::new(ms(100), 10);
        tracker.append(ms(100));
        tracker.append(ms(101));
        tracker.append(ms(5));
        tracker.append(ms(250));
        assert_eq!(tracker.compliance_ratio(), 0.5);
    }

    #[test]
    fn history_rolls_over() {
        let tracker = ComplianceTracker::new(ms(100), 4);
        for _ in 0..4 {
            tracker.append(ms(500));
        }
        assert_eq!(tracker.compliance_ratio(), 0.0);

        tracker.append(ms(1));
        tracker.append(ms(1));
        assert_eq!(tracker.len(), 4);
        assert_eq!(tracker.compliance_ratio(), 0.5);
    }

    #[test]
    fn reset_discards_history() {
        let tracker = ComplianceTracker::new(ms(100), 10);
        tracker.append(ms(500));
        tracker.reset();
        assert!(tracker.is_empty());

        tracker.append(ms(50));
        assert_eq!(tracker.compliance_ratio(), 1.0);
    }

    #[test]
    fn concurrent_appends() {
        let tracker = Arc::new(ComplianceTracker::new(ms(100), 100_000));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        tracker.append(ms(if i % 2 == 0 { 10 } else { 200 }));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.len(), 40_000);
        assert_eq!(tracker.compliance_ratio(), 0.5);
    }
}
