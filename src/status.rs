//! Periodic progress reports during the stabilization phase.

use serde::Serialize;
use std::fmt;
use tracing::info;

/// A point-in-time view of the running benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Status {
    /// Successful operations per second over the last second.
    pub operations_per_sec: f64,
    /// Fraction of recent operations that finished within the delay limit.
    pub compliance_ratio: f64,
    /// Workers the pool is configured to run.
    pub worker_count: usize,
    /// Worker loops that are actually alive.
    pub thread_count: usize,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1} ops/s, {:.3} on time, {} workers ({} live)",
            self.operations_per_sec, self.compliance_ratio, self.worker_count, self.thread_count
        )
    }
}

/// Receives a [`Status`] about once per second while statistics are being collected.
///
/// Any `Fn(&Status) + Send + Sync` closure is a reporter.
pub trait StatusReporter: Send + Sync {
    /// Handle one status update. Called from the control task, so it should not block.
    fn report(&self, status: &Status);
}

impl<F> StatusReporter for F
where
    F: Fn(&Status) + Send + Sync,
{
    fn report(&self, status: &Status) {
        self(status)
    }
}

/// Logs every status update at `info` level. Used unless another reporter is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn report(&self, status: &Status) {
        info!(
            ops_per_sec = status.operations_per_sec,
            compliance = status.compliance_ratio,
            workers = status.worker_count,
            threads = status.thread_count,
            "benchmark status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn status() -> Status {
        Status {
            operations_per_sec: 1234.56,
            compliance_ratio: 0.987,
            worker_count: 12,
            thread_count: 13,
        }
    }

    #[test]
    fn closures_are_reporters() {
        let seen = Mutex::new(Vec::new());
        let reporter = |s: &Status| seen.lock().push(s.worker_count);
        let reporter: &dyn StatusReporter = &reporter;
        reporter.report(&status());
        reporter.report(&status());
        assert_eq!(*seen.lock(), vec![12, 12]);
    }

    #[test]
    fn display() {
        assert_eq!(
            status().to_string(),
            "1234.6 ops/s, 0.987 on time, 12 workers (13 live)"
        );
    }

    #[test]
    fn tracing_reporter_does_not_need_a_subscriber() {
        TracingReporter.report(&status());
    }
}
