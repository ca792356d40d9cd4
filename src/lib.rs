//! Find the concurrency at which a system stops meeting its latency objective.
//!
//! Say you have an operation you can run repeatedly (a request to a server, a query against a
//! database, a call into a library), and an objective of the form "P percent of operations must
//! finish within D milliseconds". How many concurrent callers can the system sustain before that
//! objective no longer holds?
//!
//! This crate finds out by searching over the number of workers, each of which runs the operation
//! in a closed loop. First, the worker count is multiplied until the objective is violated. That
//! gives a bracket: the last count that kept up and the first one that did not. Then a binary
//! search narrows the bracket down to a configurable width. Finally, a fine-tuning pass walks the
//! count down to something compliant and then back up in shrinking steps until it lands on the
//! largest compliant count. The system is then held at that count for a while to collect latency
//! statistics for the report.
//!
//! Whether a given worker count "complies" is decided by a [`ComplianceOracle`], which samples
//! the on-time ratio a few times and only trusts a verdict when the samples trend in a consistent
//! direction. See its documentation for the details.
//!
//! The search phases are plain iterators that implement [`CliffSearch`], so they can also be
//! driven by hand, without any of the timing machinery:
//!
//! ```rust
//! use slocliff::{BinarySearcher, ExponentialRamp, FineTuner};
//!
//! // Pretend the system keeps up with at most 50 workers.
//! let complies = |workers: usize| workers <= 50;
//!
//! let mut ramp = ExponentialRamp::new(10, 2);
//! while let Some(workers) = ramp.next() {
//!     if !complies(workers) {
//!         ramp.overloaded();
//!     }
//! }
//! // 10, 20, and 40 kept up, 80 did not.
//! assert_eq!(ramp.estimate(), 40..80);
//!
//! let mut search = BinarySearcher::new(ramp.estimate(), 10);
//! while let Some(workers) = search.next() {
//!     if !complies(workers) {
//!         search.overloaded();
//!     }
//! }
//! assert_eq!(search.estimate(), 50..60);
//!
//! let mut tune = FineTuner::new(search.estimate().start, 4);
//! while let Some(workers) = tune.next() {
//!     if !complies(workers) {
//!         tune.overloaded();
//!     }
//! }
//! assert_eq!(tune.estimate().start, 50);
//! ```
//!
//! To benchmark a real system, implement [`BenchmarkAction`] and hand it to a [`Benchmark`]:
//!
//! ```rust,no_run
//! use slocliff::{ActionError, Benchmark, BenchmarkAction, BenchmarkConfig};
//! use std::sync::Arc;
//!
//! struct Ping;
//!
//! #[async_trait::async_trait]
//! impl BenchmarkAction for Ping {
//!     async fn execute(&self, _worker: usize) -> Result<(), ActionError> {
//!         tokio::time::sleep(std::time::Duration::from_millis(5)).await;
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> slocliff::Result<()> {
//! let benchmark = Benchmark::new(BenchmarkConfig::default(), Arc::new(Ping))?;
//! let report = benchmark.start()?.join().await?;
//! println!("{} workers\n{}", report.worker_count, report.statistics);
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod action;
mod benchmark;
mod binary;
mod config;
mod error;
mod exponential;
mod fine_tune;
mod oracle;
mod pool;
mod signal;
mod stats;
mod status;
mod tracker;

pub use crate::action::BenchmarkAction;
pub use crate::benchmark::{Benchmark, BenchmarkReport, RunHandle, RunState};
pub use crate::binary::BinarySearcher;
pub use crate::config::{
    BenchmarkConfig, BinarySearchStepConfig, ExponentialStepConfig, FineTuneStepConfig,
    StableStatsStepConfig,
};
pub use crate::error::{ActionError, BenchmarkError, Result};
pub use crate::exponential::ExponentialRamp;
pub use crate::fine_tune::FineTuner;
pub use crate::oracle::ComplianceOracle;
pub use crate::pool::{LatencyRecorder, WorkerPool};
pub use crate::signal::{stop_channel, StopSignal, StopTrigger};
pub use crate::stats::{PercentileValue, Statistics, StatisticsCalculator, REPORTED_PERCENTILES};
pub use crate::status::{Status, StatusReporter, TracingReporter};
pub use crate::tracker::{ComplianceSignal, ComplianceTracker};

/// A type that can drive one phase of the search for the largest compliant worker count.
///
/// Each call to [`Iterator::next`] yields the worker count to probe next. If the system did not
/// meet its objective at that count, call [`CliffSearch::overloaded`] before asking for the next
/// one. When the iterator returns `None`, the phase is over and
/// [`CliffSearch::estimate`] holds its result.
pub trait CliffSearch: Iterator<Item = usize> {
    /// Indicate that the system did not comply at the worker count last yielded by
    /// [`Iterator::next`].
    fn overloaded(&mut self);

    /// Give the current estimate of the largest compliant worker count.
    ///
    /// The largest compliant count lies in `start..end`, with `start` known to comply. Each
    /// implementation documents how it treats the edges.
    fn estimate(&self) -> core::ops::Range<usize>;

    /// Report the throughput, in operations per second, that was measured at the worker count
    /// last yielded.
    ///
    /// Implementations may use it to pick a better next probe. The default ignores it.
    fn observe_throughput(&mut self, _ops_per_sec: f64) {}
}
