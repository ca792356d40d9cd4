//! The search driver: ramp, bisect, fine-tune, then measure.

use crate::action::BenchmarkAction;
use crate::binary::BinarySearcher;
use crate::config::BenchmarkConfig;
use crate::error::{BenchmarkError, Result};
use crate::exponential::ExponentialRamp;
use crate::fine_tune::FineTuner;
use crate::oracle::ComplianceOracle;
use crate::pool::{LatencyRecorder, WorkerPool};
use crate::signal::{stop_channel, StopSignal, StopTrigger};
use crate::stats::{Statistics, StatisticsCalculator};
use crate::status::{Status, StatusReporter, TracingReporter};
use crate::tracker::ComplianceTracker;
use crate::CliffSearch;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Where a [`Benchmark`] is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// Not started yet.
    Idle,
    /// The control task is searching or measuring.
    Running,
    /// The run produced a [`BenchmarkReport`].
    Completed,
    /// The control task failed before producing a report.
    Failed,
    /// The run was stopped before producing a report.
    Cancelled,
}

/// The outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    /// The largest worker count found to meet the objective.
    pub worker_count: usize,
    /// Latencies measured while holding `worker_count` workers.
    pub statistics: Statistics,
}

/// A single benchmark run against one action.
///
/// A `Benchmark` can be started once. The search runs on its own Tokio task; use the returned
/// [`RunHandle`] to wait for the report, and [`Benchmark::stop`] to cut the run short.
pub struct Benchmark {
    config: Arc<BenchmarkConfig>,
    action: Arc<dyn BenchmarkAction>,
    reporter: Arc<dyn StatusReporter>,
    state: Arc<Mutex<RunState>>,
    trigger: Mutex<Option<StopTrigger>>,
}

impl fmt::Debug for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Benchmark")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl Benchmark {
    /// Prepare a run of `action` under `config`.
    ///
    /// Fails if the configuration does not validate.
    pub fn new(config: BenchmarkConfig, action: Arc<dyn BenchmarkAction>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            action,
            reporter: Arc::new(TracingReporter),
            state: Arc::new(Mutex::new(RunState::Idle)),
            trigger: Mutex::new(None),
        })
    }

    /// Send status updates during the final measurement to `reporter` instead of the log.
    pub fn with_reporter(mut self, reporter: impl StatusReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// The configuration this benchmark runs with.
    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Start the run on a new Tokio task.
    ///
    /// Must be called from within a Tokio runtime. Fails with
    /// [`AlreadyStarted`](BenchmarkError::AlreadyStarted) if the benchmark was started before.
    pub fn start(&self) -> Result<RunHandle> {
        let mut trigger = self.trigger.lock();
        if trigger.is_some() {
            return Err(BenchmarkError::AlreadyStarted);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BenchmarkError::Failed(format!("no Tokio runtime to run on: {}", e)))?;

        let (stop_trigger, stop) = stop_channel();
        let driver = SearchDriver::new(
            Arc::clone(&self.config),
            Arc::clone(&self.action),
            Arc::clone(&self.reporter),
            stop,
        );

        *self.state.lock() = RunState::Running;
        let task = runtime.spawn(control(driver, Arc::clone(&self.state)));
        *trigger = Some(stop_trigger);
        info!(
            delay_limit_ms = self.config.delay_limit_millis,
            threshold = self.config.percentile_threshold,
            "benchmark started"
        );

        Ok(RunHandle {
            task,
            state: Arc::clone(&self.state),
        })
    }

    /// Ask a running benchmark to stop. Its handle then resolves to
    /// [`Cancelled`](BenchmarkError::Cancelled), unless it had already finished.
    ///
    /// Fails with [`NotStarted`](BenchmarkError::NotStarted) if the benchmark was never started.
    pub fn stop(&self) -> Result<()> {
        match &*self.trigger.lock() {
            Some(trigger) => {
                warn!("benchmark stop requested");
                trigger.trigger();
                Ok(())
            }
            None => Err(BenchmarkError::NotStarted),
        }
    }

    /// The current state of the run.
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }
}

/// Resolves once the run started by [`Benchmark::start`] is over.
#[derive(Debug)]
pub struct RunHandle {
    task: JoinHandle<Result<BenchmarkReport>>,
    state: Arc<Mutex<RunState>>,
}

impl RunHandle {
    /// Wait for the run to end.
    ///
    /// Yields the report, [`Cancelled`](BenchmarkError::Cancelled) if the run was stopped, or
    /// [`Failed`](BenchmarkError::Failed) if the control task died.
    pub async fn join(self) -> Result<BenchmarkReport> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(BenchmarkError::Failed(format!("control task died: {}", e))),
        }
    }

    /// The current state of the run.
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// True once the control task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Marks the run failed if the control task unwinds before recording an outcome.
struct StateGuard(Arc<Mutex<RunState>>);

impl Drop for StateGuard {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        if *state == RunState::Running {
            *state = RunState::Failed;
        }
    }
}

async fn control(
    mut driver: SearchDriver,
    state: Arc<Mutex<RunState>>,
) -> Result<BenchmarkReport> {
    let _guard = StateGuard(Arc::clone(&state));

    let result = driver.run().await;
    driver.finish();

    let outcome = match &result {
        Ok(report) => {
            info!(workers = report.worker_count, "benchmark completed");
            RunState::Completed
        }
        Err(e) if e.is_cancelled() => {
            warn!("benchmark cancelled");
            RunState::Cancelled
        }
        Err(e) => {
            error!(error = %e, "benchmark failed");
            RunState::Failed
        }
    };
    *state.lock() = outcome;
    result
}

/// Fans every latency out to the compliance history, and to the statistics while they are being
/// collected.
struct Samples {
    tracker: Arc<ComplianceTracker>,
    stats: RwLock<Option<Arc<StatisticsCalculator>>>,
}

impl LatencyRecorder for Samples {
    fn record(&self, latency: Duration) {
        self.tracker.append(latency);
        if let Some(stats) = &*self.stats.read() {
            stats.append(latency);
        }
    }
}

struct SearchDriver {
    config: Arc<BenchmarkConfig>,
    pool: WorkerPool,
    samples: Arc<Samples>,
    oracle: ComplianceOracle,
    reporter: Arc<dyn StatusReporter>,
    stop: StopSignal,
}

impl SearchDriver {
    fn new(
        config: Arc<BenchmarkConfig>,
        action: Arc<dyn BenchmarkAction>,
        reporter: Arc<dyn StatusReporter>,
        stop: StopSignal,
    ) -> Self {
        let tracker = Arc::new(ComplianceTracker::new(
            config.delay_limit(),
            config.history_size,
        ));
        let samples = Arc::new(Samples {
            tracker: Arc::clone(&tracker),
            stats: RwLock::new(None),
        });
        let oracle = ComplianceOracle::new(
            tracker,
            config.compliance_test_samples,
            config.percentile_threshold,
            stop.clone(),
        );
        let pool = WorkerPool::new(action, Arc::clone(&samples) as Arc<dyn LatencyRecorder>);

        Self {
            config,
            pool,
            samples,
            oracle,
            reporter,
            stop,
        }
    }

    async fn run(&mut self) -> Result<BenchmarkReport> {
        let config = Arc::clone(&self.config);
        let max_workers = config.max_workers;

        let exp = &config.exponential;
        info!(
            initial = exp.initial_workers,
            multiplier = exp.multiplier,
            "starting exponential step"
        );
        let ramp = ExponentialRamp::new(exp.initial_workers, exp.multiplier).up_to(max_workers);
        let ramp = self.search(ramp, exp.base_wait_time()).await?;
        let bracket = ramp.estimate();
        info!(
            min = bracket.start,
            max = bracket.end,
            "finished exponential step"
        );

        let bin = &config.binary_search;
        let search = BinarySearcher::new(bracket, bin.threshold);
        let search = self.search(search, bin.base_wait_time()).await?;
        let bracket = search.estimate();
        self.set_worker_count(bracket.start);
        info!(
            min = bracket.start,
            max = bracket.end,
            "finished binary search step"
        );

        let fine = &config.fine_tune;
        let tune = FineTuner::new(bracket.start, fine.initial_step).up_to(max_workers);
        let tune = self.search(tune, fine.base_wait_time()).await?;
        let workers = tune.estimate().start;
        self.set_worker_count(workers);
        info!(workers, "finished fine tuning step");

        let statistics = self.stable_stats(config.stable_stats.wait_time()).await?;
        Ok(BenchmarkReport {
            worker_count: workers,
            statistics,
        })
    }

    /// Probe every worker count `search` asks for until it is exhausted.
    async fn search<S>(&self, mut search: S, wait_time: Duration) -> Result<S>
    where
        S: CliffSearch + Send,
    {
        loop {
            search.observe_throughput(self.pool.current_operations_per_sec());
            let workers = match search.next() {
                Some(workers) => workers,
                None => break,
            };

            self.set_worker_count(workers);
            let complies = self.oracle.is_complying(wait_time).await?;
            debug!(workers, complies, "probed worker count");
            if !complies {
                search.overloaded();
            }
        }
        Ok(search)
    }

    /// Resize the pool and forget the latencies observed at the old size.
    fn set_worker_count(&self, workers: usize) {
        if self.pool.worker_count() == workers {
            return;
        }
        trace!(workers, "setting worker count");
        self.pool.set_worker_count(workers);
        self.samples.tracker.reset();
    }

    async fn stable_stats(&self, wait_time: Duration) -> Result<Statistics> {
        let calculator = Arc::new(StatisticsCalculator::new(self.config.delay_limit()));
        *self.samples.stats.write() = Some(Arc::clone(&calculator));
        info!(
            workers = self.pool.worker_count(),
            ?wait_time,
            "collecting stable statistics"
        );

        let start = Instant::now();
        loop {
            self.reporter.report(&self.status());
            let remaining = wait_time.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            self.stop.sleep(remaining.min(STATUS_INTERVAL)).await?;
        }

        let statistics = calculator.calculate();
        debug!(
            count = statistics.count,
            compliance = statistics.compliance_ratio,
            "collected stable statistics"
        );
        Ok(statistics)
    }

    fn status(&self) -> Status {
        Status {
            operations_per_sec: self.pool.current_operations_per_sec(),
            compliance_ratio: self.samples.tracker.compliance_ratio(),
            worker_count: self.pool.worker_count(),
            thread_count: self.pool.thread_count(),
        }
    }

    /// Stop all workers and release the statistics calculator.
    fn finish(&self) {
        self.pool.shutdown();
        self.samples.stats.write().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BinarySearchStepConfig, ExponentialStepConfig, FineTuneStepConfig, StableStatsStepConfig,
    };
    use crate::error::ActionError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Every call takes 10ms, well within the delay limit.
    #[derive(Default)]
    struct Steady {
        in_flight: AtomicUsize,
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BenchmarkAction for Steady {
        async fn execute(&self, _worker: usize) -> std::result::Result<(), ActionError> {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let _in_flight = InFlight(&self.in_flight);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        }
    }

    fn small_config() -> BenchmarkConfig {
        BenchmarkConfig {
            max_workers: 4,
            exponential: ExponentialStepConfig {
                initial_workers: 2,
                multiplier: 2,
                base_wait_time_sec: 1,
            },
            binary_search: BinarySearchStepConfig {
                threshold: 1,
                base_wait_time_sec: 1,
            },
            fine_tune: FineTuneStepConfig {
                initial_step: 1,
                base_wait_time_sec: 1,
            },
            stable_stats: StableStatsStepConfig { wait_time_sec: 5 },
            ..BenchmarkConfig::default()
        }
    }

    async fn drained(action: &Steady) {
        for _ in 0..100 {
            if action.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("workers still running after the run ended");
    }

    #[tokio::test(start_paused = true)]
    async fn completes_at_the_ceiling() {
        let action = Arc::new(Steady::default());
        let reports = Arc::new(Mutex::new(Vec::new()));
        let benchmark = Benchmark::new(small_config(), action.clone())
            .unwrap()
            .with_reporter({
                let reports = Arc::clone(&reports);
                move |status: &Status| reports.lock().push(*status)
            });
        assert_eq!(benchmark.state(), RunState::Idle);

        let handle = benchmark.start().unwrap();
        assert_eq!(handle.state(), RunState::Running);
        let report = handle.join().await.unwrap();

        assert_eq!(report.worker_count, 4);
        assert!(report.statistics.count > 0);
        assert_eq!(report.statistics.compliance_ratio, 1.0);
        assert_eq!(benchmark.state(), RunState::Completed);

        // one update at the start of the measurement and one per second after that
        let reports = reports.lock();
        assert_eq!(reports.len(), 6);
        assert!(reports.iter().all(|s| s.worker_count == 4));

        drained(&action).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice() {
        let action = Arc::new(Steady::default());
        let benchmark = Benchmark::new(small_config(), action.clone()).unwrap();
        let handle = benchmark.start().unwrap();
        assert!(matches!(
            benchmark.start(),
            Err(BenchmarkError::AlreadyStarted)
        ));
        // the first run is unaffected
        assert!(handle.join().await.is_ok());
        assert!(matches!(
            benchmark.start(),
            Err(BenchmarkError::AlreadyStarted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start() {
        let benchmark = Benchmark::new(small_config(), Arc::new(Steady::default())).unwrap();
        assert!(matches!(benchmark.stop(), Err(BenchmarkError::NotStarted)));
        assert_eq!(benchmark.state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_promptly() {
        let action = Arc::new(Steady::default());
        let benchmark = Benchmark::new(BenchmarkConfig::default(), action.clone()).unwrap();
        let handle = benchmark.start().unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(action.in_flight.load(Ordering::SeqCst) > 0);
        let stopped = Instant::now();
        benchmark.stop().unwrap();

        let result = handle.join().await;
        assert!(matches!(result, Err(BenchmarkError::Cancelled)));
        assert!(stopped.elapsed() < Duration::from_millis(100));
        assert_eq!(benchmark.state(), RunState::Cancelled);
        drained(&action).await;

        // stopping again is harmless
        benchmark.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_reporter_fails_the_run() {
        let action = Arc::new(Steady::default());
        let benchmark = Benchmark::new(small_config(), action.clone())
            .unwrap()
            .with_reporter(|_: &Status| panic!("reporter exploded"));

        let result = benchmark.start().unwrap().join().await;
        assert!(matches!(result, Err(BenchmarkError::Failed(_))));
        assert_eq!(benchmark.state(), RunState::Failed);
        drained(&action).await;
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = BenchmarkConfig::default();
        config.exponential.initial_workers = 0;
        let err = Benchmark::new(config, Arc::new(Steady::default())).unwrap_err();
        assert!(matches!(err, BenchmarkError::Config(_)));
    }

    #[test]
    fn start_needs_a_runtime() {
        let benchmark = Benchmark::new(small_config(), Arc::new(Steady::default())).unwrap();
        assert!(matches!(benchmark.start(), Err(BenchmarkError::Failed(_))));
        assert_eq!(benchmark.state(), RunState::Idle);
        // a failed start does not count as a start
        assert!(matches!(benchmark.stop(), Err(BenchmarkError::NotStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn resizing_forgets_history() {
        let action = Arc::new(Steady::default());
        let driver = SearchDriver::new(
            Arc::new(small_config()),
            action.clone(),
            Arc::new(TracingReporter),
            StopSignal::never(),
        );

        driver.set_worker_count(3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!driver.samples.tracker.is_empty());

        driver.set_worker_count(1);
        assert!(driver.samples.tracker.is_empty());
        assert_eq!(driver.status().worker_count, 1);

        // statistics are only collected while installed
        assert!(driver.samples.stats.read().is_none());
        driver.finish();
        drained(&action).await;
    }

    #[tokio::test(start_paused = true)]
    async fn probes_until_exhausted() {
        let action = Arc::new(Steady::default());
        let driver = SearchDriver::new(
            Arc::new(small_config()),
            action.clone(),
            Arc::new(TracingReporter),
            StopSignal::never(),
        );

        // everything complies, so the ramp runs into the ceiling
        let ramp = ExponentialRamp::new(1, 2).up_to(3);
        let ramp = driver.search(ramp, Duration::from_millis(500)).await.unwrap();
        assert_eq!(ramp.estimate(), 3..3);
        assert_eq!(driver.pool.worker_count(), 3);

        driver.finish();
        drained(&action).await;
    }
}
