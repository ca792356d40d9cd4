//! A live-resizable pool of closed-loop workers.

use crate::action::BenchmarkAction;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Receives the latency of every successful operation.
pub trait LatencyRecorder: Send + Sync {
    /// Called by a worker right after an operation succeeded.
    fn record(&self, latency: Duration);
}

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const EXITED: u8 = 2;

// successful operations between forced yields
const YIELD_EVERY: u64 = 64;

struct Worker {
    index: usize,
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl Worker {
    fn is_exited(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXITED || self.task.is_finished()
    }
}

#[derive(Default)]
struct Workers {
    active: Vec<Worker>,
    // asked to stop, but possibly still finishing their current operation
    retiring: Vec<Worker>,
    shut_down: bool,
}

/// Runs a variable number of workers, each invoking the action in a loop.
///
/// Every worker runs as its own Tokio task, so the pool must be used from within a runtime.
/// Shrinking the pool lets the excess workers finish their current operation; growing it again
/// before they have exited puts them back to work instead of spawning new ones, so a worker
/// number is never in use twice at the same time.
pub struct WorkerPool {
    action: Arc<dyn BenchmarkAction>,
    recorder: Arc<dyn LatencyRecorder>,
    throughput: Arc<ThroughputMeter>,
    live: Arc<AtomicUsize>,
    workers: Mutex<Workers>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("threads", &self.thread_count())
            .finish()
    }
}

impl WorkerPool {
    /// An empty pool whose workers run `action` and report to `recorder`.
    pub fn new(action: Arc<dyn BenchmarkAction>, recorder: Arc<dyn LatencyRecorder>) -> Self {
        Self {
            action,
            recorder,
            throughput: Arc::new(ThroughputMeter::new()),
            live: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Workers::default()),
        }
    }

    /// Resize the pool to exactly `count` workers. Ignored once the pool has been shut down.
    pub fn set_worker_count(&self, count: usize) {
        let mut workers = self.workers.lock();
        if workers.shut_down {
            warn!(count, "ignoring resize of a shut down worker pool");
            return;
        }

        workers.retiring.retain(|w| !w.is_exited());

        while workers.active.len() > count {
            if let Some(worker) = workers.active.pop() {
                worker.state.store(STOPPING, Ordering::Release);
                workers.retiring.push(worker);
            }
        }

        while workers.active.len() < count {
            let index = workers.active.len();
            let retired = workers.retiring.iter().position(|w| w.index == index);
            let revived = match retired {
                Some(pos) => {
                    let worker = workers.retiring.swap_remove(pos);
                    let resumed = worker
                        .state
                        .compare_exchange(STOPPING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    resumed.then_some(worker)
                }
                None => None,
            };
            let worker = match revived {
                Some(worker) => worker,
                None => self.spawn(index),
            };
            workers.active.push(worker);
        }

        trace!(count, retiring = workers.retiring.len(), "worker count set");
    }

    fn spawn(&self, index: usize) -> Worker {
        let state = Arc::new(AtomicU8::new(RUNNING));
        let live = LiveGuard::new(Arc::clone(&self.live));
        let task = tokio::spawn(run_worker(
            index,
            Arc::clone(&state),
            Arc::clone(&self.action),
            Arc::clone(&self.recorder),
            Arc::clone(&self.throughput),
            live,
        ));
        Worker { index, state, task }
    }

    /// The number of workers the pool was last resized to.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().active.len()
    }

    /// The number of worker loops that are still alive.
    ///
    /// Lags behind [`worker_count`](WorkerPool::worker_count) while excess workers finish their
    /// last operation.
    pub fn thread_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Successful operations per second over roughly the last second.
    pub fn current_operations_per_sec(&self) -> f64 {
        self.throughput.rate(Instant::now())
    }

    /// Stop every worker, abandoning operations in flight. Idempotent.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        if workers.shut_down {
            return;
        }
        workers.shut_down = true;

        let Workers {
            active, retiring, ..
        } = &mut *workers;
        for worker in active.drain(..).chain(retiring.drain(..)) {
            worker.state.store(STOPPING, Ordering::Release);
            worker.task.abort();
        }
        trace!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Counts a worker as live from spawn until its task is dropped, aborted or not.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        LiveGuard(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn run_worker(
    index: usize,
    state: Arc<AtomicU8>,
    action: Arc<dyn BenchmarkAction>,
    recorder: Arc<dyn LatencyRecorder>,
    throughput: Arc<ThroughputMeter>,
    _live: LiveGuard,
) {
    let mut iterations: u64 = 0;
    loop {
        while state.load(Ordering::Acquire) == RUNNING {
            let started = Instant::now();
            let failed = match action.execute(index).await {
                Ok(()) => {
                    let latency = started.elapsed();
                    throughput.record(Instant::now());
                    recorder.record(latency);
                    false
                }
                Err(error) => {
                    warn!(worker = index, %error, "benchmark action failed");
                    true
                }
            };

            // an action that never suspends must not starve the rest of the runtime
            iterations = iterations.wrapping_add(1);
            if failed || iterations % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        // the pool may have put us back to work while we were finishing up
        if state
            .compare_exchange(STOPPING, EXITED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
    trace!(worker = index, "worker exited");
}

const SLOT_MILLIS: u64 = 100;
const WINDOW_SLOTS: u64 = 10;
const SLOTS: usize = 12;

/// Completion counter bucketed into 100ms slots, good for a one-second trailing rate.
///
/// Slots are recycled lock-free; a completion that races with recycling may be lost, which is
/// fine for an estimate.
struct ThroughputMeter {
    origin: Instant,
    ticks: [AtomicU64; SLOTS],
    counts: [AtomicU64; SLOTS],
}

impl ThroughputMeter {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            ticks: std::array::from_fn(|_| AtomicU64::new(u64::max_value())),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn tick(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_millis();
        u64::try_from(elapsed).unwrap_or(u64::max_value()) / SLOT_MILLIS
    }

    fn record(&self, now: Instant) {
        let tick = self.tick(now);
        let slot = (tick % SLOTS as u64) as usize;
        let seen = self.ticks[slot].load(Ordering::Acquire);
        if seen != tick
            && self.ticks[slot]
                .compare_exchange(seen, tick, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.counts[slot].store(0, Ordering::Release);
        }
        self.counts[slot].fetch_add(1, Ordering::AcqRel);
    }

    fn rate(&self, now: Instant) -> f64 {
        let current = self.tick(now);
        // only completed slots count
        let window = current.min(WINDOW_SLOTS);
        if window == 0 {
            return 0.0;
        }

        let oldest = current - window;
        let total: u64 = (0..SLOTS)
            .filter(|&slot| {
                let tick = self.ticks[slot].load(Ordering::Acquire);
                tick >= oldest && tick < current
            })
            .map(|slot| self.counts[slot].load(Ordering::Acquire))
            .sum();

        total as f64 / (window * SLOT_MILLIS) as f64 * 1000.0
    }
}
