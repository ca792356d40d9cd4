use thiserror::Error;

/// Error returned by a [`BenchmarkAction`](crate::BenchmarkAction) invocation.
///
/// Action failures never stop a run; they are logged and the sample is dropped.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can go wrong while configuring, starting, or running a benchmark.
#[derive(Debug, Error)]
pub enum BenchmarkError {
    /// The configuration would make the search diverge or is otherwise unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// [`Benchmark::start`](crate::Benchmark::start) was called more than once.
    #[error("benchmark already started")]
    AlreadyStarted,

    /// [`Benchmark::stop`](crate::Benchmark::stop) was called before the benchmark started.
    #[error("must have started benchmark to call stop")]
    NotStarted,

    /// The run was stopped before it could produce statistics.
    #[error("benchmark cancelled")]
    Cancelled,

    /// The control task hit an unrecoverable error.
    #[error("benchmark failed: {0}")]
    Failed(String),

    /// Reading a configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration document could not be parsed.
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchmarkError {
    /// True if the run ended because someone asked it to stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BenchmarkError::Cancelled)
    }
}

/// Shorthand for results produced by this crate.
pub type Result<T> = std::result::Result<T, BenchmarkError>;
