use crate::error::ActionError;
use async_trait::async_trait;

/// The unit of work being benchmarked.
///
/// Implementations must tolerate being called concurrently from as many workers as the search
/// decides to run. A call that returns `Ok` is timed and sampled; a call that returns `Err` is
/// logged and otherwise ignored.
#[async_trait]
pub trait BenchmarkAction: Send + Sync + 'static {
    /// Perform one operation on behalf of worker number `worker`.
    ///
    /// Worker numbers are dense, start at zero, and are never shared by two running workers.
    async fn execute(&self, worker: usize) -> Result<(), ActionError>;
}
