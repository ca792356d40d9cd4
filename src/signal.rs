//! Cooperative cancellation for the control task.

use crate::error::{BenchmarkError, Result};
use std::time::Duration;
use tokio::sync::watch;

/// Create a connected trigger/signal pair. The signal starts out not stopped.
pub fn stop_channel() -> (StopTrigger, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopTrigger(tx), StopSignal(rx))
}

/// The sending half: requests that every [`StopSignal`] observer stops.
#[derive(Debug)]
pub struct StopTrigger(watch::Sender<bool>);

impl StopTrigger {
    /// Request a stop. Idempotent, and sticky: observers that look later still see it.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// The observing half, checked at every point where the control task suspends.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// A signal that is never triggered.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        StopSignal(rx)
    }

    /// True once a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop has been requested. Never resolves if the trigger is gone.
    pub async fn stopped(&self) {
        let mut rx = self.0.clone();
        let triggered = rx.wait_for(|stopped| *stopped).await.is_ok();
        if !triggered {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration`, or fail with [`BenchmarkError::Cancelled`] as soon as a stop is
    /// requested.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            () = self.stopped() => Err(BenchmarkError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn sleeps_when_not_stopped() {
        let (_trigger, signal) = stop_channel();
        let start = Instant::now();
        signal.sleep(Duration::from_secs(3)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(!signal.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_sleep() {
        let (trigger, signal) = stop_channel();
        let start = Instant::now();
        let sleeper = tokio::spawn({
            let signal = signal.clone();
            async move { signal.sleep(Duration::from_secs(3600)).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.trigger();

        let result = sleeper.await.unwrap();
        assert!(matches!(result, Err(BenchmarkError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_sticky() {
        let (trigger, signal) = stop_channel();
        trigger.trigger();
        trigger.trigger();
        assert!(signal.is_stopped());
        assert!(signal.sleep(Duration::ZERO).await.is_err());
        assert!(signal.sleep(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn never_only_sleeps() {
        let signal = StopSignal::never();
        signal.sleep(Duration::from_secs(1)).await.unwrap();
        assert!(!signal.is_stopped());
    }
}
