//! Caller-supplied cancellation for test runs
//!
//! A [`Canceller`] and its [`CancellationSignal`]s share a watch channel.
//! Every backend operation races its I/O against the signal and the step
//! timeout; whichever finishes first decides the outcome.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::CancelReason;

/// Fires cancellation for every signal derived from it
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

/// Observes a [`Canceller`]; cheap to clone
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected canceller/signal pair
pub fn cancellation_pair() -> (Canceller, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx }, CancellationSignal { rx })
}

impl Canceller {
    pub fn cancel(&self) {
        // No receivers left means nobody is waiting to be cancelled
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancellationSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Canceller dropped without firing: cancellation can no longer happen
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `future` unless cancellation is requested first
    pub async fn until_cancelled<F>(&self, future: F) -> Result<F::Output, CancelReason>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return Err(CancelReason::Requested);
        }

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(CancelReason::Requested),
            output = future => Ok(output),
        }
    }

    /// Run `future` unless cancellation or `timeout` wins the race
    pub async fn guard<F>(&self, timeout: Duration, future: F) -> Result<F::Output, CancelReason>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return Err(CancelReason::Requested);
        }

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(CancelReason::Requested),
            result = tokio::time::timeout(timeout, future) => result.map_err(|_| CancelReason::TimedOut {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passes_through_completed_future() {
        let signal = CancellationSignal::never();
        let result = signal.guard(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_guard_reports_timeout() {
        let signal = CancellationSignal::never();
        let result = signal
            .guard(Duration::from_millis(20), std::future::pending::<()>())
            .await;
        assert_eq!(result, Err(CancelReason::TimedOut { timeout_ms: 20 }));
    }

    #[tokio::test]
    async fn test_guard_reports_requested_cancellation() {
        let (canceller, signal) = cancellation_pair();
        let waiter = tokio::spawn(async move {
            signal
                .guard(Duration::from_secs(30), std::future::pending::<()>())
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(CancelReason::Requested));
    }

    #[tokio::test]
    async fn test_until_cancelled_has_no_deadline() {
        let signal = CancellationSignal::never();
        let result = signal
            .until_cancelled(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                "done"
            })
            .await;
        assert_eq!(result, Ok("done"));

        let (canceller, signal) = cancellation_pair();
        canceller.cancel();
        let result = signal.until_cancelled(std::future::pending::<()>()).await;
        assert_eq!(result, Err(CancelReason::Requested));
    }

    #[tokio::test]
    async fn test_already_cancelled_signal_short_circuits() {
        let (canceller, signal) = cancellation_pair();
        canceller.cancel();
        assert!(signal.is_cancelled());
        assert!(canceller.signal().is_cancelled());

        let result = signal.guard(Duration::from_secs(1), async { 1 }).await;
        assert_eq!(result, Err(CancelReason::Requested));
    }
}
