//! FIFO concurrency limiting bound to a cancellation signal.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::CanceledError;
use crate::signal::CancelSignal;

/// Options for [`Limiter`].
#[derive(Debug, Clone, Copy)]
pub struct LimitOptions {
    /// When the signal aborts, reject every queued entry with the signal's
    /// reason instead of letting the queue drain naturally.
    pub cancel_queued_on_abort: bool,
}

impl Default for LimitOptions {
    fn default() -> Self {
        Self { cancel_queued_on_abort: true }
    }
}

/// Admits at most `concurrency` concurrent executions, in FIFO order.
///
/// New submissions after the bound signal has aborted fail immediately with
/// the stored reason. Running work receives the same signal and is expected
/// to cooperate.
///
/// # Examples
///
/// ```
/// use taskscope::{Limiter, CancelController};
///
/// # async fn example() -> anyhow::Result<()> {
/// let controller = CancelController::new();
/// let limiter = Limiter::new(2, controller.signal());
///
/// let value = limiter.run(|_signal| async { Ok(10) }).await?;
/// assert_eq!(value, 10);
/// # Ok(())
/// # }
/// ```
pub struct Limiter {
    semaphore: Arc<Semaphore>,
    signal: CancelSignal,
    cancel_queued_on_abort: bool,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

impl Limiter {
    /// Creates a limiter with default options.
    ///
    /// # Panics
    ///
    /// Panics when `concurrency` is zero; a limiter that admits nothing is
    /// a programming error.
    pub fn new(concurrency: usize, signal: CancelSignal) -> Self {
        Self::with_options(concurrency, signal, LimitOptions::default())
    }

    /// Creates a limiter with explicit options. Panics on zero concurrency.
    pub fn with_options(concurrency: usize, signal: CancelSignal, options: LimitOptions) -> Self {
        assert!(concurrency >= 1, "limiter concurrency must be at least 1, got {concurrency}");
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            signal,
            cancel_queued_on_abort: options.cancel_queued_on_abort,
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    /// Queues `work` and runs it once a slot frees up.
    pub async fn run<T, W, Fut>(&self, work: W) -> anyhow::Result<T>
    where
        W: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(reason) = self.signal.reason() {
            return Err(CanceledError { reason }.into());
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        let acquired = if self.cancel_queued_on_abort {
            tokio::select! {
                biased;
                reason = self.signal.aborted() => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(CanceledError { reason }.into());
                }
                permit = self.semaphore.acquire() => permit,
            }
        } else {
            self.semaphore.acquire().await
        };
        // The semaphore is never closed, so acquisition cannot fail.
        let _permit = match acquired {
            Ok(permit) => permit,
            Err(_) => return Err(anyhow::anyhow!("limiter semaphore closed")),
        };
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = work(self.signal.clone()).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    /// Number of executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of submissions waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}
