//! Cancellation-aware timers: `sleep` and deadline-inheriting `timeout`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CanceledError, TimeoutError};
use crate::scope::Scope;
use crate::signal::{CancelReason, CancelSignal};
use crate::store::{current_store, scope_deadline_remaining, with_store, ScopeStore};

/// Sleeps for `duration` unless `signal` aborts first.
///
/// An aborted signal rejects with the stored reason before any timer is
/// started; an abort mid-sleep drops the timer and rejects. Either way no
/// timer outlives the call.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskscope::{sleep, CancelController, CancelReason};
///
/// # async fn example() {
/// let controller = CancelController::new();
/// controller.abort(CancelReason::UserAbort);
///
/// let err = sleep(Duration::from_secs(60), &controller.signal()).await.unwrap_err();
/// assert_eq!(err.reason, CancelReason::UserAbort);
/// # }
/// ```
pub async fn sleep(duration: Duration, signal: &CancelSignal) -> Result<(), CanceledError> {
    if let Some(reason) = signal.reason() {
        return Err(CanceledError { reason });
    }
    tokio::select! {
        biased;
        reason = signal.aborted() => Err(CanceledError { reason }),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Runs `work` under a time budget, inheriting any tighter ambient deadline.
///
/// The effective budget is `min(duration, remaining deadline)`. `work` runs
/// in a store frame publishing `now + effective` as the deadline, so nested
/// timeouts tighten monotonically. When the budget elapses first, `scope`
/// is aborted with [`CancelReason::Timeout`] and the call rejects with
/// [`TimeoutError`]; the losing branch's timer is dropped in every outcome.
pub async fn timeout<T, W, Fut>(
    duration: Duration,
    work: W,
    scope: &Arc<Scope>,
    signal: &CancelSignal,
) -> anyhow::Result<T>
where
    W: FnOnce(CancelSignal) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let effective = match scope_deadline_remaining() {
        Some(remaining) => duration.min(remaining),
        None => duration,
    };
    let effective_ms = effective.as_millis() as u64;
    let deadline = Instant::now() + effective;
    let store = match current_store() {
        Some(store) => ScopeStore { scope: store.scope, deadline: Some(deadline) },
        None => ScopeStore { scope: scope.clone(), deadline: Some(deadline) },
    };
    let work_fut = with_store(store, work(signal.clone()));
    tokio::select! {
        biased;
        outcome = work_fut => outcome,
        _ = tokio::time::sleep(effective) => {
            scope.abort(CancelReason::Timeout { ms: effective_ms });
            Err(TimeoutError { ms: effective_ms }.into())
        }
    }
}
