//! The scope-creating combinators.
//!
//! Every combinator opens a scope, installs its store, hands the callback a
//! [`TaskContext`] and coordinates completion per its rule. Whatever the
//! rule, no scope-bound task outlives the point where the combinator's
//! contract says the scope ends.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::observer::ScopeKind;
use crate::scope::Scope;
use crate::signal::{CancelReason, CancelSignal};
use crate::store::{current_deadline, current_store, with_store, ScopeStore};
use crate::strict;
use crate::task::{create_task, Registration, Task, TaskOptions};

/// Incremental observer of a scope's entries, including entries that get
/// registered while observing (a task may start further tasks).
///
/// Tracks the error that should become the combinator's rejection: the
/// first failure wins; cancellations are reported only when no real failure
/// occurred, since sibling cancellation is the expected consequence of the
/// first failure closing the scope. With `abort_on_failure`, the first
/// failure aborts the scope so the remaining tasks stop cooperatively.
pub(crate) struct ScopeDrain {
    scope: Arc<Scope>,
    abort_on_failure: bool,
    seen: usize,
    pending: FuturesUnordered<BoxFuture<'static, Option<TaskError>>>,
    first_failed: Option<TaskError>,
    first_canceled: Option<TaskError>,
}

impl ScopeDrain {
    pub(crate) fn new(scope: Arc<Scope>, abort_on_failure: bool) -> Self {
        Self {
            scope,
            abort_on_failure,
            seen: 0,
            pending: FuturesUnordered::new(),
            first_failed: None,
            first_canceled: None,
        }
    }

    fn pull_new(&mut self) {
        let batch = self.scope.entries_from(self.seen);
        self.seen += batch.len();
        for entry in batch {
            self.pending.push(
                async move {
                    entry.task.settled().await;
                    entry.task.outcome_error()
                }
                .boxed(),
            );
        }
    }

    fn record(&mut self, error: TaskError) {
        if error.is_canceled() {
            if self.first_canceled.is_none() {
                self.first_canceled = Some(error);
            }
        } else if self.first_failed.is_none() {
            self.first_failed = Some(error);
            if self.abort_on_failure {
                self.scope.abort(CancelReason::ScopeClosed);
            }
        }
    }

    /// The first failure observed so far, if any.
    fn first_failure(&self) -> Option<TaskError> {
        self.first_failed.clone()
    }

    /// Observes entries without ever completing, recording settles as they
    /// come. Raced against the callback so a task failure aborts the scope
    /// while the callback is still running.
    async fn watch(&mut self) {
        loop {
            let scope = self.scope.clone();
            let added = scope.entry_added_notified();
            tokio::pin!(added);
            added.as_mut().enable();
            self.pull_new();
            if self.pending.is_empty() {
                added.await;
                continue;
            }
            let outcome = tokio::select! {
                biased;
                outcome = self.pending.next() => outcome,
                _ = &mut added => None,
            };
            if let Some(Some(error)) = outcome {
                self.record(error);
            }
        }
    }

    /// Waits until every entry has settled and returns the rejection error
    /// per the precedence above.
    pub(crate) async fn finish(mut self) -> Option<TaskError> {
        loop {
            self.pull_new();
            match self.pending.next().await {
                Some(Some(error)) => self.record(error),
                Some(None) => {}
                None => {
                    if self.scope.entry_count() == self.seen {
                        break;
                    }
                }
            }
        }
        self.first_failed.or(self.first_canceled)
    }
}

/// How a sync-semantics scope failed.
enum SyncFailure {
    /// A scope-bound task failed (or, with no failures, was canceled).
    Task(TaskError),
    /// The callback itself rejected, with no earlier task failure.
    Callback(anyhow::Error),
}

/// Runs `body` under `store` while concurrently watching the scope's
/// entries, then drains them to quiescence and closes the scope.
///
/// The first failure observed — task or callback — aborts the scope,
/// cancelling the remaining tasks, and is the rejection even when later
/// settles (including the callback's own, as a consequence) also reject.
async fn drive_sync_scope<R, Fut>(
    scope: &Arc<Scope>,
    store: ScopeStore,
    body: Fut,
) -> Result<R, SyncFailure>
where
    Fut: Future<Output = anyhow::Result<R>>,
{
    let mut drain = ScopeDrain::new(scope.clone(), true);
    let body = with_store(store, body);
    tokio::pin!(body);
    let cb_result = tokio::select! {
        biased;
        result = &mut body => result,
        _ = drain.watch() => unreachable!("entry watch never completes"),
    };
    match cb_result {
        Ok(value) => {
            let drain_error = drain.finish().await;
            scope.close();
            match drain_error {
                None => Ok(value),
                Some(error) => Err(SyncFailure::Task(error)),
            }
        }
        Err(error) => {
            // A task failure observed while the callback ran already aborted
            // the scope and outranks the callback's rejection.
            let earlier_failure = drain.first_failure();
            scope.abort(CancelReason::ScopeClosed);
            let _ = drain.finish().await;
            scope.close();
            match earlier_failure {
                Some(first) => Err(SyncFailure::Task(first)),
                None => Err(SyncFailure::Callback(error)),
            }
        }
    }
}

fn fresh_scope<T: Send + 'static>(kind: ScopeKind) -> (Arc<Scope>, TaskContext<T>, ScopeStore) {
    let scope = Scope::new(kind);
    let ctx = TaskContext::new(scope.clone());
    let store = ScopeStore { scope: scope.clone(), deadline: current_deadline() };
    (scope, ctx, store)
}

/// All-must-succeed: runs the callback while concurrently waiting for every
/// scope-bound task to complete.
///
/// The first failure — a task failing, even mid-callback, or the callback
/// itself failing — closes the scope, cancelling the other tasks with
/// [`CancelReason::ScopeClosed`], and becomes the rejection. Otherwise
/// `sync` resolves with the callback's value once every task has completed.
///
/// # Examples
///
/// ```
/// use taskscope::sync;
///
/// # async fn example() -> Result<(), taskscope::TaskError> {
/// let sum = sync(|ctx| async move {
///     let a = ctx.spawn(|_| async { Ok(1) });
///     let b = ctx.spawn(|_| async { Ok(2) });
///     Ok(a.join().await? + b.join().await?)
/// })
/// .await?;
/// assert_eq!(sum, 3);
/// # Ok(())
/// # }
/// ```
pub async fn sync<T, R, F, Fut>(cb: F) -> Result<R, TaskError>
where
    T: Clone + Send + 'static,
    F: FnOnce(TaskContext<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    let (scope, ctx, store) = fresh_scope(ScopeKind::Sync);
    match drive_sync_scope(&scope, store, cb(ctx)).await {
        Ok(value) => Ok(value),
        Err(SyncFailure::Task(error)) => Err(error),
        Err(SyncFailure::Callback(error)) => Err(TaskError::failed(None, error)),
    }
}

/// First-settle wins: the first task to settle — fulfil or reject — is the
/// outcome, and the scope closes immediately, cancelling the losers.
///
/// Rejects when the callback starts no tasks.
pub async fn race<T, F, Fut>(cb: F) -> Result<T, TaskError>
where
    T: Clone + Send + 'static,
    F: FnOnce(TaskContext<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let (scope, ctx, store) = fresh_scope(ScopeKind::Race);
    if let Err(error) = with_store(store, cb(ctx.clone())).await {
        scope.close();
        return Err(TaskError::failed(None, error));
    }
    let tasks = ctx.tasks_snapshot();
    if tasks.is_empty() {
        scope.close();
        return Err(TaskError::failed(
            None,
            anyhow::anyhow!("race: callback did not start any tasks"),
        ));
    }
    let mut settles: FuturesUnordered<_> = tasks.iter().map(|task| task.join()).collect();
    let outcome = match settles.next().await {
        Some(outcome) => outcome,
        None => Err(TaskError::failed(
            None,
            anyhow::anyhow!("race: callback did not start any tasks"),
        )),
    };
    drop(settles);
    scope.close();
    outcome
}

/// First-settle result, wait for the rest: the first settle is the outcome,
/// but the scope stays open until every other task reaches a terminal
/// state. Losers are not cancelled by `rush` itself.
///
/// Rejects when the callback starts no tasks.
pub async fn rush<T, F, Fut>(cb: F) -> Result<T, TaskError>
where
    T: Clone + Send + 'static,
    F: FnOnce(TaskContext<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let (scope, ctx, store) = fresh_scope(ScopeKind::Rush);
    if let Err(error) = with_store(store, cb(ctx.clone())).await {
        scope.close();
        return Err(TaskError::failed(None, error));
    }
    let tasks = ctx.tasks_snapshot();
    if tasks.is_empty() {
        scope.close();
        return Err(TaskError::failed(
            None,
            anyhow::anyhow!("rush: callback did not start any tasks"),
        ));
    }
    let mut settles: FuturesUnordered<_> = tasks.iter().map(|task| task.join()).collect();
    let outcome = match settles.next().await {
        Some(outcome) => outcome,
        None => Err(TaskError::failed(
            None,
            anyhow::anyhow!("rush: callback did not start any tasks"),
        )),
    };
    drop(settles);
    let _ = ScopeDrain::new(scope.clone(), false).finish().await;
    scope.close();
    outcome
}

/// Fire-and-hold: runs the callback concurrently with whatever follows,
/// returning before the body has run at all.
///
/// The branch scope is linked to the enclosing scope, so closing the parent
/// cancels the branch; when the branch body settles first, the branch scope
/// closes then, cancelling any tasks it left running. Without an enclosing
/// scope the branch still runs, degraded to body-settled lifetime, and a
/// warning is emitted.
pub fn branch<T, F, Fut>(cb: F)
where
    T: Clone + Send + 'static,
    F: FnOnce(TaskContext<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let parent = current_store();
    if parent.is_none() {
        if strict::strict_enabled() {
            strict::violation("branch called without an enclosing scope");
        } else {
            tracing::warn!(
                target: "taskscope",
                "branch without an enclosing scope; its tasks only live until the body settles"
            );
        }
    }
    let scope = Scope::new(ScopeKind::Branch);
    if let Some(parent_store) = &parent {
        scope.link_parent(&parent_store.scope.signal());
    }
    let store = ScopeStore {
        scope: scope.clone(),
        deadline: parent.as_ref().and_then(|parent_store| parent_store.deadline),
    };
    let ctx = TaskContext::new(scope.clone());
    let body = cb(ctx);
    tokio::spawn(async move {
        let result = AssertUnwindSafe(with_store(store, body)).catch_unwind().await;
        if let Ok(Err(error)) = result {
            tracing::warn!(target: "taskscope", %error, "branch body failed");
        }
        scope.close();
    });
}

/// New scope, parent-linked, wrapped as a single task.
///
/// The callback runs with `sync` semantics inside its own scope; the
/// returned task settles with the callback's value once every inner task
/// has completed. The task is deliberately *not* registered in the
/// enclosing scope's entries — it is a leaf with its own scope. Its
/// cancellation is driven by the *enclosing* scope's signal: the child
/// scope closing on the way out must not cancel the task that is busy
/// completing.
pub fn spawn<T, R, F, Fut>(cb: F) -> Task<R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: FnOnce(TaskContext<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let parent = current_store();
    let scope = Scope::new(ScopeKind::Spawn);
    let mut options = TaskOptions::new();
    if let Some(parent_store) = &parent {
        scope.link_parent(&parent_store.scope.signal());
        options.signal = Some(parent_store.scope.signal());
    }
    let store = ScopeStore {
        scope: scope.clone(),
        deadline: parent.as_ref().and_then(|parent_store| parent_store.deadline),
    };
    let ctx = TaskContext::new(scope.clone());
    let body = cb(ctx);
    create_task(
        move |_signal| async move {
            match drive_sync_scope(&scope, store, body).await {
                Ok(value) => Ok(value),
                Err(SyncFailure::Task(error)) => Err(anyhow::Error::new(error)),
                Err(SyncFailure::Callback(error)) => Err(error),
            }
        },
        options,
        Registration::Detached,
    )
}

/// A task bound to nothing: no parent signal, no scope registration. Not
/// cancelled by any ambient scope — the deliberate escape hatch from
/// structure, which strict mode reports when used outside every scope.
pub fn spawn_detached<T, W, Fut>(work: W) -> Task<T>
where
    T: Send + 'static,
    W: FnOnce(CancelSignal) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    create_task(work, TaskOptions::new(), Registration::Detached)
}

/// Sync-shaped, but returns as soon as the callback completes.
///
/// Started tasks keep running; the scope stays alive until every entry has
/// settled, at which point it closes in the background.
pub async fn spawn_scope<T, R, F, Fut>(cb: F) -> Result<R, TaskError>
where
    T: Clone + Send + 'static,
    F: FnOnce(TaskContext<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    let (scope, ctx, store) = fresh_scope::<T>(ScopeKind::SpawnScope);
    let result = with_store(store, cb(ctx)).await;
    tokio::spawn(async move {
        let _ = ScopeDrain::new(scope.clone(), false).finish().await;
        scope.close();
    });
    result.map_err(|error| TaskError::failed(None, error))
}
