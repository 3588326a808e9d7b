//! The task: a single asynchronous computation with an explicit lifecycle.
//!
//! A [`Task`] is a cloneable handle around shared state: a status, an
//! eventual outcome, a list of cancel hooks and an owned cancellation
//! controller. Awaiting the handle resolves with the outcome; the handle
//! itself keeps answering synchronous questions (`status`, `result`,
//! `error`) a bare future cannot.

use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::TaskError;
use crate::observer::{self, TaskEvent, TaskTiming};
use crate::scope::ScopeEntry;
use crate::signal::{CancelController, CancelReason, CancelSignal};
use crate::store::{current_store, with_store, ScopeStore};
use crate::strict;

/// Lifecycle status of a task. `Running` is initial; the rest are terminal
/// and a task reaches exactly one of them, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The work has been started (or is about to be) and has not settled.
    Running,
    /// The work returned a value.
    Completed,
    /// The work returned an error.
    Failed,
    /// The task was canceled before its work settled.
    Canceled,
}

impl TaskStatus {
    /// True for every status except `Running`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Optional per-task lifecycle callbacks.
///
/// Hooks observe transitions; they can never alter the task outcome, and a
/// panicking hook is caught and ignored. The completion and failure hooks
/// fire while the status still reads `Running`.
#[derive(Default)]
pub struct LifecycleHooks {
    /// Fires on completion with the task's run duration.
    pub on_complete: Option<Box<dyn Fn(Duration) + Send + Sync>>,
    /// Fires on failure with the work error.
    pub on_fail: Option<Box<dyn Fn(&anyhow::Error) + Send + Sync>>,
    /// Fires on cancellation with the reason, before user `on_cancel`
    /// handlers run.
    pub on_cancel: Option<Box<dyn Fn(&CancelReason) + Send + Sync>>,
}

impl LifecycleHooks {
    /// Hooks with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Options for [`run_task`].
#[derive(Default)]
pub struct TaskOptions {
    /// Parent signal: when it aborts, the task is canceled with the
    /// parent's reason.
    pub signal: Option<CancelSignal>,
    /// Diagnostic name; never affects behavior.
    pub name: Option<String>,
    /// Lifecycle callbacks.
    pub hooks: LifecycleHooks,
    /// When set, a parent abort is normalized to
    /// [`CancelReason::ParentCanceled`] instead of propagating the parent's
    /// own reason.
    pub parent_task: bool,
}

impl TaskOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    /// Sets the parent signal.
    pub fn with_signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Sets the lifecycle hooks.
    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

type CancelHandler = Box<dyn FnOnce(&CancelReason) + Send>;

struct TaskState<T> {
    status: TaskStatus,
    cancel_reason: Option<CancelReason>,
    cancel_handlers: Vec<CancelHandler>,
    outcome: Option<Result<T, TaskError>>,
    ended: Option<Instant>,
}

pub(crate) struct TaskInner<T> {
    name: Option<Arc<str>>,
    id: Option<u64>,
    started: Instant,
    claimed: AtomicBool,
    controller: CancelController,
    hooks: LifecycleHooks,
    state: Mutex<TaskState<T>>,
    done: Notify,
}

/// Handle to a running or settled asynchronous computation.
///
/// Clones share the same underlying task. Awaiting the handle (or calling
/// [`Task::join`]) resolves with the work's value or rejects with a
/// [`TaskError`] carrying the failure or cancellation reason.
pub struct Task<T> {
    pub(crate) inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl<T> Task<T> {
    /// Current lifecycle status.
    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().status
    }

    /// Diagnostic name, when one was given.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The task's owned cancellation signal — the one its work received.
    pub fn signal(&self) -> CancelSignal {
        self.inner.controller.signal()
    }

    /// The error outcome, once the task has failed or been canceled.
    pub fn error(&self) -> Option<TaskError> {
        self.inner
            .state
            .lock()
            .outcome
            .as_ref()
            .and_then(|outcome| outcome.as_ref().err().cloned())
    }

    /// Registers a cancellation cleanup handler.
    ///
    /// While the task is running the handler is appended; handlers run in
    /// registration order when the task is canceled, before the awaitable
    /// rejects. On an already-canceled task the handler is invoked
    /// synchronously, once, with the stored reason. On a completed or
    /// failed task it is never invoked.
    pub fn on_cancel(&self, handler: impl FnOnce(&CancelReason) + Send + 'static) {
        let reason = {
            let mut state = self.inner.state.lock();
            match state.status {
                TaskStatus::Running => {
                    state.cancel_handlers.push(Box::new(handler));
                    return;
                }
                TaskStatus::Canceled => match state.cancel_reason.clone() {
                    Some(reason) => reason,
                    None => return,
                },
                TaskStatus::Completed | TaskStatus::Failed => return,
            }
        };
        handler(&reason);
    }

    pub(crate) fn debug_id(&self) -> Option<u64> {
        self.inner.id
    }

    fn emit_update(&self, status: TaskStatus, ended: Option<Instant>) {
        if let Some(task_id) = self.inner.id {
            let started = self.inner.started;
            observer::emit(|| TaskEvent::TaskUpdated {
                task_id,
                status,
                timing: TaskTiming { started, ended },
            });
        }
    }

    /// `running → completed(value)`.
    pub(crate) fn complete(&self, value: T) {
        if self.inner.claimed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = &self.inner.hooks.on_complete {
            let duration = self.inner.started.elapsed();
            let _ = catch_unwind(AssertUnwindSafe(|| hook(duration)));
        }
        let ended = Instant::now();
        {
            let mut state = self.inner.state.lock();
            state.status = TaskStatus::Completed;
            state.ended = Some(ended);
        }
        self.emit_update(TaskStatus::Completed, Some(ended));
        self.inner.state.lock().outcome = Some(Ok(value));
        self.inner.done.notify_waiters();
    }

    /// `running → failed(error)`.
    pub(crate) fn fail(&self, error: anyhow::Error) {
        if self.inner.claimed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = &self.inner.hooks.on_fail {
            let _ = catch_unwind(AssertUnwindSafe(|| hook(&error)));
        }
        let ended = Instant::now();
        {
            let mut state = self.inner.state.lock();
            state.status = TaskStatus::Failed;
            state.ended = Some(ended);
        }
        self.emit_update(TaskStatus::Failed, Some(ended));
        self.inner.state.lock().outcome =
            Some(Err(TaskError::failed(self.inner.name.clone(), error)));
        self.inner.done.notify_waiters();
    }

    /// `running → canceled(reason)`.
    ///
    /// Ordering: lifecycle hook, status flip, debug event, user `on_cancel`
    /// handlers in registration order, then the awaitable rejects.
    pub(crate) fn cancel(&self, reason: CancelReason) {
        if self.inner.claimed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Stop the work first: it holds the owned signal and is expected to
        // bail out cooperatively. Its eventual settle loses the claim race.
        self.inner.controller.abort(reason.clone());
        if let Some(hook) = &self.inner.hooks.on_cancel {
            let _ = catch_unwind(AssertUnwindSafe(|| hook(&reason)));
        }
        let ended = Instant::now();
        let handlers = {
            let mut state = self.inner.state.lock();
            state.status = TaskStatus::Canceled;
            state.ended = Some(ended);
            state.cancel_reason = Some(reason.clone());
            std::mem::take(&mut state.cancel_handlers)
        };
        self.emit_update(TaskStatus::Canceled, Some(ended));
        if handlers.is_empty() {
            strict::violation(match &self.inner.name {
                Some(name) => format!("task '{name}' canceled with no on_cancel cleanup"),
                None => "task canceled with no on_cancel cleanup".to_string(),
            });
        }
        for handler in handlers {
            let _ = catch_unwind(AssertUnwindSafe(|| handler(&reason)));
        }
        self.inner.state.lock().outcome =
            Some(Err(TaskError::canceled(self.inner.name.clone(), reason)));
        self.inner.done.notify_waiters();
    }
}

impl<T: Clone> Task<T> {
    /// The value, once the task has completed.
    pub fn result(&self) -> Option<T> {
        self.inner
            .state
            .lock()
            .outcome
            .as_ref()
            .and_then(|outcome| outcome.as_ref().ok().cloned())
    }

    /// Waits for the task to settle and returns its outcome.
    ///
    /// Multiple callers may join the same task; each receives a clone of
    /// the value or error.
    pub async fn join(&self) -> Result<T, TaskError> {
        loop {
            let notified = self.inner.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.inner.state.lock().outcome.clone() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Task<T> {
    type Output = Result<T, TaskError>;
    type IntoFuture = BoxFuture<'static, Result<T, TaskError>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.join().await }.boxed()
    }
}

/// Type-erased view of a scope-bound task, as held in scope entries.
pub(crate) trait ScopeTask: Send + Sync {
    fn status(&self) -> TaskStatus;
    fn task_name(&self) -> Option<Arc<str>>;
    fn started_at(&self) -> Instant;
    fn outcome_error(&self) -> Option<TaskError>;
    /// Resolves once the task's awaitable has settled.
    fn settled(&self) -> BoxFuture<'static, ()>;
}

impl<T: Send + 'static> ScopeTask for Task<T> {
    fn status(&self) -> TaskStatus {
        Task::status(self)
    }

    fn task_name(&self) -> Option<Arc<str>> {
        self.inner.name.clone()
    }

    fn started_at(&self) -> Instant {
        self.inner.started
    }

    fn outcome_error(&self) -> Option<TaskError> {
        self.error()
    }

    fn settled(&self) -> BoxFuture<'static, ()> {
        let inner = self.inner.clone();
        async move {
            loop {
                let notified = inner.done.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if inner.state.lock().outcome.is_some() {
                    return;
                }
                notified.await;
            }
        }
        .boxed()
    }
}

/// Where a freshly created task registers itself.
pub(crate) enum Registration {
    /// Register into the ambient scope when the supplied parent signal is
    /// that scope's own signal.
    Ambient,
    /// Scope-bound: always register into this scope's entries.
    Scope(Arc<crate::scope::Scope>),
    /// No registration.
    Detached,
}

/// Creates a task and starts its work on the runtime.
///
/// If the parent signal is already aborted, the task is born canceled and
/// `work` is never invoked. Otherwise a parent-abort bridge is installed
/// (holding the task weakly, so a long-lived parent does not keep settled
/// tasks alive) and `work(owned_signal)` is spawned.
pub(crate) fn create_task<T, W, Fut>(
    work: W,
    options: TaskOptions,
    registration: Registration,
) -> Task<T>
where
    T: Send + 'static,
    W: FnOnce(CancelSignal) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let parent_signal = match &registration {
        Registration::Scope(scope) => Some(scope.signal()),
        Registration::Ambient | Registration::Detached => options.signal.clone(),
    };

    if parent_signal.is_none() && current_store().is_none() {
        strict::violation("task started without a signal outside any scope (unstructured async)");
    }

    let controller = CancelController::new();
    let owned_signal = controller.signal();
    let name: Option<Arc<str>> = options.name.as_deref().map(Arc::from);
    let id = observer::next_debug_id();

    let task = Task {
        inner: Arc::new(TaskInner {
            name: name.clone(),
            id,
            started: Instant::now(),
            claimed: AtomicBool::new(false),
            controller,
            hooks: options.hooks,
            state: Mutex::new(TaskState {
                status: TaskStatus::Running,
                cancel_reason: None,
                cancel_handlers: Vec::new(),
                outcome: None,
                ended: None,
            }),
            done: Notify::new(),
        }),
    };

    if let Some(task_id) = id {
        let parent_scope_id = match &registration {
            Registration::Scope(scope) => scope.debug_id(),
            Registration::Ambient => {
                current_store().and_then(|store| store.scope.debug_id())
            }
            Registration::Detached => None,
        };
        let name = name.clone();
        observer::emit(|| TaskEvent::TaskRegistered { task_id, name, parent_scope_id });
    }

    // Born canceled: the parent aborted before the task existed.
    if let Some(parent) = &parent_signal {
        if let Some(parent_reason) = parent.reason() {
            let reason = if options.parent_task {
                CancelReason::ParentCanceled
            } else {
                parent_reason
            };
            let _ = register_entry(&registration, &parent_signal, &task, Arc::new(AtomicBool::new(true)));
            task.cancel(reason);
            return task;
        }
    }

    if let Some(parent) = &parent_signal {
        let weak: Weak<TaskInner<T>> = Arc::downgrade(&task.inner);
        let normalize = options.parent_task;
        parent.on_abort(move |reason| {
            if let Some(inner) = weak.upgrade() {
                let reason = if normalize {
                    CancelReason::ParentCanceled
                } else {
                    reason.clone()
                };
                Task { inner }.cancel(reason);
            }
        });
    }

    let work_settled = Arc::new(AtomicBool::new(false));
    let work_store = register_entry(&registration, &parent_signal, &task, work_settled.clone());

    let fut = work(owned_signal);
    let settled_task = task.clone();
    tokio::spawn(async move {
        let wrapped = async move {
            match work_store {
                Some(store) => with_store(store, fut).await,
                None => fut.await,
            }
        };
        let outcome = match AssertUnwindSafe(wrapped).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!("task work panicked: {}", panic_message(&panic))),
        };
        work_settled.store(true, Ordering::SeqCst);
        match outcome {
            Ok(value) => settled_task.complete(value),
            Err(error) => settled_task.fail(error),
        }
    });

    task
}

/// Registers the task per its registration mode and returns the store its
/// work should run under.
fn register_entry<T: Send + 'static>(
    registration: &Registration,
    parent_signal: &Option<CancelSignal>,
    task: &Task<T>,
    work_settled: Arc<AtomicBool>,
) -> Option<ScopeStore> {
    let entry = ScopeEntry {
        task: Arc::new(task.clone()) as Arc<dyn ScopeTask>,
        work_settled,
    };
    match registration {
        Registration::Scope(scope) => {
            scope.register(entry);
            Some(ScopeStore {
                scope: scope.clone(),
                deadline: crate::store::current_deadline(),
            })
        }
        Registration::Ambient => {
            let store = current_store();
            if let (Some(parent), Some(store)) = (parent_signal, &store) {
                if CancelSignal::same_signal(&store.scope.signal(), parent) {
                    store.scope.register(entry);
                }
            }
            store
        }
        Registration::Detached => None,
    }
}

/// Starts an asynchronous unit of work and returns its task handle.
///
/// `work` receives the task's owned cancellation signal; when
/// `options.signal` aborts, the task is canceled with the parent's reason
/// and that signal fires. Called inside a scope whose signal is passed as
/// `options.signal`, the task is additionally bound to the scope's entries.
///
/// # Examples
///
/// ```
/// use taskscope::{run_task, TaskOptions};
///
/// # async fn example() -> anyhow::Result<()> {
/// let task = run_task(
///     |_signal| async move { Ok(2 + 2) },
///     TaskOptions::named("math"),
/// );
/// assert_eq!(task.join().await?, 4);
/// # Ok(())
/// # }
/// ```
pub fn run_task<T, W, Fut>(work: W, options: TaskOptions) -> Task<T>
where
    T: Send + 'static,
    W: FnOnce(CancelSignal) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    create_task(work, options, Registration::Ambient)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_with_value() {
        let task = run_task(|_| async { Ok(7) }, TaskOptions::new());
        assert_eq!(task.join().await.unwrap(), 7);
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.result(), Some(7));
    }

    #[tokio::test]
    async fn failure_carries_task_name() {
        let task: Task<()> = run_task(
            |_| async { Err(anyhow::anyhow!("disk full")) },
            TaskOptions::named("flush"),
        );
        let err = task.join().await.unwrap_err();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(err.task_name(), Some("flush"));
        assert_eq!(err.to_string(), "[flush] disk full");
    }

    #[tokio::test]
    async fn parent_abort_cancels_task_and_runs_handlers() {
        let controller = CancelController::new();
        let task: Task<()> = run_task(
            |signal| async move {
                signal.aborted().await;
                Err(anyhow::anyhow!("unreachable value"))
            },
            TaskOptions::new().with_signal(controller.signal()),
        );

        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        task.on_cancel(move |_| order2.lock().push("handler"));

        controller.abort(CancelReason::UserAbort);
        let err = task.join().await.unwrap_err();

        assert_eq!(task.status(), TaskStatus::Canceled);
        assert_eq!(err.cancel_reason(), Some(&CancelReason::UserAbort));
        // Handler ran before the awaitable rejected.
        assert_eq!(*order.lock(), vec!["handler"]);
    }

    #[tokio::test]
    async fn born_canceled_when_parent_already_aborted() {
        let controller = CancelController::new();
        controller.abort(CancelReason::ScopeClosed);

        let invoked = Arc::new(AtomicBool::new(false));
        let invoked2 = invoked.clone();
        let task: Task<()> = run_task(
            move |_| async move {
                invoked2.store(true, Ordering::SeqCst);
                Ok(())
            },
            TaskOptions::new().with_signal(controller.signal()),
        );

        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(!invoked.load(Ordering::SeqCst), "work must not be invoked");
        let err = task.join().await.unwrap_err();
        assert_eq!(err.cancel_reason(), Some(&CancelReason::ScopeClosed));
    }

    #[tokio::test]
    async fn parent_task_normalizes_reason() {
        let controller = CancelController::new();
        let task: Task<()> = run_task(
            |signal| async move {
                signal.aborted().await;
                Err(anyhow::anyhow!("unreachable value"))
            },
            TaskOptions {
                signal: Some(controller.signal()),
                parent_task: true,
                ..TaskOptions::default()
            },
        );
        controller.abort(CancelReason::Custom("parent boom".into()));
        let err = task.join().await.unwrap_err();
        assert_eq!(err.cancel_reason(), Some(&CancelReason::ParentCanceled));
    }

    #[tokio::test]
    async fn on_cancel_after_cancellation_is_synchronous_and_once() {
        let controller = CancelController::new();
        let task: Task<()> = run_task(
            |signal| async move {
                signal.aborted().await;
                Err(anyhow::anyhow!("unreachable value"))
            },
            TaskOptions::new().with_signal(controller.signal()),
        );
        controller.abort(CancelReason::UserAbort);
        let _ = task.join().await;

        let hits = Arc::new(AtomicBool::new(false));
        let hits2 = hits.clone();
        task.on_cancel(move |reason| {
            assert_eq!(*reason, CancelReason::UserAbort);
            hits2.store(true, Ordering::SeqCst);
        });
        assert!(hits.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn handler_panic_does_not_stop_remaining_handlers() {
        let controller = CancelController::new();
        let task: Task<()> = run_task(
            |signal| async move {
                signal.aborted().await;
                Err(anyhow::anyhow!("unreachable value"))
            },
            TaskOptions::new().with_signal(controller.signal()),
        );
        let second_ran = Arc::new(AtomicBool::new(false));
        let second_ran2 = second_ran.clone();
        task.on_cancel(|_| panic!("first handler panics"));
        task.on_cancel(move |_| second_ran2.store(true, Ordering::SeqCst));

        controller.abort(CancelReason::UserAbort);
        let _ = task.join().await;
        assert!(second_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn late_work_settle_never_overwrites_cancellation() {
        let controller = CancelController::new();
        let task = run_task(
            // Work that ignores its signal and completes anyway.
            |_| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(1)
            },
            TaskOptions::new().with_signal(controller.signal()),
        );
        controller.abort(CancelReason::UserAbort);
        assert_eq!(task.status(), TaskStatus::Canceled);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(task.result().is_none());
    }

    #[tokio::test]
    async fn lifecycle_hooks_fire_in_order() {
        let saw_running = Arc::new(AtomicBool::new(false));
        let saw_running2 = saw_running.clone();
        let task = run_task(
            |_| async { Ok(5) },
            TaskOptions {
                hooks: LifecycleHooks {
                    on_complete: Some(Box::new(move |_| {
                        saw_running2.store(true, Ordering::SeqCst);
                    })),
                    ..LifecycleHooks::default()
                },
                ..TaskOptions::default()
            },
        );
        assert_eq!(task.join().await.unwrap(), 5);
        assert!(saw_running.load(Ordering::SeqCst));
    }
}
