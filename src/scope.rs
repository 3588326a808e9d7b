//! Scopes: bounded regions of execution that own a cancellation controller
//! and track the tasks bound to them.
//!
//! A scope is closed exactly once; closing aborts its signal with
//! [`CancelReason::ScopeClosed`] unless something already aborted it, which
//! cancels every scope-bound task that has not yet settled.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::TaskError;
use crate::observer::{self, ScopeKind, TaskEvent};
use crate::signal::{CancelController, CancelReason, CancelSignal};
use crate::store::{current_deadline, with_store, ScopeStore};
use crate::strict;
use crate::task::ScopeTask;

/// A scope-bound task together with the settlement state of its work.
///
/// A canceled task settles immediately, but its work future may keep
/// running until it observes the signal; `work_settled` tracks the work.
pub(crate) struct ScopeEntry {
    pub(crate) task: Arc<dyn ScopeTask>,
    pub(crate) work_settled: Arc<AtomicBool>,
}

impl Clone for ScopeEntry {
    fn clone(&self) -> Self {
        Self { task: self.task.clone(), work_settled: self.work_settled.clone() }
    }
}

/// A bounded region of execution owning a cancellation controller.
pub struct Scope {
    controller: CancelController,
    entries: Mutex<Vec<ScopeEntry>>,
    entry_added: Notify,
    id: Option<u64>,
    kind: ScopeKind,
    closed: AtomicBool,
}

impl Scope {
    pub(crate) fn new(kind: ScopeKind) -> Arc<Self> {
        let id = observer::next_debug_id();
        if let Some(scope_id) = id {
            observer::emit(|| TaskEvent::ScopeOpened { scope_id, kind });
        }
        Arc::new(Self {
            controller: CancelController::new(),
            entries: Mutex::new(Vec::new()),
            entry_added: Notify::new(),
            id,
            kind,
            closed: AtomicBool::new(false),
        })
    }

    /// The scope's cancellation signal, shared with its bound tasks.
    pub fn signal(&self) -> CancelSignal {
        self.controller.signal()
    }

    /// Aborts the scope's signal, cancelling every bound task that has not
    /// settled. Idempotent; the first abort fixes the reason.
    pub fn abort(&self, reason: CancelReason) {
        self.controller.abort(reason);
    }

    /// Closes the scope. The first close aborts with
    /// [`CancelReason::ScopeClosed`] unless already aborted.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.controller.is_aborted() {
            self.controller.abort(CancelReason::ScopeClosed);
        }
        if let Some(scope_id) = self.id {
            let kind = self.kind;
            observer::emit(|| TaskEvent::ScopeClosed { scope_id, kind });
        }
    }

    /// Bridges a parent signal: when the parent aborts, this scope aborts
    /// with the parent's reason. The bridge holds the scope weakly.
    pub(crate) fn link_parent(self: &Arc<Self>, parent: &CancelSignal) {
        let weak = Arc::downgrade(self);
        parent.on_abort(move |reason| {
            if let Some(scope) = weak.upgrade() {
                scope.abort(reason.clone());
            }
        });
    }

    pub(crate) fn register(&self, entry: ScopeEntry) {
        self.entries.lock().push(entry);
        self.entry_added.notify_waiters();
    }

    /// A future that resolves when a new entry is registered. Enable it
    /// before scanning entries to avoid missed registrations.
    pub(crate) fn entry_added_notified(&self) -> Notified<'_> {
        self.entry_added.notified()
    }

    pub(crate) fn entries_snapshot(&self) -> Vec<ScopeEntry> {
        self.entries.lock().clone()
    }

    /// Entries registered at or after `start`, for incremental draining.
    pub(crate) fn entries_from(&self, start: usize) -> Vec<ScopeEntry> {
        let entries = self.entries.lock();
        if start >= entries.len() {
            Vec::new()
        } else {
            entries[start..].to_vec()
        }
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn debug_id(&self) -> Option<u64> {
        self.id
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("kind", &self.kind)
            .field("entries", &self.entry_count())
            .field("aborted", &self.controller.is_aborted())
            .finish()
    }
}

/// Warns about every non-terminal entry. Fires only while strict mode is
/// enabled; called on scope exit.
fn warn_orphans(scope: &Scope) {
    if !strict::strict_enabled() {
        return;
    }
    for entry in scope.entries_snapshot() {
        if !entry.task.status().is_terminal() {
            strict::violation(match entry.task.task_name() {
                Some(name) => format!("scope exited with non-terminal task '{name}'"),
                None => "scope exited with a non-terminal task".to_string(),
            });
        }
    }
}

async fn run_scope_body<T, F, Fut>(scope: Arc<Scope>, f: F) -> Result<T, TaskError>
where
    F: FnOnce(Arc<Scope>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let store = ScopeStore { scope: scope.clone(), deadline: current_deadline() };
    let result = with_store(store, f(scope.clone())).await;
    warn_orphans(&scope);
    scope.close();
    result.map_err(|error| TaskError::failed(None, error))
}

/// Runs `f` inside a fresh scope and closes the scope on the way out.
///
/// Closing cancels any scope-bound task that is still running, so no work
/// outlives the call. When `parent` is given, a parent abort cancels this
/// scope with the parent's reason.
///
/// # Examples
///
/// ```
/// use taskscope::run_in_scope;
///
/// # async fn example() -> Result<(), taskscope::TaskError> {
/// let value = run_in_scope(|scope| async move {
///     assert!(!scope.signal().is_aborted());
///     Ok(21 * 2)
/// }, None).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn run_in_scope<T, F, Fut>(f: F, parent: Option<Arc<Scope>>) -> Result<T, TaskError>
where
    F: FnOnce(Arc<Scope>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let scope = Scope::new(ScopeKind::Scope);
    if let Some(parent) = parent {
        scope.link_parent(&parent.signal());
    }
    run_scope_body(scope, f).await
}

/// Options for [`with_strict_cancellation`].
#[derive(Debug, Clone, Copy)]
pub struct StrictCancellationOptions {
    /// How long canceled work may keep running before it is reported.
    pub warn_after: Duration,
}

impl Default for StrictCancellationOptions {
    fn default() -> Self {
        Self { warn_after: Duration::from_millis(2000) }
    }
}

/// Like [`run_in_scope`], plus a development-only watchdog: once the scope
/// aborts, any entry whose work has not settled within
/// [`warn_after`](StrictCancellationOptions::warn_after) gets one warning
/// naming the task and its elapsed time. The watchdog only runs in debug
/// builds and stands down as soon as all pending work settles.
pub async fn with_strict_cancellation<T, F, Fut>(
    f: F,
    options: StrictCancellationOptions,
) -> Result<T, TaskError>
where
    F: FnOnce(Arc<Scope>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let scope = Scope::new(ScopeKind::Scope);
    if cfg!(debug_assertions) {
        let weak = Arc::downgrade(&scope);
        let warn_after = options.warn_after;
        scope.signal().on_abort(move |_| {
            let Some(scope) = weak.upgrade() else { return };
            let pending: Vec<ScopeEntry> = scope
                .entries_snapshot()
                .into_iter()
                .filter(|entry| !entry.work_settled.load(Ordering::SeqCst))
                .collect();
            if pending.is_empty() {
                return;
            }
            let Ok(handle) = tokio::runtime::Handle::try_current() else { return };
            handle.spawn(watch_pending_work(pending, warn_after));
        });
    }
    run_scope_body(scope, f).await
}

async fn watch_pending_work(pending: Vec<ScopeEntry>, warn_after: Duration) {
    let deadline = Instant::now() + warn_after;
    loop {
        if pending.iter().all(|entry| entry.work_settled.load(Ordering::SeqCst)) {
            return;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for entry in &pending {
        if entry.work_settled.load(Ordering::SeqCst) {
            continue;
        }
        let elapsed = entry.task.started_at().elapsed();
        match entry.task.task_name() {
            Some(name) => tracing::warn!(
                target: "taskscope",
                task = %name,
                elapsed_ms = elapsed.as_millis() as u64,
                "canceled task has not settled; its work is ignoring the cancel signal"
            ),
            None => tracing::warn!(
                target: "taskscope",
                elapsed_ms = elapsed.as_millis() as u64,
                "canceled task has not settled; its work is ignoring the cancel signal"
            ),
        }
    }
}
