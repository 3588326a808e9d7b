//! Lifecycle event emission for scopes and tasks.
//!
//! Emission is zero-cost while debugging is disabled: no ids are assigned,
//! no event values are built and subscribers are never consulted. Enabling
//! with [`enable_task_debug`] turns on id assignment for scopes and tasks
//! created afterwards; pre-existing ones stay silent.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::task::TaskStatus;

/// Which combinator opened a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// A plain [`run_in_scope`](crate::run_in_scope) scope.
    Scope,
    /// [`sync`](crate::sync).
    Sync,
    /// [`race`](crate::race).
    Race,
    /// [`rush`](crate::rush).
    Rush,
    /// [`branch`](crate::branch).
    Branch,
    /// [`spawn`](crate::spawn).
    Spawn,
    /// [`spawn_scope`](crate::spawn_scope).
    SpawnScope,
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScopeKind::Scope => "scope",
            ScopeKind::Sync => "sync",
            ScopeKind::Race => "race",
            ScopeKind::Rush => "rush",
            ScopeKind::Branch => "branch",
            ScopeKind::Spawn => "spawn",
            ScopeKind::SpawnScope => "spawnScope",
        };
        f.write_str(name)
    }
}

/// Start/end instants of a task, as carried by [`TaskEvent::TaskUpdated`].
#[derive(Debug, Clone, Copy)]
pub struct TaskTiming {
    /// When the task was created.
    pub started: Instant,
    /// When the task reached a terminal status, if it has.
    pub ended: Option<Instant>,
}

/// A lifecycle event observed by debug subscribers.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A scope was opened by a combinator or `run_in_scope`.
    ScopeOpened {
        /// Debug id of the scope.
        scope_id: u64,
        /// The combinator that opened it.
        kind: ScopeKind,
    },
    /// A scope closed.
    ScopeClosed {
        /// Debug id of the scope.
        scope_id: u64,
        /// The combinator that opened it.
        kind: ScopeKind,
    },
    /// A task was created.
    TaskRegistered {
        /// Debug id of the task.
        task_id: u64,
        /// Task name, when one was given.
        name: Option<Arc<str>>,
        /// Debug id of the scope the task is bound to, when any.
        parent_scope_id: Option<u64>,
    },
    /// A task changed status.
    TaskUpdated {
        /// Debug id of the task.
        task_id: u64,
        /// The new status.
        status: TaskStatus,
        /// Start/end instants.
        timing: TaskTiming,
    },
}

type Subscriber = Arc<dyn Fn(&TaskEvent) + Send + Sync>;
type DebugLogger = Arc<dyn Fn(&str) + Send + Sync>;

struct DebugState {
    enabled: AtomicBool,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, Subscriber)>>,
    next_subscriber_id: AtomicU64,
    logger: RwLock<Option<DebugLogger>>,
}

static DEBUG: Lazy<DebugState> = Lazy::new(|| DebugState {
    enabled: AtomicBool::new(false),
    next_id: AtomicU64::new(1),
    subscribers: RwLock::new(Vec::new()),
    next_subscriber_id: AtomicU64::new(1),
    logger: RwLock::new(None),
});

/// Enables lifecycle event emission process-wide.
///
/// `logger` receives reports about subscribers that panicked; when `None`,
/// those reports go through `tracing::error!`.
pub fn enable_task_debug(logger: Option<DebugLogger>) {
    *DEBUG.logger.write() = logger;
    DEBUG.enabled.store(true, Ordering::SeqCst);
}

/// Disables event emission. Existing subscriptions stay registered.
pub fn disable_task_debug() {
    DEBUG.enabled.store(false, Ordering::SeqCst);
}

/// Registers a subscriber for lifecycle events.
///
/// Subscriber panics are caught and logged; they never alter task or scope
/// outcomes. Returns a handle whose [`DebugSubscription::unsubscribe`]
/// removes the subscriber.
pub fn subscribe_task_debug(
    subscriber: impl Fn(&TaskEvent) + Send + Sync + 'static,
) -> DebugSubscription {
    let id = DEBUG.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
    DEBUG.subscribers.write().push((id, Arc::new(subscriber)));
    DebugSubscription { id }
}

/// Handle returned by [`subscribe_task_debug`].
#[derive(Debug)]
pub struct DebugSubscription {
    id: u64,
}

impl DebugSubscription {
    /// Removes the subscriber.
    pub fn unsubscribe(self) {
        DEBUG.subscribers.write().retain(|(id, _)| *id != self.id);
    }
}

pub(crate) fn debug_enabled() -> bool {
    DEBUG.enabled.load(Ordering::SeqCst)
}

/// A fresh debug id, or `None` while debugging is disabled.
pub(crate) fn next_debug_id() -> Option<u64> {
    debug_enabled().then(|| DEBUG.next_id.fetch_add(1, Ordering::Relaxed))
}

/// Builds and delivers an event, but only when debugging is enabled.
pub(crate) fn emit(build: impl FnOnce() -> TaskEvent) {
    if !debug_enabled() {
        return;
    }
    let subscribers: Vec<Subscriber> = {
        let guard = DEBUG.subscribers.read();
        guard.iter().map(|(_, s)| s.clone()).collect()
    };
    if subscribers.is_empty() {
        return;
    }
    let event = build();
    for subscriber in subscribers {
        if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
            let message = format!("task debug subscriber panicked on {event:?}");
            match &*DEBUG.logger.read() {
                Some(logger) => logger(&message),
                None => tracing::error!(target: "taskscope", "{message}"),
            }
        }
    }
}

/// Subscriber that forwards every event through `tracing::debug!`.
///
/// Handy during development; production code usually installs its own
/// subscriber.
pub struct LoggingSubscriber;

impl LoggingSubscriber {
    /// Registers the logging subscriber and returns its subscription.
    pub fn attach() -> DebugSubscription {
        subscribe_task_debug(|event| match event {
            TaskEvent::ScopeOpened { scope_id, kind } => {
                tracing::debug!(target: "taskscope", scope_id = *scope_id, %kind, "scope opened");
            }
            TaskEvent::ScopeClosed { scope_id, kind } => {
                tracing::debug!(target: "taskscope", scope_id = *scope_id, %kind, "scope closed");
            }
            TaskEvent::TaskRegistered { task_id, name, parent_scope_id } => {
                tracing::debug!(
                    target: "taskscope",
                    task_id = *task_id,
                    name = name.as_deref(),
                    parent_scope_id = *parent_scope_id,
                    "task registered"
                );
            }
            TaskEvent::TaskUpdated { task_id, status, .. } => {
                tracing::debug!(target: "taskscope", task_id = *task_id, ?status, "task updated");
            }
        })
    }
}

/// Subscriber that counts events with atomic counters.
///
/// Cheap to clone; clones share the same counters.
///
/// # Examples
///
/// ```
/// use taskscope::MetricsSubscriber;
///
/// let metrics = MetricsSubscriber::new();
/// let subscription = metrics.attach();
/// // ... run work ...
/// println!("{} tasks registered", metrics.tasks_registered());
/// subscription.unsubscribe();
/// ```
#[derive(Clone)]
pub struct MetricsSubscriber {
    inner: Arc<MetricsCounters>,
}

#[derive(Default)]
struct MetricsCounters {
    scopes_opened: AtomicU64,
    scopes_closed: AtomicU64,
    tasks_registered: AtomicU64,
    task_updates: AtomicU64,
}

impl MetricsSubscriber {
    /// Creates a subscriber with all counters at zero.
    pub fn new() -> Self {
        Self { inner: Arc::new(MetricsCounters::default()) }
    }

    /// Registers this subscriber and returns its subscription.
    pub fn attach(&self) -> DebugSubscription {
        let counters = self.inner.clone();
        subscribe_task_debug(move |event| match event {
            TaskEvent::ScopeOpened { .. } => {
                counters.scopes_opened.fetch_add(1, Ordering::Relaxed);
            }
            TaskEvent::ScopeClosed { .. } => {
                counters.scopes_closed.fetch_add(1, Ordering::Relaxed);
            }
            TaskEvent::TaskRegistered { .. } => {
                counters.tasks_registered.fetch_add(1, Ordering::Relaxed);
            }
            TaskEvent::TaskUpdated { .. } => {
                counters.task_updates.fetch_add(1, Ordering::Relaxed);
            }
        })
    }

    /// Number of `ScopeOpened` events observed.
    pub fn scopes_opened(&self) -> u64 {
        self.inner.scopes_opened.load(Ordering::Relaxed)
    }

    /// Number of `ScopeClosed` events observed.
    pub fn scopes_closed(&self) -> u64 {
        self.inner.scopes_closed.load(Ordering::Relaxed)
    }

    /// Number of `TaskRegistered` events observed.
    pub fn tasks_registered(&self) -> u64 {
        self.inner.tasks_registered.load(Ordering::Relaxed)
    }

    /// Number of `TaskUpdated` events observed.
    pub fn task_updates(&self) -> u64 {
        self.inner.task_updates.load(Ordering::Relaxed)
    }
}

impl Default for MetricsSubscriber {
    fn default() -> Self {
        Self::new()
    }
}
