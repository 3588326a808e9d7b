//! Ambient scope threading across await points.
//!
//! Combinators install a [`ScopeStore`] as a task-local frame around the
//! user callback and around scope-bound work, so nested combinators and
//! helpers find the enclosing scope without threading it through every
//! signature. The previous frame is restored when the wrapped future
//! completes, across both success and error paths.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::scope::Scope;

tokio::task_local! {
    static SCOPE_STORE: ScopeStore;
}

/// The per-scope record threaded through asynchronous continuations.
#[derive(Clone)]
pub(crate) struct ScopeStore {
    pub(crate) scope: Arc<Scope>,
    /// Absolute deadline published by an active `timeout`, if any.
    pub(crate) deadline: Option<Instant>,
}

/// Runs `fut` with `store` as the innermost frame.
pub(crate) async fn with_store<F: Future>(store: ScopeStore, fut: F) -> F::Output {
    SCOPE_STORE.scope(store, fut).await
}

/// The innermost store, or `None` outside any scope.
pub(crate) fn current_store() -> Option<ScopeStore> {
    SCOPE_STORE.try_with(|store| store.clone()).ok()
}

/// Deadline inherited from the innermost frame, if one is active.
pub(crate) fn current_deadline() -> Option<Instant> {
    current_store().and_then(|store| store.deadline)
}

/// The scope the calling code is executing under, if any.
pub fn current_scope() -> Option<Arc<Scope>> {
    current_store().map(|store| store.scope)
}

/// Time left until the ambient deadline, clamped at zero.
///
/// Returns `None` when no `timeout` is active on the current frame.
pub fn scope_deadline_remaining() -> Option<Duration> {
    current_deadline().map(|deadline| deadline.saturating_duration_since(Instant::now()))
}
