//! # taskscope
//!
//! Structured concurrency for async Rust: every task belongs to a scope,
//! and when a scope ends — normally, by failure, or by first-result — every
//! task still bound to it is cancelled before control returns to the
//! caller. No leaked background work.
//!
//! ## Features
//!
//! - **Tasks with explicit lifecycles**: a [`Task`] is awaitable *and*
//!   answers synchronous questions — `status()`, `result()`, `error()` —
//!   with cancel hooks that run before the awaitable rejects
//! - **Reason-carrying cancellation**: a one-shot broadcast
//!   [`CancelSignal`] whose first abort fixes a tagged [`CancelReason`]
//! - **Scope-creating combinators**: [`sync`] (all-must-succeed), [`race`]
//!   (first settle wins, cancel the rest), [`rush`] (first settle, wait for
//!   the rest), [`branch`] (fire-and-hold), [`spawn`] / [`spawn_detached`]
//!   (escape hatches with and without a parent link) and [`spawn_scope`]
//! - **Cancellation-aware helpers**: [`sleep`], deadline-inheriting
//!   [`timeout`], [`retry`] with backoff, and a FIFO [`Limiter`]
//! - **Observability on demand**: lifecycle events that cost nothing until
//!   [`enable_task_debug`] turns them on, and a strict mode that flags
//!   unstructured tasks, ignored cancellations and orphans
//!
//! ## Quick start
//!
//! ```
//! use taskscope::sync;
//!
//! # async fn example() -> Result<(), taskscope::TaskError> {
//! let total = sync(|ctx| async move {
//!     let fast = ctx.spawn_named("fast", |_| async { Ok(1) });
//!     let slow = ctx.spawn_named("slow", |_| async { Ok(2) });
//!     Ok(fast.join().await? + slow.join().await?)
//! })
//! .await?;
//! assert_eq!(total, 3);
//! # Ok(())
//! # }
//! ```
//!
//! If either task had failed, the other would have been cancelled with
//! [`CancelReason::ScopeClosed`] and `sync` would have rejected with the
//! first failure.
//!
//! ## Racing with cleanup
//!
//! ```
//! use std::time::Duration;
//! use taskscope::race;
//!
//! # async fn example() -> Result<(), taskscope::TaskError> {
//! let winner = race(|ctx| async move {
//!     ctx.spawn_named("primary", {
//!         let ctx = ctx.clone();
//!         move |_| async move {
//!             ctx.sleep(Duration::from_millis(5)).await?;
//!             Ok("primary")
//!         }
//!     });
//!     ctx.spawn_named("fallback", |signal| async move {
//!         taskscope::sleep(Duration::from_secs(60), &signal).await?;
//!         Ok("fallback")
//!     });
//!     Ok(())
//! })
//! .await?;
//! assert_eq!(winner, "primary");
//! # Ok(())
//! # }
//! ```
//!
//! Cancellation is strictly cooperative: work receives its task's owned
//! [`CancelSignal`] and is expected to bail out when it fires. A task that
//! ignores its signal delays `sync`/`rush` — and gets reported by
//! [`with_strict_cancellation`] in debug builds.

mod combinators;
mod context;
mod error;
mod limit;
mod observer;
mod retry;
mod scope;
mod signal;
mod store;
mod strict;
mod task;
mod timing;

pub use combinators::{branch, race, rush, spawn, spawn_detached, spawn_scope, sync};
pub use context::TaskContext;
pub use error::{CanceledError, StrictModeError, TaskError, TimeoutError};
pub use limit::{LimitOptions, Limiter};
pub use observer::{
    disable_task_debug, enable_task_debug, subscribe_task_debug, DebugSubscription,
    LoggingSubscriber, MetricsSubscriber, ScopeKind, TaskEvent, TaskTiming,
};
pub use retry::{retry, Backoff, RetryOptions};
pub use scope::{
    run_in_scope, with_strict_cancellation, Scope, StrictCancellationOptions,
};
pub use signal::{CancelController, CancelReason, CancelSignal};
pub use store::{current_scope, scope_deadline_remaining};
pub use strict::{disable_strict_mode, enable_strict_mode, StrictOptions, StrictPolicy};
pub use task::{run_task, LifecycleHooks, Task, TaskOptions, TaskStatus};
pub use timing::{sleep, timeout};
