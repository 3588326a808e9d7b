//! The context handed to combinator callbacks.
//!
//! A [`TaskContext`] starts scope-bound tasks and exposes the
//! cancellation-aware helpers pre-bound to the scope's signal and deadline.
//! Clones share the same scope, so a context captured by task work lets
//! tasks start further scope-bound tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;

use crate::error::{CanceledError, TaskError};
use crate::limit::{LimitOptions, Limiter};
use crate::retry::{retry, RetryOptions};
use crate::scope::Scope;
use crate::signal::CancelSignal;
use crate::task::{create_task, Registration, Task, TaskOptions};
use crate::timing::{sleep, timeout};

/// Context for starting tasks inside a combinator's scope.
///
/// The type parameter is the output type of the scope-bound tasks this
/// context starts; a combinator races and joins those tasks, so they share
/// one output type the way a joined set of futures does.
pub struct TaskContext<T> {
    scope: Arc<Scope>,
    tasks: Arc<Mutex<Vec<Task<T>>>>,
}

impl<T> Clone for TaskContext<T> {
    fn clone(&self) -> Self {
        Self { scope: self.scope.clone(), tasks: self.tasks.clone() }
    }
}

impl<T: Send + 'static> TaskContext<T> {
    pub(crate) fn new(scope: Arc<Scope>) -> Self {
        Self { scope, tasks: Arc::new(Mutex::new(Vec::new())) }
    }

    /// The scope this context belongs to.
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Starts a scope-bound task.
    ///
    /// The task's parent signal is the scope's signal: closing or aborting
    /// the scope cancels it. Its cancellation is consumed silently unless
    /// the task is awaited.
    pub fn spawn<W, Fut>(&self, work: W) -> Task<T>
    where
        W: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.spawn_with_options(TaskOptions::new(), work)
    }

    /// Starts a named scope-bound task. The name feeds diagnostics and the
    /// task-name annotation on errors; it never affects behavior.
    pub fn spawn_named<W, Fut>(&self, name: impl Into<String>, work: W) -> Task<T>
    where
        W: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.spawn_with_options(TaskOptions::named(name), work)
    }

    /// Starts a scope-bound task with full options. The parent signal is
    /// always the scope's signal; `options.signal` is ignored.
    pub fn spawn_with_options<W, Fut>(&self, options: TaskOptions, work: W) -> Task<T>
    where
        W: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let task = create_task(work, options, Registration::Scope(self.scope.clone()));
        self.tasks.lock().push(task.clone());
        task
    }

    /// Scope-aware [`sleep`](crate::sleep) bound to the scope's signal.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CanceledError> {
        sleep(duration, &self.scope.signal()).await
    }

    /// Scope-aware [`timeout`](crate::timeout); nested calls inherit the
    /// tightest enclosing deadline.
    pub async fn timeout<R, W, Fut>(&self, duration: Duration, work: W) -> anyhow::Result<R>
    where
        W: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        timeout(duration, work, &self.scope, &self.scope.signal()).await
    }

    /// Scope-aware [`retry`](crate::retry) bound to the scope's signal.
    pub async fn retry<R, F, Fut>(&self, f: F, options: RetryOptions) -> anyhow::Result<R>
    where
        F: FnMut(CancelSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        retry(f, options, &self.scope.signal()).await
    }

    /// A [`Limiter`] bound to the scope's signal.
    pub fn limit(&self, concurrency: usize) -> Limiter {
        Limiter::new(concurrency, self.scope.signal())
    }

    /// A [`Limiter`] with explicit options, bound to the scope's signal.
    pub fn limit_with(&self, concurrency: usize, options: LimitOptions) -> Limiter {
        Limiter::with_options(concurrency, self.scope.signal(), options)
    }

    pub(crate) fn tasks_snapshot(&self) -> Vec<Task<T>> {
        self.tasks.lock().clone()
    }
}

impl<T: Clone + Send + 'static> TaskContext<T> {
    /// Waits for every task; resolves with their values in input order or
    /// rejects with the first error observed.
    pub async fn join_all(&self, tasks: &[Task<T>]) -> Result<Vec<T>, TaskError> {
        let mut settles: FuturesUnordered<_> = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| async move { (index, task.join().await) })
            .collect();
        let mut values: Vec<Option<T>> = tasks.iter().map(|_| None).collect();
        while let Some((index, outcome)) = settles.next().await {
            values[index] = Some(outcome?);
        }
        Ok(values.into_iter().flatten().collect())
    }

    /// Resolves or rejects with the first task to settle.
    pub async fn race_tasks(&self, tasks: &[Task<T>]) -> Result<T, TaskError> {
        let mut settles: FuturesUnordered<_> = tasks.iter().map(|task| task.join()).collect();
        match settles.next().await {
            Some(outcome) => outcome,
            None => Err(TaskError::failed(
                None,
                anyhow::anyhow!("race_tasks: no tasks given"),
            )),
        }
    }

    /// Waits for every task and returns all outcomes in input order.
    pub async fn join_settled(&self, tasks: &[Task<T>]) -> Vec<Result<T, TaskError>> {
        let mut settles: FuturesUnordered<_> = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| async move { (index, task.join().await) })
            .collect();
        let mut outcomes: Vec<Option<Result<T, TaskError>>> = tasks.iter().map(|_| None).collect();
        while let Some((index, outcome)) = settles.next().await {
            outcomes[index] = Some(outcome);
        }
        outcomes.into_iter().flatten().collect()
    }
}
