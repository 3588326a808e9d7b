//! Error types for tasks, scopes and helpers.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::signal::CancelReason;

/// Outcome error of awaiting a [`Task`](crate::Task) or a combinator.
///
/// A task that failed carries the error its work returned, unchanged apart
/// from the task-name annotation; a task that was canceled carries the
/// cancellation reason.
///
/// # Examples
///
/// ```
/// use taskscope::TaskError;
///
/// # fn handle(err: TaskError) {
/// match err {
///     TaskError::Failed { ref source, .. } => eprintln!("work error: {source}"),
///     TaskError::Canceled { ref reason, .. } => eprintln!("canceled: {reason}"),
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum TaskError {
    /// The task's work returned an error.
    Failed {
        /// Name of the task, when one was given.
        task_name: Option<Arc<str>>,
        /// The error the work function returned.
        source: Arc<anyhow::Error>,
    },
    /// The task was canceled before its work settled.
    Canceled {
        /// Name of the task, when one was given.
        task_name: Option<Arc<str>>,
        /// The reason the owning signal was aborted with.
        reason: CancelReason,
    },
}

impl TaskError {
    pub(crate) fn failed(task_name: Option<Arc<str>>, source: anyhow::Error) -> Self {
        TaskError::Failed { task_name, source: Arc::new(source) }
    }

    pub(crate) fn canceled(task_name: Option<Arc<str>>, reason: CancelReason) -> Self {
        TaskError::Canceled { task_name, reason }
    }

    /// Name of the task this error came from, when the task was named.
    pub fn task_name(&self) -> Option<&str> {
        match self {
            TaskError::Failed { task_name, .. } | TaskError::Canceled { task_name, .. } => {
                task_name.as_deref()
            }
        }
    }

    /// The cancellation reason, when this error is a cancellation.
    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        match self {
            TaskError::Canceled { reason, .. } => Some(reason),
            TaskError::Failed { .. } => None,
        }
    }

    /// The underlying work error, when this error is a failure.
    pub fn work_error(&self) -> Option<&anyhow::Error> {
        match self {
            TaskError::Failed { source, .. } => Some(source),
            TaskError::Canceled { .. } => None,
        }
    }

    /// True when the task was canceled rather than failed.
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled { .. })
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // A failure propagates the work error unchanged; the name is an
            // annotation, not a rewrite.
            TaskError::Failed { task_name: None, source } => write!(f, "{source}"),
            TaskError::Failed { task_name: Some(name), source } => {
                write!(f, "[{name}] {source}")
            }
            TaskError::Canceled { task_name: None, reason } => {
                write!(f, "task canceled: {reason}")
            }
            TaskError::Canceled { task_name: Some(name), reason } => {
                write!(f, "task '{name}' canceled: {reason}")
            }
        }
    }
}

impl std::error::Error for TaskError {}

/// Error a cancellation-aware helper rejects with when its signal aborts.
#[derive(Debug, Clone, Error)]
#[error("canceled: {reason}")]
pub struct CanceledError {
    /// The reason the signal was aborted with.
    pub reason: CancelReason,
}

/// Error [`timeout`](crate::timeout) rejects with when the budget elapses.
///
/// The embedded budget is the *effective* one: a nested timeout inherits the
/// remaining deadline of its enclosing timeout, so `ms` may be smaller than
/// the requested budget.
#[derive(Debug, Clone, Error)]
#[error("Timeout after {ms} ms")]
pub struct TimeoutError {
    /// Effective budget in milliseconds.
    pub ms: u64,
}

/// A strict-mode violation.
///
/// Emitted as a warning under the default policy, or panicked under
/// [`StrictPolicy::Deny`](crate::StrictPolicy).
#[derive(Debug, Clone, Error)]
#[error("strict mode violation: {message}")]
pub struct StrictModeError {
    /// Human-readable description of the misuse.
    pub message: String,
}

impl StrictModeError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_display_propagates_message_unchanged() {
        let err = TaskError::failed(None, anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn failed_display_carries_task_name() {
        let err = TaskError::failed(Some("fetch".into()), anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "[fetch] boom");
        assert_eq!(err.task_name(), Some("fetch"));
    }

    #[test]
    fn canceled_display_includes_reason() {
        let err = TaskError::canceled(Some("fetch".into()), CancelReason::ScopeClosed);
        assert_eq!(err.to_string(), "task 'fetch' canceled: scope closed");
        assert!(err.is_canceled());
    }

    #[test]
    fn timeout_error_message() {
        assert_eq!(TimeoutError { ms: 50 }.to_string(), "Timeout after 50 ms");
    }
}
