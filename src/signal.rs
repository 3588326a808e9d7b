//! Broadcast, one-shot cancellation with a reason.
//!
//! Cancellation flows through a [`CancelSignal`]: a cheap, cloneable handle
//! that becomes aborted exactly once and then carries the abort reason
//! forever. The write side is a [`CancelController`]; scopes and tasks each
//! exclusively own their controller and hand out signals to the work they
//! supervise.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Why a signal was aborted.
///
/// The core only ever aborts with one of the tagged variants; reasons
/// supplied by user code travel through [`CancelReason::Custom`] unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A [`timeout`](crate::timeout) budget elapsed. `ms` is the effective
    /// budget after deadline inheritance.
    Timeout {
        /// Effective budget in milliseconds.
        ms: u64,
    },
    /// User code aborted the scope directly.
    UserAbort,
    /// The owning scope closed.
    ScopeClosed,
    /// The parent task was canceled.
    ParentCanceled,
    /// A reason supplied by user code, passed through unchanged.
    Custom(Arc<str>),
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Timeout { ms } => write!(f, "timeout after {ms} ms"),
            CancelReason::UserAbort => write!(f, "user abort"),
            CancelReason::ScopeClosed => write!(f, "scope closed"),
            CancelReason::ParentCanceled => write!(f, "parent canceled"),
            CancelReason::Custom(reason) => write!(f, "{reason}"),
        }
    }
}

type AbortListener = Box<dyn FnOnce(&CancelReason) + Send>;

struct SignalState {
    reason: Option<CancelReason>,
    listeners: Vec<AbortListener>,
}

struct SignalInner {
    state: Mutex<SignalState>,
    notify: Notify,
}

/// Read side of a cancellation pair. Cloning shares the same underlying
/// signal; two clones compare identical under [`CancelSignal::same_signal`].
///
/// # Examples
///
/// ```
/// use taskscope::{CancelController, CancelReason};
///
/// # async fn example() {
/// let controller = CancelController::new();
/// let signal = controller.signal();
///
/// signal.on_abort(|reason| println!("aborted: {reason}"));
/// controller.abort(CancelReason::UserAbort);
/// assert!(signal.is_aborted());
/// # }
/// ```
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<SignalInner>,
}

impl CancelSignal {
    /// True once the owning controller has aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().reason.is_some()
    }

    /// The abort reason, fixed by the first abort.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.state.lock().reason.clone()
    }

    /// Registers a one-shot abort listener.
    ///
    /// If the signal is already aborted, `listener` is invoked synchronously
    /// with the stored reason. Every listener runs at most once.
    pub fn on_abort(&self, listener: impl FnOnce(&CancelReason) + Send + 'static) {
        let already = {
            let mut state = self.inner.state.lock();
            match &state.reason {
                Some(reason) => Some(reason.clone()),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        if let Some(reason) = already {
            listener(&reason);
        }
    }

    /// Resolves with the abort reason once the signal aborts.
    ///
    /// Suitable for racing against work in `tokio::select!`.
    pub async fn aborted(&self) -> CancelReason {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// True when both handles observe the same underlying signal.
    pub fn same_signal(a: &CancelSignal, b: &CancelSignal) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Write side of a cancellation pair. Aborting is idempotent; the first
/// abort fixes the reason.
#[derive(Clone)]
pub struct CancelController {
    signal: CancelSignal,
}

impl CancelController {
    /// Creates a fresh, un-aborted controller.
    pub fn new() -> Self {
        Self {
            signal: CancelSignal {
                inner: Arc::new(SignalInner {
                    state: Mutex::new(SignalState { reason: None, listeners: Vec::new() }),
                    notify: Notify::new(),
                }),
            },
        }
    }

    /// A handle to the read side.
    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    /// True once this controller has aborted.
    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }

    /// Aborts the signal. The first call fixes the reason and runs the
    /// registered listeners in registration order; later calls are no-ops.
    pub fn abort(&self, reason: CancelReason) {
        let listeners = {
            let mut state = self.signal.inner.state.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.listeners)
        };
        // Wake `aborted()` waiters before running listeners so racing
        // helpers observe the abort no later than bridged children do.
        self.signal.inner.notify.notify_waiters();
        for listener in listeners {
            listener(&reason);
        }
    }
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelController")
            .field("reason", &self.signal.reason())
            .finish()
    }
}
