//! Strict-mode misuse checks.
//!
//! Strict mode surfaces patterns that defeat structured concurrency:
//! unstructured tasks, cancellations nobody cleans up after, orphans left
//! behind at scope exit and branches with no enclosing scope. The checks
//! fire at fixed points in the core; this module only decides what happens
//! when one fires.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::StrictModeError;

/// What a strict-mode violation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictPolicy {
    /// Emit a warning through `tracing::warn!` and continue.
    #[default]
    Warn,
    /// Panic with the formatted [`StrictModeError`].
    Deny,
}

type WarnCallback = Arc<dyn Fn(&StrictModeError) + Send + Sync>;

/// Configuration for [`enable_strict_mode`].
#[derive(Clone, Default)]
pub struct StrictOptions {
    /// Violation policy; defaults to [`StrictPolicy::Warn`].
    pub policy: StrictPolicy,
    /// Invoked for every violation before the policy applies.
    pub on_warn: Option<WarnCallback>,
}

struct StrictState {
    enabled: bool,
    options: StrictOptions,
}

static STRICT: Lazy<RwLock<StrictState>> = Lazy::new(|| {
    RwLock::new(StrictState { enabled: false, options: StrictOptions::default() })
});

/// Enables strict mode process-wide.
pub fn enable_strict_mode(options: StrictOptions) {
    let mut state = STRICT.write();
    state.enabled = true;
    state.options = options;
}

/// Disables strict mode.
pub fn disable_strict_mode() {
    STRICT.write().enabled = false;
}

/// Reports a violation per the active policy. No-op while strict mode is
/// disabled.
pub(crate) fn violation(message: impl Into<String>) {
    let (policy, on_warn) = {
        let state = STRICT.read();
        if !state.enabled {
            return;
        }
        (state.options.policy, state.options.on_warn.clone())
    };
    let error = StrictModeError::new(message);
    if let Some(on_warn) = on_warn {
        on_warn(&error);
    }
    match policy {
        StrictPolicy::Warn => tracing::warn!(target: "taskscope", "{error}"),
        StrictPolicy::Deny => panic!("{error}"),
    }
}

pub(crate) fn strict_enabled() -> bool {
    STRICT.read().enabled
}
