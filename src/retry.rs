//! Cancellation-aware retry with fixed or exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::CanceledError;
use crate::signal::CancelSignal;
use crate::timing::sleep;

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Wait the initial delay between every pair of attempts.
    #[default]
    Fixed,
    /// Double the delay after each failed attempt.
    Exponential,
}

/// Options for [`retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Retries after the first attempt; the total attempt count is
    /// `retries + 1`.
    pub retries: u32,
    /// Delay strategy.
    pub backoff: Backoff,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the exponential delay, when set.
    pub max_delay: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Backoff::Fixed,
            initial_delay: Duration::from_millis(50),
            max_delay: None,
        }
    }
}

impl RetryOptions {
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                self.initial_delay.checked_mul(factor).unwrap_or(Duration::MAX)
            }
        };
        match self.max_delay {
            Some(max) => base.min(max),
            None => base,
        }
    }
}

/// Runs `f` up to `1 + retries` times, waiting between attempts.
///
/// The signal is checked before every attempt and before every wait; once
/// aborted, the call rejects with the signal's reason and schedules nothing
/// further. When the final attempt fails, its error propagates.
///
/// # Examples
///
/// ```
/// use taskscope::{retry, RetryOptions, CancelController};
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// # async fn example() -> anyhow::Result<()> {
/// let attempts = AtomicU32::new(0);
/// let controller = CancelController::new();
///
/// let value = retry(
///     |_signal| async {
///         if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
///             Err(anyhow::anyhow!("flaky"))
///         } else {
///             Ok("stable")
///         }
///     },
///     RetryOptions::default(),
///     &controller.signal(),
/// )
/// .await?;
/// assert_eq!(value, "stable");
/// # Ok(())
/// # }
/// ```
pub async fn retry<T, F, Fut>(
    mut f: F,
    options: RetryOptions,
    signal: &CancelSignal,
) -> anyhow::Result<T>
where
    F: FnMut(CancelSignal) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = options.retries.saturating_add(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        if let Some(reason) = signal.reason() {
            return Err(CanceledError { reason }.into());
        }
        match f(signal.clone()).await {
            Ok(value) => return Ok(value),
            Err(error) => last_error = Some(error),
        }
        if attempt + 1 < attempts {
            if let Some(reason) = signal.reason() {
                return Err(CanceledError { reason }.into());
            }
            sleep(options.delay_for(attempt), signal).await?;
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("retry ran zero attempts")))
}
