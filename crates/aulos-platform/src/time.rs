//! Scheduled callbacks on the Tokio timer.
//!
//! Both [`Deadline`] and [`Ticker`] must be created from within a Tokio
//! runtime context.

use std::time::Duration;

pub use tokio::time::{Instant, sleep};
use tokio::{
    task::AbortHandle,
    time::{MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;

/// One-shot callback fired after a delay.
///
/// Dropping the handle cancels the callback if it has not fired yet.
#[derive(Debug)]
pub struct Deadline {
    handle: AbortHandle,
}

impl Deadline {
    /// Schedule `f` to run once `delay` has elapsed.
    ///
    /// A zero delay fires on the next turn of the runtime.
    pub fn schedule<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let at = Instant::now() + delay;
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep_until(at).await;
            }
            f();
        });
        Self {
            handle: task.abort_handle(),
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Periodic callback.
///
/// The first call happens one `period` after creation. Missed ticks are
/// delayed rather than bursted. Dropping the handle stops the ticker.
#[derive(Debug)]
pub struct Ticker {
    cancel: CancellationToken,
}

impl Ticker {
    /// Start calling `f` every `period`.
    pub fn spawn<F>(period: Duration, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = interval.tick() => f(),
                }
            }
            tracing::trace!(?period, "ticker stopped");
        });
        Self { cancel }
    }

    /// Stop the ticker. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
