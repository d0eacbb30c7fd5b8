use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use aulos_events::Counter;
use aulos_platform::{Deadline, Mutex};

use crate::{error::Failure, types::RetryOptions};

/// What [`RetryController::on_failure`] did with a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Not a recoverable network failure. The caller must surface it.
    NotRetryable,
    /// A delayed retry is already pending and absorbs this failure.
    Coalesced,
    /// The retry callback was invoked synchronously.
    Immediate { failures: u32 },
    /// The retry callback will run after `delay`.
    Scheduled { failures: u32, delay: Duration },
    /// Too many consecutive failures. The caller must surface it.
    Exhausted { failures: u32 },
}

impl RetryDecision {
    /// Whether the failure goes back to the player instead of being retried.
    pub fn surfaces(&self) -> bool {
        matches!(self, Self::NotRetryable | Self::Exhausted { .. })
    }
}

struct Pending {
    generation: u64,
    deadline: Option<Deadline>,
}

struct Inner {
    options: RetryOptions,
    failures: Counter,
    pending: Mutex<Pending>,
}

/// Consecutive-failure backoff.
///
/// The first `threshold` failures are retried on the spot. Past that, the
/// retry is delayed by `2^failures * base_delay` and further failures are
/// coalesced until it fires. A single success forgives every prior failure.
///
/// Cloning yields a handle to the same counter.
#[derive(Clone)]
pub struct RetryController {
    inner: Arc<Inner>,
}

impl fmt::Debug for RetryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryController")
            .field("options", &self.inner.options)
            .field("failures", &self.inner.failures.get())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl RetryController {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                failures: Counter::new(),
                pending: Mutex::new(Pending {
                    generation: 0,
                    deadline: None,
                }),
            }),
        }
    }

    /// Handle a failure, possibly invoking or scheduling `retry`.
    ///
    /// Scheduling requires a Tokio runtime.
    pub fn on_failure<F>(&self, failure: &Failure, retry: F) -> RetryDecision
    where
        F: FnOnce() + Send + 'static,
    {
        if !failure.is_retryable() {
            tracing::debug!(%failure, "failure not eligible for retry");
            return RetryDecision::NotRetryable;
        }

        let mut pending = self.inner.pending.lock();
        if pending.deadline.is_some() {
            tracing::trace!(%failure, "retry already pending, failure coalesced");
            return RetryDecision::Coalesced;
        }

        let failures = u32::try_from(self.inner.failures.increment()).unwrap_or(u32::MAX);
        let options = self.inner.options;

        if options.max_failures.is_some_and(|max| failures > max) {
            tracing::warn!(failures, %failure, "retries exhausted");
            return RetryDecision::Exhausted { failures };
        }

        if failures <= options.threshold {
            drop(pending);
            tracing::debug!(failures, %failure, "retrying immediately");
            retry();
            return RetryDecision::Immediate { failures };
        }

        let delay = backoff(options.base_delay, failures);
        pending.generation += 1;
        let generation = pending.generation;
        let inner = Arc::downgrade(&self.inner);
        pending.deadline = Some(Deadline::schedule(delay, move || {
            release(&inner, generation);
            retry();
        }));

        tracing::debug!(
            failures,
            delay_ms = delay.as_millis(),
            %failure,
            "retry scheduled with backoff"
        );
        RetryDecision::Scheduled { failures, delay }
    }

    /// Forget all failures and cancel any pending retry.
    pub fn on_success(&self) {
        let previous = self.inner.failures.get();
        self.inner.failures.reset();
        let mut pending = self.inner.pending.lock();
        pending.generation += 1;
        if pending.deadline.take().is_some() || previous > 0 {
            tracing::debug!(previous, "failures reset after success");
        }
    }

    /// Drop a pending retry without forgetting failures. Returns whether
    /// one was pending.
    pub fn cancel(&self) -> bool {
        let mut pending = self.inner.pending.lock();
        pending.generation += 1;
        pending.deadline.take().is_some()
    }

    pub fn failures(&self) -> u32 {
        u32::try_from(self.inner.failures.get()).unwrap_or(u32::MAX)
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.lock().deadline.is_some()
    }

    pub fn options(&self) -> RetryOptions {
        self.inner.options
    }
}

/// Clear the pending slot once its deadline fires, unless a success or a
/// newer schedule replaced it in the meantime.
fn release(inner: &Weak<Inner>, generation: u64) {
    if let Some(inner) = inner.upgrade() {
        let mut pending = inner.pending.lock();
        if pending.generation == generation {
            pending.deadline = None;
        }
    }
}

/// `2^failures * base`, saturating.
pub fn backoff(base: Duration, failures: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(failures))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use aulos_platform::sleep;
    use rstest::rstest;

    use super::*;
    use crate::error::{FailureCategory, NetError};

    fn timeout() -> Failure {
        Failure::Net(NetError::timeout("https://cdn.example/seg.m4s"))
    }

    fn calls() -> (Arc<AtomicUsize>, impl Fn() + Send + Clone + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let hit = {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        };
        (calls, hit)
    }

    #[rstest]
    #[case(0, Duration::from_millis(100))]
    #[case(1, Duration::from_millis(200))]
    #[case(3, Duration::from_millis(800))]
    #[case(5, Duration::from_millis(3200))]
    fn backoff_doubles(#[case] failures: u32, #[case] expected: Duration) {
        assert_eq!(backoff(Duration::from_millis(100), failures), expected);
    }

    #[test]
    fn backoff_does_not_overflow() {
        assert!(backoff(Duration::from_millis(100), 64) >= backoff(Duration::from_millis(100), 31));
        assert_eq!(backoff(Duration::MAX, 3), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn first_failures_retry_synchronously() {
        let controller = RetryController::new(RetryOptions::default());
        let (count, hit) = calls();

        assert_eq!(
            controller.on_failure(&timeout(), hit.clone()),
            RetryDecision::Immediate { failures: 1 }
        );
        assert_eq!(
            controller.on_failure(&timeout(), hit.clone()),
            RetryDecision::Immediate { failures: 2 }
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!controller.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_past_threshold_is_delayed_exponentially() {
        let controller = RetryController::new(RetryOptions::default());
        let (count, hit) = calls();
        controller.on_failure(&timeout(), hit.clone());
        controller.on_failure(&timeout(), hit.clone());

        // 2^(threshold + 1) * base_delay
        assert_eq!(
            controller.on_failure(&timeout(), hit.clone()),
            RetryDecision::Scheduled {
                failures: 3,
                delay: Duration::from_millis(800),
            }
        );
        assert!(controller.is_pending());

        sleep(Duration::from_millis(799)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!controller.is_pending());

        assert_eq!(
            controller.on_failure(&timeout(), hit),
            RetryDecision::Scheduled {
                failures: 4,
                delay: Duration::from_millis(1600),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_while_pending_are_coalesced() {
        let controller = RetryController::new(RetryOptions::default().with_threshold(0));
        let (count, hit) = calls();

        assert!(matches!(
            controller.on_failure(&timeout(), hit.clone()),
            RetryDecision::Scheduled { failures: 1, .. }
        ));
        assert_eq!(
            controller.on_failure(&timeout(), hit.clone()),
            RetryDecision::Coalesced
        );
        assert_eq!(
            controller.on_failure(&timeout(), hit),
            RetryDecision::Coalesced
        );
        assert_eq!(controller.failures(), 1);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_and_cancels_pending_retry() {
        let controller = RetryController::new(RetryOptions::default());
        let (count, hit) = calls();
        for _ in 0..3 {
            controller.on_failure(&timeout(), hit.clone());
        }
        assert!(controller.is_pending());

        controller.on_success();
        assert_eq!(controller.failures(), 0);
        assert!(!controller.is_pending());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert_eq!(
            controller.on_failure(&timeout(), hit),
            RetryDecision::Immediate { failures: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_failure_count() {
        let controller = RetryController::new(RetryOptions::default().with_threshold(0));
        let (count, hit) = calls();
        controller.on_failure(&timeout(), hit);

        assert!(controller.cancel());
        assert!(!controller.cancel());
        assert_eq!(controller.failures(), 1);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    #[case(Failure::other(FailureCategory::Media, "decoder error"))]
    #[case(Failure::other(FailureCategory::Drm, "license expired"))]
    #[case(Failure::other(FailureCategory::Manifest, "unparseable"))]
    #[tokio::test(start_paused = true)]
    async fn non_network_failures_are_not_retried(#[case] failure: Failure) {
        let controller = RetryController::new(RetryOptions::default());
        let (count, hit) = calls();

        let decision = controller.on_failure(&failure, hit);
        assert_eq!(decision, RetryDecision::NotRetryable);
        assert!(decision.surfaces());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(controller.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn max_failures_exhausts() {
        let controller = RetryController::new(RetryOptions::default().with_max_failures(2));
        let (count, hit) = calls();

        controller.on_failure(&timeout(), hit.clone());
        controller.on_failure(&timeout(), hit.clone());
        let decision = controller.on_failure(&timeout(), hit);

        assert_eq!(decision, RetryDecision::Exhausted { failures: 3 });
        assert!(decision.surfaces());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!controller.is_pending());
    }
}
