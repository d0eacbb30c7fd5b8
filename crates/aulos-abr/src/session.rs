use std::{fmt, sync::Arc, time::Duration};

use aulos_events::Subscription;
use aulos_net::{
    CloseReason, Failure, RequestControl, RequestInfo, RequestTracker, RetryController,
    RetryDecision, TransportObserver,
};
use aulos_platform::{Mutex, Ticker};

use crate::{
    error::AbrResult,
    estimator::BandwidthEstimator,
    events::{AbrEvent, EventBus, NetEvent},
    health::{BufferHealth, BufferHealthMonitor, HealthSample, HealthTransition},
    options::{AbrOptions, HealthOptions, LevelPolicies},
    player::Player,
    selector::VariantSelector,
    types::Variant,
};

/// Timers and subscriptions alive between `start` and `stop`.
struct Running {
    ticker: Ticker,
    poller: Ticker,
    _subscriptions: Vec<Subscription>,
}

/// The ABR control loop for one player.
///
/// Feed it transport events through its [`TransportObserver`] impl and
/// segment notifications through [`segment_downloaded`](Self::segment_downloaded).
/// It keeps a bandwidth estimate, polls the player's buffer, adapts request
/// timeouts and the bandwidth usage factor to buffer health, and tells the
/// player which variant to fetch next.
pub struct AbrSession<P: Player> {
    player: Arc<P>,
    options: AbrOptions,
    estimator: BandwidthEstimator,
    tracker: RequestTracker,
    monitor: BufferHealthMonitor<P>,
    selector: VariantSelector,
    retry: RetryController,
    usage_factor: Arc<Mutex<f64>>,
    bus: EventBus,
    running: Mutex<Option<Running>>,
}

impl<P: Player> fmt::Debug for AbrSession<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbrSession")
            .field("estimator", &self.estimator)
            .field("tracker", &self.tracker)
            .field("monitor", &self.monitor)
            .field("selector", &self.selector)
            .field("retry", &self.retry)
            .field("usage_factor", &*self.usage_factor.lock())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<P: Player> AbrSession<P> {
    /// Build all components, wire them together and start both timers.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AbrError::InvalidConfig`](crate::AbrError::InvalidConfig)
    /// if `options` do not validate.
    pub fn start(player: Arc<P>, options: AbrOptions) -> AbrResult<Self> {
        options.validate()?;

        let session = Self {
            estimator: BandwidthEstimator::new(options.estimator),
            tracker: RequestTracker::new(options.timeouts),
            monitor: BufferHealthMonitor::new(Arc::clone(&player), options.health),
            selector: VariantSelector::new(options.restrictions),
            retry: RetryController::new(options.retry),
            usage_factor: Arc::new(Mutex::new(options.levels.low.usage_factor)),
            bus: EventBus::new(options.event_capacity),
            running: Mutex::new(None),
            player,
            options,
        };

        let subscriptions = vec![
            session.wire_estimates(),
            session.wire_transitions(),
            session.wire_samples(),
            session.wire_selection(),
        ];
        *session.running.lock() = Some(Running {
            ticker: session.estimator.spawn_ticker(),
            poller: session.monitor.spawn_poller(),
            _subscriptions: subscriptions,
        });

        tracing::info!(
            tick = ?session.options.estimator.tick_interval,
            poll = ?session.options.health.poll_interval,
            "abr session started"
        );
        session.bus.publish(AbrEvent::Started);
        Ok(session)
    }

    /// Every estimate re-selects a variant under the current usage factor.
    fn wire_estimates(&self) -> Subscription {
        let selector = self.selector.clone();
        let usage_factor = Arc::clone(&self.usage_factor);
        let bus = self.bus.clone();
        self.estimator.subscribe(move |&bandwidth_bps| {
            let factor = *usage_factor.lock();
            bus.publish(AbrEvent::EstimateUpdated {
                bandwidth_bps,
                usage_factor: factor,
            });
            selector.recompute(bandwidth_bps, factor);
        })
    }

    fn wire_transitions(&self) -> Subscription {
        let player = Arc::clone(&self.player);
        let tracker = self.tracker.clone();
        let selector = self.selector.clone();
        let usage_factor = Arc::clone(&self.usage_factor);
        let bus = self.bus.clone();
        let levels = self.options.levels;
        let health = self.options.health;
        self.monitor.on_transition(move |transition| {
            apply_level(
                transition,
                &levels,
                &health,
                player.as_ref(),
                &tracker,
                &selector,
                &usage_factor,
                &bus,
            );
        })
    }

    /// Keeps the building usage factor in step with buffer fullness.
    fn wire_samples(&self) -> Subscription {
        let usage_factor = Arc::clone(&self.usage_factor);
        let levels = self.options.levels;
        let health = self.options.health;
        self.monitor.on_sample(move |sample: &HealthSample| {
            if sample.level == BufferHealth::Building {
                *usage_factor.lock() =
                    levels.usage_factor(sample.level, sample.buffered_ahead_secs, &health);
            }
        })
    }

    fn wire_selection(&self) -> Subscription {
        let selector = self.selector.clone();
        let bus = self.bus.clone();
        self.selector.subscribe(move |&index| {
            let variant = selector.choose_variant();
            bus.publish(AbrEvent::VariantSelected {
                index,
                variant_index: variant.as_ref().map(|v| v.variant_index),
                bandwidth_bps: variant.as_ref().map(|v| v.bandwidth_bps),
            });
        })
    }

    /// Register the callback that receives the variant to fetch next.
    pub fn init<F>(&self, switch: F)
    where
        F: Fn(&Variant) + Send + Sync + 'static,
    {
        self.selector.init(Arc::new(switch));
    }

    /// Replace the variant catalog. Returns the number of variants kept.
    pub fn set_variants(&self, variants: Vec<Variant>) -> usize {
        let count = self.selector.set_variants(variants);
        self.bus.publish(AbrEvent::VariantsUpdated { count });
        count
    }

    /// Reload the catalog from [`Player::available_variants`].
    pub fn refresh_variants(&self) -> usize {
        self.set_variants(self.player.available_variants())
    }

    pub fn choose_variant(&self) -> Option<Variant> {
        self.selector.choose_variant()
    }

    pub fn set_variant_index(&self, index: usize) -> bool {
        self.selector.set_variant_index(index)
    }

    /// Notify that the player finished downloading a segment. Hands the
    /// current choice to the switch callback while enabled.
    pub fn segment_downloaded(&self, delta: Duration, bytes: u64) -> bool {
        self.selector.segment_downloaded(delta, bytes)
    }

    pub fn bandwidth_estimate(&self) -> u64 {
        self.estimator.estimate()
    }

    pub fn usage_factor(&self) -> f64 {
        *self.usage_factor.lock()
    }

    pub fn health(&self) -> Option<BufferHealth> {
        self.monitor.level()
    }

    pub fn enable(&self) {
        self.selector.enable();
    }

    pub fn disable(&self) {
        self.selector.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.selector.is_enabled()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Report a failed request. `retry` is invoked now, later, or never,
    /// as decided by the backoff policy.
    pub fn on_failure<F>(&self, failure: &Failure, retry: F) -> RetryDecision
    where
        F: FnOnce() + Send + 'static,
    {
        let decision = self.retry.on_failure(failure, retry);
        self.bus.publish(NetEvent::Retry { decision });
        decision
    }

    pub fn on_success(&self) {
        self.retry.on_success();
    }

    /// Release the switch callback, both timers, every pending deadline and
    /// every internal subscription. Idempotent.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.ticker.stop();
        running.poller.stop();
        drop(running);

        self.selector.stop();
        self.tracker.clear();
        self.retry.cancel();
        tracing::info!("abr session stopped");
        self.bus.publish(AbrEvent::Stopped);
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn options(&self) -> &AbrOptions {
        &self.options
    }

    pub fn estimator(&self) -> &BandwidthEstimator {
        &self.estimator
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn monitor(&self) -> &BufferHealthMonitor<P> {
        &self.monitor
    }

    pub fn selector(&self) -> &VariantSelector {
        &self.selector
    }

    pub fn retry(&self) -> &RetryController {
        &self.retry
    }
}

#[expect(clippy::too_many_arguments, reason = "subscriber captures")]
fn apply_level<P: Player>(
    transition: &HealthTransition,
    levels: &LevelPolicies,
    health: &HealthOptions,
    player: &P,
    tracker: &RequestTracker,
    selector: &VariantSelector,
    usage_factor: &Mutex<f64>,
    bus: &EventBus,
) {
    let level = transition.to;
    let policy = levels.for_level(level);
    let factor = levels.usage_factor(level, transition.buffered_ahead_secs, health);
    *usage_factor.lock() = factor;

    tracker.reconfigure_first_byte_timeout(policy.first_byte_timeout);
    tracker.reconfigure_load_timeout(policy.load_timeout);
    player.configure_retry(policy.retry_parameters());

    bus.publish(AbrEvent::HealthChanged {
        from: transition.from,
        to: level,
        buffered_ahead_secs: transition.buffered_ahead_secs,
        usage_factor: factor,
    });
    bus.publish(NetEvent::TimeoutsReconfigured {
        first_byte: policy.first_byte_timeout,
        load: policy.load_timeout,
    });

    if level == BufferHealth::Low {
        let count = tracker.force_timeout_all();
        if count > 0 {
            tracing::warn!(count, "buffer low, in-flight requests timed out");
        }
        bus.publish(NetEvent::RequestsShed { count });
        selector.select_lowest();
    }
}

impl<P: Player> TransportObserver for AbrSession<P> {
    fn on_open(&self, request: &RequestInfo, control: Arc<dyn RequestControl>) {
        self.estimator.open_request(request);
        self.tracker.open(request, control);
    }

    fn on_first_byte(&self, request: &RequestInfo) {
        self.estimator.first_byte(request.id);
        self.tracker.first_byte(request.id);
    }

    fn on_progress(&self, request: &RequestInfo, loaded: u64) {
        self.estimator.progress(request.id, loaded);
        self.tracker.progress(request.id);
    }

    fn on_close(&self, request: &RequestInfo, reason: CloseReason) {
        self.estimator.close(request.id, reason);
        self.tracker.close(request.id);
    }
}

impl<P: Player> Drop for AbrSession<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use aulos_net::RetryParameters;
    use rstest::rstest;

    use super::*;
    use crate::{
        events::Event,
        options::{EstimatorOptions, LevelPolicy},
        player::MockPlayer,
        types::BufferedRange,
    };

    fn ladder() -> Vec<Variant> {
        vec![
            Variant::new(0, 3_000_000),
            Variant::new(1, 1_000_000),
            Variant::new(2, 400_000),
        ]
    }

    /// Player whose buffer is `ahead` seconds past a playhead at 10s.
    fn player(ahead: f64) -> MockPlayer {
        let mut player = MockPlayer::new();
        player
            .expect_buffered_ranges()
            .returning(move || vec![BufferedRange::new(0.0, 10.0 + ahead)]);
        player.expect_playhead_position().return_const(Some(10.0));
        player.expect_available_variants().returning(ladder);
        player
    }

    #[tokio::test(start_paused = true)]
    async fn start_rejects_invalid_options() {
        let options = AbrOptions::default()
            .with_estimator(EstimatorOptions::default().with_sample_window(0));
        assert!(AbrSession::start(Arc::new(player(0.0)), options).is_err());
    }

    #[rstest]
    #[case::low(1.0, BufferHealth::Low, LevelPolicies::default().low)]
    #[case::building(7.0, BufferHealth::Building, LevelPolicies::default().building)]
    #[case::full(20.0, BufferHealth::Full, LevelPolicies::default().full)]
    #[tokio::test(start_paused = true)]
    async fn first_poll_applies_level_policy(
        #[case] ahead: f64,
        #[case] level: BufferHealth,
        #[case] policy: LevelPolicy,
    ) {
        let mut player = player(ahead);
        player
            .expect_configure_retry()
            .withf(move |params: &RetryParameters| *params == policy.retry_parameters())
            .times(1)
            .return_const(());

        let session = AbrSession::start(Arc::new(player), AbrOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(1001)).await;

        assert_eq!(session.health(), Some(level));
        assert_eq!(session.tracker().timeouts().first_byte, policy.first_byte_timeout);
        assert_eq!(session.tracker().timeouts().load, policy.load_timeout);
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_releases_callback() {
        let mut player = player(20.0);
        player.expect_configure_retry().return_const(());
        let session = AbrSession::start(Arc::new(player), AbrOptions::default()).unwrap();
        let mut events = session.events().subscribe();

        session.init(|_| {});
        session.enable();
        session.refresh_variants();
        assert!(session.segment_downloaded(Duration::from_millis(100), 40_000));

        session.stop();
        session.stop();
        assert!(!session.is_running());
        assert!(!session.segment_downloaded(Duration::from_millis(100), 40_000));

        let mut stopped = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::Abr(AbrEvent::Stopped)) {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
    }
}
