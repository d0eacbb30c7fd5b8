use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use aulos_events::{Observable, Subscription};
use aulos_net::{CloseReason, RequestControl, RequestId, RequestInfo, TransportObserver};
use aulos_platform::{Instant, Mutex, Ticker};

use crate::options::EstimatorOptions;

#[derive(Clone, Copy, Debug)]
struct RequestBytes {
    started_at: Instant,
    loaded: u64,
    first_byte: bool,
}

#[derive(Debug)]
struct EstimatorState {
    requests: HashMap<RequestId, RequestBytes>,
    window: VecDeque<u64>,
    /// Close samples waiting for the next tick.
    staged: Vec<u64>,
    interval_bytes: u64,
    /// Open requests that have received their first byte.
    active: usize,
    use_network_estimate: bool,
    last_tick: Instant,
}

impl EstimatorState {
    fn release_active(&mut self) {
        self.active = self.active.saturating_sub(1);
        if self.active == 0 {
            self.use_network_estimate = false;
        }
    }
}

/// `bytes * 8000 / max(min_duration, elapsed)` in bits per second.
pub fn throughput_bps(bytes: u64, elapsed: Duration, min_duration: Duration) -> u64 {
    let ms = elapsed.max(min_duration).as_millis().max(1);
    u64::try_from(u128::from(bytes) * 8000 / ms).unwrap_or(u64::MAX)
}

/// Throughput estimator fed by transport lifecycle events.
///
/// Two kinds of samples feed a bounded window:
///
/// - a per-request sample when a segment completes with enough bytes;
/// - a network-wide sample on each tick, from the bytes received by all
///   requests since the previous tick, while at least one request has been
///   receiving data for a whole tick.
///
/// Request samples are staged and enter the window on the next tick, after
/// that tick's network-wide sample. Each tick then publishes the floored
/// mean of the window as the new estimate.
#[derive(Clone)]
pub struct BandwidthEstimator {
    options: EstimatorOptions,
    state: Arc<Mutex<EstimatorState>>,
    estimate: Observable<u64>,
}

impl fmt::Debug for BandwidthEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BandwidthEstimator")
            .field("estimate", &self.estimate.get())
            .field("window", &state.window)
            .field("in_flight", &state.requests.len())
            .finish()
    }
}

impl BandwidthEstimator {
    pub fn new(options: EstimatorOptions) -> Self {
        Self {
            options,
            state: Arc::new(Mutex::new(EstimatorState {
                requests: HashMap::new(),
                window: VecDeque::with_capacity(options.sample_window),
                staged: Vec::new(),
                interval_bytes: 0,
                active: 0,
                use_network_estimate: false,
                last_tick: Instant::now(),
            })),
            estimate: Observable::new(options.initial_estimate_bps),
        }
    }

    pub fn options(&self) -> &EstimatorOptions {
        &self.options
    }

    /// Current estimate in bits per second.
    pub fn estimate(&self) -> u64 {
        self.estimate.get()
    }

    pub fn estimates(&self) -> &Observable<u64> {
        &self.estimate
    }

    /// Called with every published estimate.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&u64) + Send + Sync + 'static,
    {
        self.estimate.subscribe(f)
    }

    /// Start measuring a request. Non-segment requests are ignored.
    pub fn open_request(&self, request: &RequestInfo) -> bool {
        if !request.kind.is_segment() {
            return false;
        }
        let mut state = self.state.lock();
        let replaced = state.requests.insert(
            request.id,
            RequestBytes {
                started_at: Instant::now(),
                loaded: 0,
                first_byte: false,
            },
        );
        if replaced.is_some_and(|previous| previous.first_byte) {
            tracing::debug!(id = %request.id, "request reopened while receiving");
            state.release_active();
        }
        true
    }

    pub fn first_byte(&self, id: RequestId) -> bool {
        let mut state = self.state.lock();
        let Some(request) = state.requests.get_mut(&id) else {
            return false;
        };
        if !request.first_byte {
            request.first_byte = true;
            state.active += 1;
        }
        true
    }

    /// Record `loaded` bytes received so far. Returns the bytes added since
    /// the previous report.
    ///
    /// Progress implies the first byte has arrived.
    pub fn progress(&self, id: RequestId, loaded: u64) -> Option<u64> {
        let mut state = self.state.lock();
        let request = state.requests.get_mut(&id)?;
        let delta = loaded.saturating_sub(request.loaded);
        request.loaded = request.loaded.max(loaded);
        if !std::mem::replace(&mut request.first_byte, true) {
            state.active += 1;
        }
        state.interval_bytes = state.interval_bytes.saturating_add(delta);
        tracing::trace!(%id, loaded, delta, "progress");
        Some(delta)
    }

    /// Stop measuring a request. Returns the staged sample, if the request
    /// loaded successfully with enough bytes.
    pub fn close(&self, id: RequestId, reason: CloseReason) -> Option<u64> {
        let mut state = self.state.lock();
        let request = state.requests.remove(&id)?;

        if request.first_byte {
            state.release_active();
        }

        if reason != CloseReason::Load || request.loaded < self.options.min_bytes {
            return None;
        }
        let elapsed = request.started_at.elapsed();
        let sample = throughput_bps(request.loaded, elapsed, self.options.min_duration);
        state.staged.push(sample);
        tracing::debug!(%id, bytes = request.loaded, ?elapsed, sample, "request sample");
        Some(sample)
    }

    /// Fold pending samples into the window and publish the new estimate.
    pub fn tick(&self) -> u64 {
        let estimate = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_tick);

            let mut incoming = Vec::with_capacity(state.staged.len() + 1);
            if state.use_network_estimate && !elapsed.is_zero() {
                let sample = throughput_bps(state.interval_bytes, elapsed, Duration::from_millis(1));
                tracing::debug!(bytes = state.interval_bytes, ?elapsed, sample, "network sample");
                incoming.push(sample);
            }
            incoming.append(&mut state.staged);
            for sample in incoming {
                if state.window.len() == self.options.sample_window {
                    state.window.pop_front();
                }
                state.window.push_back(sample);
            }

            state.interval_bytes = 0;
            state.last_tick = now;
            state.use_network_estimate = state.active > 0;

            if state.window.is_empty() {
                self.estimate.get()
            } else {
                let sum: u128 = state.window.iter().map(|&s| u128::from(s)).sum();
                let mean = sum / state.window.len() as u128;
                u64::try_from(mean).unwrap_or(u64::MAX)
            }
        };

        tracing::debug!(estimate, "bandwidth estimate");
        self.estimate.publish(estimate);
        estimate
    }

    /// Run [`tick`](Self::tick) every `tick_interval` until the returned
    /// ticker is stopped or dropped.
    pub fn spawn_ticker(&self) -> Ticker {
        let estimator = self.clone();
        Ticker::spawn(self.options.tick_interval, move || {
            estimator.tick();
        })
    }

    /// Samples currently averaged, oldest first.
    pub fn window(&self) -> Vec<u64> {
        self.state.lock().window.iter().copied().collect()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().requests.len()
    }
}

impl TransportObserver for BandwidthEstimator {
    fn on_open(&self, request: &RequestInfo, _control: Arc<dyn RequestControl>) {
        self.open_request(request);
    }

    fn on_first_byte(&self, request: &RequestInfo) {
        self.first_byte(request.id);
    }

    fn on_progress(&self, request: &RequestInfo, loaded: u64) {
        self.progress(request.id, loaded);
    }

    fn on_close(&self, request: &RequestInfo, reason: CloseReason) {
        self.close(request.id, reason);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use aulos_net::RequestKind;
    use rstest::rstest;
    use url::Url;

    use super::*;

    fn request(id: u64, kind: RequestKind) -> RequestInfo {
        let uri = Url::parse(&format!("https://cdn.test/seg-{id}.m4s")).unwrap();
        RequestInfo::new(id, kind, uri)
    }

    fn estimator() -> BandwidthEstimator {
        BandwidthEstimator::new(EstimatorOptions::default())
    }

    /// Open, receive `bytes` over `after`, and close with `reason`.
    async fn transfer(
        est: &BandwidthEstimator,
        id: u64,
        bytes: u64,
        after: Duration,
        reason: CloseReason,
    ) -> Option<u64> {
        let req = request(id, RequestKind::Segment);
        assert!(est.open_request(&req));
        tokio::time::advance(after).await;
        est.first_byte(req.id);
        est.progress(req.id, bytes);
        est.close(req.id, reason)
    }

    #[rstest]
    #[case(100_000, 1000, 800_000)]
    #[case(35_000, 100, 2_800_000)]
    #[case(50_000, 10, 8_000_000)]
    #[case(1_000_000, 4000, 2_000_000)]
    fn sample_formula(#[case] bytes: u64, #[case] ms: u64, #[case] expected: u64) {
        assert_eq!(
            throughput_bps(bytes, Duration::from_millis(ms), Duration::from_millis(50)),
            expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn initial_estimate_until_first_sample() {
        let est = estimator();
        assert_eq!(est.estimate(), 500_000);
        assert_eq!(est.tick(), 500_000);
        assert!(est.window().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_segment_becomes_sample_on_tick() {
        let est = estimator();
        let sample = transfer(&est, 1, 100_000, Duration::from_secs(1), CloseReason::Load).await;
        assert_eq!(sample, Some(800_000));
        assert_eq!(est.estimate(), 500_000, "staged until tick");
        assert_eq!(est.tick(), 800_000);
    }

    #[rstest]
    #[case::too_small(34_999, CloseReason::Load)]
    #[case::aborted(100_000, CloseReason::Abort)]
    #[case::errored(100_000, CloseReason::Error)]
    #[case::timed_out(100_000, CloseReason::Timeout)]
    #[tokio::test(start_paused = true)]
    async fn unqualified_transfers_are_ignored(#[case] bytes: u64, #[case] reason: CloseReason) {
        let est = estimator();
        assert_eq!(transfer(&est, 1, bytes, Duration::from_secs(1), reason).await, None);
        assert_eq!(est.tick(), 500_000);
        assert!(est.window().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn window_keeps_latest_samples() {
        let est = estimator();
        for (id, bytes) in [(1, 100_000), (2, 200_000), (3, 300_000), (4, 400_000)] {
            transfer(&est, id, bytes, Duration::from_secs(1), CloseReason::Load).await;
        }
        // 800k, 1.6M, 2.4M, 3.2M: the first is evicted.
        assert_eq!(est.tick(), 2_400_000);
        assert_eq!(est.window(), vec![1_600_000, 2_400_000, 3_200_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn mean_is_floored() {
        let est = estimator();
        transfer(&est, 1, 100_000, Duration::from_secs(1), CloseReason::Load).await;
        transfer(&est, 2, 100_001, Duration::from_secs(1), CloseReason::Load).await;
        // (800_000 + 800_008) / 2
        assert_eq!(est.tick(), 800_004);
    }

    #[tokio::test(start_paused = true)]
    async fn non_segment_requests_are_not_measured() {
        let est = estimator();
        let req = request(1, RequestKind::License);
        assert!(!est.open_request(&req));
        assert!(!est.first_byte(req.id));
        assert_eq!(est.progress(req.id, 100_000), None);
        assert_eq!(est.close(req.id, CloseReason::Load), None);
        assert_eq!(est.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn double_close_is_counted_once() {
        let est = estimator();
        let req = request(1, RequestKind::Segment);
        est.open_request(&req);
        tokio::time::advance(Duration::from_secs(1)).await;
        est.first_byte(req.id);
        est.progress(req.id, 100_000);
        assert!(est.close(req.id, CloseReason::Load).is_some());
        assert_eq!(est.close(req.id, CloseReason::Load), None);
        est.tick();
        assert_eq!(est.window().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_transfer_produces_network_samples() {
        let est = estimator();
        let req = request(1, RequestKind::Segment);
        est.open_request(&req);
        est.first_byte(req.id);
        est.progress(req.id, 10_000);

        // First tick only arms the network estimate.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(est.tick(), 500_000);

        tokio::time::advance(Duration::from_millis(500)).await;
        est.progress(req.id, 10_000 + 125_000);
        // 125_000 bytes in 500ms.
        assert_eq!(est.tick(), 2_000_000);

        tokio::time::advance(Duration::from_millis(500)).await;
        est.progress(req.id, 10_000 + 125_000 + 62_500);
        assert_eq!(est.estimate(), 2_000_000);
        assert_eq!(est.tick(), 1_500_000);
        assert_eq!(est.window(), vec![2_000_000, 1_000_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_without_first_byte_event_arms_network_samples() {
        let est = estimator();
        let req = request(1, RequestKind::Segment);
        est.open_request(&req);
        est.progress(req.id, 10_000);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(est.tick(), 500_000);

        tokio::time::advance(Duration::from_millis(500)).await;
        est.progress(req.id, 10_000 + 125_000);
        assert_eq!(est.tick(), 2_000_000);
        assert_eq!(est.window(), vec![2_000_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn reopened_request_does_not_keep_network_estimate_armed() {
        let est = estimator();
        let req = request(1, RequestKind::Segment);
        est.open_request(&req);
        est.first_byte(req.id);
        est.tick();

        est.open_request(&req);
        est.close(req.id, CloseReason::Abort);

        // The armed interval ends with the request; later idle ticks add nothing.
        tokio::time::advance(Duration::from_millis(500)).await;
        est.tick();
        tokio::time::advance(Duration::from_millis(500)).await;
        est.tick();
        assert!(est.window().is_empty());
        assert_eq!(est.estimate(), 500_000);
    }

    #[tokio::test(start_paused = true)]
    async fn network_sample_precedes_close_samples_in_the_same_tick() {
        let est = BandwidthEstimator::new(EstimatorOptions::default().with_sample_window(10));
        let long = request(1, RequestKind::Segment);
        est.open_request(&long);
        est.first_byte(long.id);
        est.tick();

        tokio::time::advance(Duration::from_millis(250)).await;
        transfer(&est, 2, 100_000, Duration::from_millis(250), CloseReason::Load).await;
        // Close sample of request 2 was staged before the tick; the network
        // sample still lands first.
        est.tick();
        let window = est.window();
        assert_eq!(window.len(), 2);
        assert_eq!(window[1], 3_200_000);
        assert_eq!(window[0], 1_600_000, "100_000 bytes over the 500ms interval");
    }

    #[tokio::test(start_paused = true)]
    async fn network_estimate_stops_when_last_active_request_closes() {
        let est = estimator();
        let req = request(1, RequestKind::Segment);
        est.open_request(&req);
        est.first_byte(req.id);
        est.first_byte(req.id);
        est.tick();
        est.close(req.id, CloseReason::Abort);

        tokio::time::advance(Duration::from_millis(500)).await;
        est.tick();
        assert!(est.window().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reports_deltas() {
        let est = estimator();
        let req = request(1, RequestKind::Segment);
        est.open_request(&req);
        assert_eq!(est.progress(req.id, 1000), Some(1000));
        assert_eq!(est.progress(req.id, 2500), Some(1500));
        assert_eq!(est.progress(req.id, 2500), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn every_tick_publishes() {
        let est = estimator();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let _sub = est.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        est.tick();
        est.tick();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_recomputes_periodically() {
        let est = estimator();
        transfer(&est, 1, 100_000, Duration::from_secs(1), CloseReason::Load).await;
        let ticker = est.spawn_ticker();
        tokio::time::sleep(Duration::from_millis(510)).await;
        assert_eq!(est.estimate(), 800_000);
        ticker.stop();
    }
}
