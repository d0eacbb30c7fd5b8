use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use aulos_platform::{Deadline, Instant, Mutex};

use crate::{
    traits::{RequestControl, TransportObserver},
    types::{CloseReason, RequestId, RequestInfo, TimeoutOptions},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeadlineKind {
    FirstByte,
    Load,
}

struct TrackedRequest {
    info: RequestInfo,
    started_at: Instant,
    control: Arc<dyn RequestControl>,
    first_byte: Option<Deadline>,
    load: Option<Deadline>,
}

struct TrackerState {
    timeouts: TimeoutOptions,
    requests: HashMap<RequestId, TrackedRequest>,
}

/// Per-request deadlines for in-flight segment downloads.
///
/// Each tracked request owns a first-byte deadline and a total-load
/// deadline. Either one firing times the request out through its
/// [`RequestControl`]; the transport then reports `Close(Timeout)` and the
/// entry is released by [`close`](Self::close).
///
/// Control calls are never made while the internal lock is held, so a
/// control may report the close synchronously.
#[derive(Clone)]
pub struct RequestTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RequestTracker")
            .field("timeouts", &state.timeouts)
            .field("in_flight", &state.requests.len())
            .finish()
    }
}

impl RequestTracker {
    pub fn new(timeouts: TimeoutOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                timeouts,
                requests: HashMap::new(),
            })),
        }
    }

    /// Start tracking a request. Non-segment requests are ignored.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(&self, request: &RequestInfo, control: Arc<dyn RequestControl>) -> bool {
        if !request.kind.is_segment() {
            return false;
        }

        let mut state = self.state.lock();
        let timeouts = state.timeouts;
        let tracked = TrackedRequest {
            info: request.clone(),
            started_at: Instant::now(),
            control,
            first_byte: Some(self.arm(request.id, DeadlineKind::FirstByte, timeouts.first_byte)),
            load: Some(self.arm(request.id, DeadlineKind::Load, timeouts.load)),
        };
        if state.requests.insert(request.id, tracked).is_some() {
            tracing::debug!(id = %request.id, "request reopened, previous deadlines dropped");
        }
        tracing::trace!(
            id = %request.id,
            uri = %request.uri,
            first_byte_ms = timeouts.first_byte.as_millis(),
            load_ms = timeouts.load.as_millis(),
            "tracking request"
        );
        true
    }

    /// First byte arrived: the first-byte deadline no longer applies.
    pub fn first_byte(&self, id: RequestId) -> bool {
        let mut state = self.state.lock();
        let Some(request) = state.requests.get_mut(&id) else {
            return false;
        };
        request.first_byte = None;
        true
    }

    /// Body progress implies the first byte has arrived.
    pub fn progress(&self, id: RequestId) -> bool {
        self.first_byte(id)
    }

    /// Stop tracking a request and cancel both of its deadlines.
    ///
    /// Returns how long the request was tracked, or `None` for unknown or
    /// already closed ids.
    pub fn close(&self, id: RequestId) -> Option<Duration> {
        let request = self.state.lock().requests.remove(&id)?;
        Some(request.started_at.elapsed())
    }

    /// Change the first-byte timeout.
    ///
    /// Requests still waiting for their first byte are rescheduled against
    /// the time already elapsed since they opened, so a shorter timeout may
    /// fire immediately.
    pub fn reconfigure_first_byte_timeout(&self, timeout: Duration) {
        self.reconfigure(DeadlineKind::FirstByte, timeout);
    }

    /// Change the total-load timeout, retroactively for in-flight requests.
    pub fn reconfigure_load_timeout(&self, timeout: Duration) {
        self.reconfigure(DeadlineKind::Load, timeout);
    }

    /// Time out every tracked request now.
    ///
    /// Entries stay tracked until their close event arrives; their deadlines
    /// are disarmed so no request is timed out twice. Returns how many
    /// requests were shed.
    pub fn force_timeout_all(&self) -> usize {
        let controls: Vec<(RequestId, Arc<dyn RequestControl>)> = {
            let mut state = self.state.lock();
            state
                .requests
                .iter_mut()
                .map(|(id, request)| {
                    request.first_byte = None;
                    request.load = None;
                    (*id, Arc::clone(&request.control))
                })
                .collect()
        };

        for (id, control) in &controls {
            tracing::warn!(id = %id, "forcing request timeout");
            control.timeout();
        }
        controls.len()
    }

    /// Drop every entry and its deadlines without touching the transport.
    pub fn clear(&self) {
        self.state.lock().requests.clear();
    }

    pub fn timeouts(&self) -> TimeoutOptions {
        self.state.lock().timeouts
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.state.lock().requests.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reconfigure(&self, kind: DeadlineKind, timeout: Duration) {
        let mut state = self.state.lock();
        match kind {
            DeadlineKind::FirstByte => state.timeouts.first_byte = timeout,
            DeadlineKind::Load => state.timeouts.load = timeout,
        }

        let mut rescheduled = 0_usize;
        for (id, request) in &mut state.requests {
            let slot = match kind {
                DeadlineKind::FirstByte => &mut request.first_byte,
                DeadlineKind::Load => &mut request.load,
            };
            if slot.is_none() {
                continue;
            }
            let remaining = timeout.saturating_sub(request.started_at.elapsed());
            *slot = Some(self.arm(*id, kind, remaining));
            rescheduled += 1;
        }

        tracing::debug!(
            ?kind,
            timeout_ms = timeout.as_millis(),
            rescheduled,
            "timeout reconfigured"
        );
    }

    fn arm(&self, id: RequestId, kind: DeadlineKind, delay: Duration) -> Deadline {
        let state = Arc::downgrade(&self.state);
        Deadline::schedule(delay, move || fire(&state, id, kind))
    }
}

fn fire(state: &Weak<Mutex<TrackerState>>, id: RequestId, kind: DeadlineKind) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let (control, uri) = {
        let mut state = state.lock();
        let Some(request) = state.requests.get_mut(&id) else {
            return;
        };
        // Disarm both so the request is timed out at most once. Dropping the
        // handle of the deadline currently running is harmless.
        request.first_byte = None;
        request.load = None;
        (Arc::clone(&request.control), request.info.uri.clone())
    };

    tracing::warn!(id = %id, %uri, ?kind, "request deadline expired");
    control.timeout();
}

impl TransportObserver for RequestTracker {
    fn on_open(&self, request: &RequestInfo, control: Arc<dyn RequestControl>) {
        self.open(request, control);
    }

    fn on_first_byte(&self, request: &RequestInfo) {
        self.first_byte(request.id);
    }

    fn on_progress(&self, request: &RequestInfo, _loaded: u64) {
        self.progress(request.id);
    }

    fn on_close(&self, request: &RequestInfo, _reason: CloseReason) {
        self.close(request.id);
    }
}
