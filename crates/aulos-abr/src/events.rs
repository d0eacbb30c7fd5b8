use std::time::Duration;

use aulos_net::RetryDecision;
use tokio::sync::broadcast;

use crate::health::BufferHealth;

/// Decisions of the ABR loop.
#[derive(Clone, Debug, PartialEq)]
pub enum AbrEvent {
    Started,
    EstimateUpdated {
        bandwidth_bps: u64,
        usage_factor: f64,
    },
    HealthChanged {
        from: Option<BufferHealth>,
        to: BufferHealth,
        buffered_ahead_secs: f64,
        usage_factor: f64,
    },
    VariantsUpdated {
        count: usize,
    },
    VariantSelected {
        index: usize,
        variant_index: Option<usize>,
        bandwidth_bps: Option<u64>,
    },
    Stopped,
}

/// Decisions about in-flight requests and failures.
#[derive(Clone, Debug, PartialEq)]
pub enum NetEvent {
    TimeoutsReconfigured {
        first_byte: Duration,
        load: Duration,
    },
    /// In-flight requests timed out because the buffer ran low.
    RequestsShed {
        count: usize,
    },
    Retry {
        decision: RetryDecision,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Abr(AbrEvent),
    Net(NetEvent),
}

impl From<AbrEvent> for Event {
    fn from(event: AbrEvent) -> Self {
        Self::Abr(event)
    }
}

impl From<NetEvent> for Event {
    fn from(event: NetEvent) -> Self {
        Self::Net(event)
    }
}

/// Broadcast of everything an [`AbrSession`](crate::AbrSession) decides.
///
/// `publish()` never blocks and drops events when nobody listens. Slow
/// subscribers receive `RecvError::Lagged(n)` instead of slowing the loop.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish<E: Into<Event>>(&self, event: E) {
        let _ = self.tx.send(event.into());
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
