use std::{fmt, sync::Arc};

use aulos_events::{Observable, Subscription};
use aulos_platform::{Mutex, Ticker};

use crate::{
    options::HealthOptions,
    player::Player,
    types::BufferedRange,
};

/// Discretized buffered-ahead level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferHealth {
    /// Below the low threshold: playback is at risk of stalling.
    Low,
    Building,
    /// At or above the high threshold.
    Full,
}

impl BufferHealth {
    pub fn classify(buffered_ahead_secs: f64, options: &HealthOptions) -> Self {
        if buffered_ahead_secs < options.low_threshold_secs {
            Self::Low
        } else if buffered_ahead_secs < options.high_threshold_secs {
            Self::Building
        } else {
            Self::Full
        }
    }
}

/// Whole seconds buffered past `playhead` in the range that contains it.
pub fn buffered_ahead(ranges: &[BufferedRange], playhead: Option<f64>) -> f64 {
    let Some(playhead) = playhead else {
        return 0.0;
    };
    ranges
        .iter()
        .find(|r| r.contains(playhead))
        .map_or(0.0, |r| (r.end - playhead).floor())
}

/// One buffer poll.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HealthSample {
    pub level: BufferHealth,
    pub buffered_ahead_secs: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HealthTransition {
    /// `None` for the first emitted level.
    pub from: Option<BufferHealth>,
    pub to: BufferHealth,
    pub buffered_ahead_secs: f64,
}

/// Polls the player's buffer and reports level changes.
///
/// Every poll is published on [`samples`](Self::samples); a poll whose level
/// differs from the last emitted one is also published on
/// [`transitions`](Self::transitions). The first poll always emits.
pub struct BufferHealthMonitor<P> {
    player: Arc<P>,
    options: HealthOptions,
    last_emitted: Arc<Mutex<Option<BufferHealth>>>,
    samples: Observable<HealthSample>,
    transitions: Observable<HealthTransition>,
}

impl<P> Clone for BufferHealthMonitor<P> {
    fn clone(&self) -> Self {
        Self {
            player: Arc::clone(&self.player),
            options: self.options,
            last_emitted: Arc::clone(&self.last_emitted),
            samples: self.samples.clone(),
            transitions: self.transitions.clone(),
        }
    }
}

impl<P> fmt::Debug for BufferHealthMonitor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHealthMonitor")
            .field("options", &self.options)
            .field("level", &*self.last_emitted.lock())
            .finish_non_exhaustive()
    }
}

impl<P: Player> BufferHealthMonitor<P> {
    pub fn new(player: Arc<P>, options: HealthOptions) -> Self {
        let empty = HealthSample {
            level: BufferHealth::Low,
            buffered_ahead_secs: 0.0,
        };
        Self {
            player,
            options,
            last_emitted: Arc::new(Mutex::new(None)),
            samples: Observable::new(empty),
            transitions: Observable::new(HealthTransition {
                from: None,
                to: empty.level,
                buffered_ahead_secs: 0.0,
            }),
        }
    }

    pub fn options(&self) -> &HealthOptions {
        &self.options
    }

    /// Last emitted level, `None` before the first poll.
    pub fn level(&self) -> Option<BufferHealth> {
        *self.last_emitted.lock()
    }

    pub fn samples(&self) -> &Observable<HealthSample> {
        &self.samples
    }

    pub fn transitions(&self) -> &Observable<HealthTransition> {
        &self.transitions
    }

    pub fn on_transition<F>(&self, f: F) -> Subscription
    where
        F: Fn(&HealthTransition) + Send + Sync + 'static,
    {
        self.transitions.subscribe(f)
    }

    pub fn on_sample<F>(&self, f: F) -> Subscription
    where
        F: Fn(&HealthSample) + Send + Sync + 'static,
    {
        self.samples.subscribe(f)
    }

    /// Sample the buffer once. Returns the transition, if the level changed.
    pub fn poll(&self) -> Option<HealthTransition> {
        let ranges = self.player.buffered_ranges();
        let ahead = buffered_ahead(&ranges, self.player.playhead_position());
        let sample = HealthSample {
            level: BufferHealth::classify(ahead, &self.options),
            buffered_ahead_secs: ahead,
        };

        let transition = {
            let mut last = self.last_emitted.lock();
            let from = last.replace(sample.level);
            (from != Some(sample.level)).then_some(HealthTransition {
                from,
                to: sample.level,
                buffered_ahead_secs: ahead,
            })
        };

        if let Some(transition) = transition {
            tracing::info!(
                from = ?transition.from,
                to = ?transition.to,
                buffered_ahead_secs = ahead,
                "buffer health changed"
            );
            self.transitions.publish(transition);
        }
        self.samples.publish(sample);
        transition
    }

    /// Poll every `poll_interval` until the returned ticker is stopped or
    /// dropped.
    pub fn spawn_poller(&self) -> Ticker {
        let monitor = self.clone();
        Ticker::spawn(self.options.poll_interval, move || {
            monitor.poll();
        })
    }
}
