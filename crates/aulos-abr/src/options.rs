use std::time::Duration;

use aulos_net::{RetryOptions, RetryParameters, TimeoutOptions};
use derive_setters::Setters;

use crate::{
    error::{AbrError, AbrResult},
    health::BufferHealth,
    types::VariantRestrictions,
};

/// Throughput sampling configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Setters)]
#[setters(prefix = "with_")]
pub struct EstimatorOptions {
    /// Samples averaged into the estimate; oldest evicted first.
    pub sample_window: usize,
    /// Completed transfers smaller than this are ignored.
    pub min_bytes: u64,
    /// Floor applied to a transfer's duration before computing its rate.
    pub min_duration: Duration,
    /// Estimate reported before the first sample.
    pub initial_estimate_bps: u64,
    /// How often the estimate is recomputed.
    pub tick_interval: Duration,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self {
            sample_window: 3,
            min_bytes: 35_000,
            min_duration: Duration::from_millis(50),
            initial_estimate_bps: 500_000,
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// Buffer polling configuration.
#[derive(Clone, Copy, Debug, PartialEq, Setters)]
#[setters(prefix = "with_")]
pub struct HealthOptions {
    pub poll_interval: Duration,
    /// Below this many buffered seconds the buffer is [`BufferHealth::Low`].
    pub low_threshold_secs: f64,
    /// At or above this many buffered seconds the buffer is [`BufferHealth::Full`].
    pub high_threshold_secs: f64,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            low_threshold_secs: 4.0,
            high_threshold_secs: 10.0,
        }
    }
}

impl HealthOptions {
    /// Thresholds derived from the player's buffering goal: half the goal
    /// is low, the goal itself is full.
    pub fn from_buffering_goal(goal: Duration) -> Self {
        let goal = goal.as_secs_f64();
        Self {
            low_threshold_secs: goal / 2.0,
            high_threshold_secs: goal,
            ..Self::default()
        }
    }
}

/// What to apply while the buffer sits at a given health level.
#[derive(Clone, Copy, Debug, PartialEq, Setters)]
#[setters(prefix = "with_")]
pub struct LevelPolicy {
    pub first_byte_timeout: Duration,
    pub load_timeout: Duration,
    /// Share of the bandwidth estimate a variant may require.
    pub usage_factor: f64,
}

impl LevelPolicy {
    pub fn new(first_byte_timeout: Duration, load_timeout: Duration, usage_factor: f64) -> Self {
        Self {
            first_byte_timeout,
            load_timeout,
            usage_factor,
        }
    }

    pub fn retry_parameters(&self) -> RetryParameters {
        RetryParameters {
            timeout: self.load_timeout,
            stall_timeout: self.first_byte_timeout,
        }
    }
}

/// Per-level policies.
#[derive(Clone, Copy, Debug, PartialEq, Setters)]
#[setters(prefix = "with_")]
pub struct LevelPolicies {
    pub low: LevelPolicy,
    pub building: LevelPolicy,
    pub full: LevelPolicy,
    /// While building, slide the usage factor between the low and full
    /// factors by buffer fullness instead of using `building.usage_factor`.
    pub interpolate_building: bool,
}

impl Default for LevelPolicies {
    fn default() -> Self {
        Self {
            low: LevelPolicy::new(Duration::from_secs(1), Duration::from_secs(2), 0.5),
            building: LevelPolicy::new(Duration::from_secs(1), Duration::from_secs(4), 0.7),
            full: LevelPolicy::new(Duration::from_secs(2), Duration::from_secs(6), 0.9),
            interpolate_building: true,
        }
    }
}

impl LevelPolicies {
    pub fn for_level(&self, level: BufferHealth) -> &LevelPolicy {
        match level {
            BufferHealth::Low => &self.low,
            BufferHealth::Building => &self.building,
            BufferHealth::Full => &self.full,
        }
    }

    /// Usage factor for `level` given `ahead` buffered seconds.
    pub fn usage_factor(&self, level: BufferHealth, ahead: f64, health: &HealthOptions) -> f64 {
        if level != BufferHealth::Building || !self.interpolate_building {
            return self.for_level(level).usage_factor;
        }
        let span = health.high_threshold_secs - health.low_threshold_secs;
        if span <= 0.0 {
            return self.building.usage_factor;
        }
        let ratio = ((ahead - health.low_threshold_secs) / span).clamp(0.0, 1.0);
        self.low.usage_factor + (self.full.usage_factor - self.low.usage_factor) * ratio
    }
}

/// Top-level configuration of an ABR session.
#[derive(Clone, Debug, Setters)]
#[setters(prefix = "with_")]
pub struct AbrOptions {
    pub estimator: EstimatorOptions,
    pub health: HealthOptions,
    pub levels: LevelPolicies,
    /// Tracker timeouts in effect before the first health level applies.
    pub timeouts: TimeoutOptions,
    pub retry: RetryOptions,
    pub restrictions: VariantRestrictions,
    /// Capacity of the monitoring event channel.
    pub event_capacity: usize,
}

impl Default for AbrOptions {
    fn default() -> Self {
        Self {
            estimator: EstimatorOptions::default(),
            health: HealthOptions::default(),
            levels: LevelPolicies::default(),
            timeouts: TimeoutOptions::default(),
            retry: RetryOptions::default(),
            restrictions: VariantRestrictions::default(),
            event_capacity: 64,
        }
    }
}

fn ensure(ok: bool, msg: impl FnOnce() -> String) -> AbrResult<()> {
    if ok { Ok(()) } else { Err(AbrError::invalid(msg())) }
}

impl AbrOptions {
    /// # Errors
    ///
    /// Returns [`AbrError::InvalidConfig`] for settings the control loop
    /// cannot run with.
    pub fn validate(&self) -> AbrResult<()> {
        let est = &self.estimator;
        ensure(est.sample_window > 0, || "sample_window must be > 0".into())?;
        ensure(!est.min_duration.is_zero(), || {
            "min_duration must be > 0".into()
        })?;
        ensure(!est.tick_interval.is_zero(), || {
            "tick_interval must be > 0".into()
        })?;

        let health = &self.health;
        ensure(!health.poll_interval.is_zero(), || {
            "poll_interval must be > 0".into()
        })?;
        let (low, high) = (health.low_threshold_secs, health.high_threshold_secs);
        ensure(low.is_finite() && high.is_finite() && low >= 0.0, || {
            format!("buffer thresholds must be finite and non-negative, got {low}/{high}")
        })?;
        ensure(low <= high, || {
            format!("low threshold {low} exceeds high threshold {high}")
        })?;

        for (name, policy) in [
            ("low", &self.levels.low),
            ("building", &self.levels.building),
            ("full", &self.levels.full),
        ] {
            ensure(
                policy.usage_factor > 0.0 && policy.usage_factor <= 1.0,
                || format!("{name} usage_factor must be in (0, 1], got {}", policy.usage_factor),
            )?;
            ensure(
                !policy.first_byte_timeout.is_zero() && !policy.load_timeout.is_zero(),
                || format!("{name} timeouts must be > 0"),
            )?;
        }

        ensure(
            !self.timeouts.first_byte.is_zero() && !self.timeouts.load.is_zero(),
            || "initial timeouts must be > 0".into(),
        )?;
        ensure(self.retry.max_failures != Some(0), || {
            "max_failures must be > 0 when set".into()
        })?;

        let r = &self.restrictions;
        ensure(
            ordered(r.min_bandwidth_bps, r.max_bandwidth_bps)
                && ordered(r.min_width, r.max_width)
                && ordered(r.min_height, r.max_height)
                && ordered(r.min_pixels, r.max_pixels),
            || format!("restriction minimum exceeds maximum: {r:?}"),
        )
    }
}

fn ordered<T: PartialOrd>(min: Option<T>, max: Option<T>) -> bool {
    match (min, max) {
        (Some(min), Some(max)) => min <= max,
        _ => true,
    }
}
