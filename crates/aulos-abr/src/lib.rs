//! Adaptive bitrate control loop.
//!
//! An [`AbrSession`] ties together:
//!
//! - [`BandwidthEstimator`]: rolling mean of per-request and network-wide
//!   throughput samples, recomputed on a fixed tick;
//! - [`BufferHealthMonitor`]: polls the [`Player`]'s buffer and reports
//!   [`BufferHealth`] transitions;
//! - [`VariantSelector`]: picks the highest variant affordable under
//!   `estimate * usage_factor`;
//! - `aulos_net::RequestTracker` and `aulos_net::RetryController` for
//!   request deadlines and failure backoff.
//!
//! Buffer health drives the rest: each level carries its own request
//! timeouts and usage factor, and a low buffer sheds in-flight requests and
//! drops straight to the lowest variant.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use aulos_abr::{AbrOptions, AbrSession, BufferedRange, Player, Variant};
//! use aulos_net::RetryParameters;
//!
//! struct MyPlayer;
//!
//! impl Player for MyPlayer {
//!     fn buffered_ranges(&self) -> Vec<BufferedRange> {
//!         vec![BufferedRange::new(0.0, 12.0)]
//!     }
//!     fn playhead_position(&self) -> Option<f64> {
//!         Some(3.0)
//!     }
//!     fn available_variants(&self) -> Vec<Variant> {
//!         vec![Variant::new(0, 800_000), Variant::new(1, 2_400_000)]
//!     }
//!     fn configure_retry(&self, _params: RetryParameters) {}
//! }
//!
//! # async fn run() -> Result<(), aulos_abr::AbrError> {
//! let session = AbrSession::start(Arc::new(MyPlayer), AbrOptions::default())?;
//! session.init(|variant| println!("fetch variant {}", variant.variant_index));
//! session.refresh_variants();
//! session.enable();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod error;
mod estimator;
mod events;
mod health;
mod options;
mod player;
mod selector;
mod session;
mod types;

pub use crate::{
    error::{AbrError, AbrResult},
    estimator::{BandwidthEstimator, throughput_bps},
    events::{AbrEvent, Event, EventBus, NetEvent},
    health::{BufferHealth, BufferHealthMonitor, HealthSample, HealthTransition, buffered_ahead},
    options::{AbrOptions, EstimatorOptions, HealthOptions, LevelPolicies, LevelPolicy},
    player::{Player, SwitchCallback},
    selector::VariantSelector,
    session::AbrSession,
    types::{BufferedRange, Resolution, Variant, VariantRestrictions},
};
