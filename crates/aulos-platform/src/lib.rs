//! Runtime primitives for the aulos control loop.
//!
//! # Synchronization
//!
//! Re-exports [`parking_lot`] locks. Components keep their state behind a
//! `Mutex` and never invoke foreign callbacks while holding it.
//!
//! # Time
//!
//! All timestamps are [`Instant`] from Tokio's clock so that tests can drive
//! the whole loop under a paused clock. Waiting is never blocking: it is
//! expressed either as a one-shot [`Deadline`] or a periodic [`Ticker`], both
//! running as tasks on the current Tokio runtime.

#![forbid(unsafe_code)]

pub mod time;

pub use parking_lot::Mutex;
pub use time::{Deadline, Instant, Ticker, sleep};
