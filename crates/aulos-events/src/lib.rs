#![forbid(unsafe_code)]

//! Leaf primitives of the aulos control loop.
//!
//! - [`Observable`] holds the latest value of something (a bandwidth
//!   estimate, a buffer health level, a selected variant index) and notifies
//!   subscribers synchronously when a new value is published.
//! - [`Counter`] is a plain monotonic counter used for request ids and
//!   failure counts.
//!
//! Nothing here is global: every owner creates its own instances and passes
//! them explicitly.

mod counter;
mod observable;

pub use counter::Counter;
pub use observable::{Observable, Subscription};
