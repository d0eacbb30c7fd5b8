#![forbid(unsafe_code)]

//! Transport side of the aulos control loop.
//!
//! - [`TransportObserver`] / [`RequestControl`]: the lifecycle contract
//!   between a transport and the control loop.
//! - [`RequestTracker`]: first-byte and total-load deadlines per in-flight
//!   segment request, reconfigurable at runtime.
//! - [`RetryController`]: consecutive-failure counting with exponential
//!   backoff.
//! - [`HttpTransport`]: a `reqwest` transport that reports its lifecycle.

mod client;
mod error;
mod retry;
mod tracker;
mod traits;
mod types;

pub use crate::{
    client::HttpTransport,
    error::{Failure, FailureCategory, NetError, NetResult, Severity},
    retry::{RetryController, RetryDecision, backoff},
    tracker::RequestTracker,
    traits::{RequestControl, Transport, TransportObserver},
    types::{
        CloseReason, NetOptions, RequestId, RequestInfo, RequestKind, RetryOptions,
        RetryParameters, TimeoutOptions,
    },
};
