use std::{fmt, time::Duration};

use derive_setters::Setters;
use url::Url;

/// Opaque identity of one transport request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a request is fetching.
///
/// Only [`RequestKind::Segment`] traffic is tracked and measured; manifest,
/// license and other fetches pass through untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Manifest,
    Segment,
    License,
    Key,
    Timing,
    Other,
}

impl RequestKind {
    pub fn is_segment(self) -> bool {
        matches!(self, Self::Segment)
    }
}

/// Terminal outcome of a request. Exactly one per request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Load,
    Abort,
    Error,
    Timeout,
}

/// Identity of a request as seen in every lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: RequestId,
    pub kind: RequestKind,
    pub uri: Url,
}

impl RequestInfo {
    pub fn new(id: impl Into<RequestId>, kind: RequestKind, uri: Url) -> Self {
        Self {
            id: id.into(),
            kind,
            uri,
        }
    }
}

/// Deadlines applied to every tracked segment request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Setters)]
#[setters(prefix = "with_")]
pub struct TimeoutOptions {
    /// Time allowed between open and the first response byte.
    pub first_byte: Duration,
    /// Time allowed between open and the end of the body.
    pub load: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            first_byte: Duration::from_secs(1),
            load: Duration::from_secs(6),
        }
    }
}

/// Failure backoff configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Setters)]
#[setters(prefix = "with_")]
pub struct RetryOptions {
    /// Failures retried immediately before backoff kicks in.
    pub threshold: u32,
    /// Multiplied by `2^failures` once past the threshold.
    pub base_delay: Duration,
    /// Consecutive failures after which retrying stops and the failure is
    /// handed back to the caller. `None` retries forever.
    #[setters(strip_option)]
    pub max_failures: Option<u32>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            threshold: 2,
            base_delay: Duration::from_millis(100),
            max_failures: None,
        }
    }
}

/// Retry timeouts handed to the player's own networking configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryParameters {
    /// Whole-request timeout.
    pub timeout: Duration,
    /// Timeout while no bytes arrive.
    pub stall_timeout: Duration,
}

/// HTTP transport configuration.
#[derive(Clone, Debug, Setters)]
#[setters(prefix = "with_")]
pub struct NetOptions {
    /// Hard upper bound for a single request, independent of tracker deadlines.
    pub request_timeout: Duration,
    /// Max idle connections per host. Set to 0 to disable pooling.
    pub pool_max_idle_per_host: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 8,
        }
    }
}
