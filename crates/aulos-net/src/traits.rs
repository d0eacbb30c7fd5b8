use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use url::Url;

use crate::{
    error::NetResult,
    types::{CloseReason, RequestInfo, RequestKind},
};

/// Control over one in-flight transport operation.
///
/// Both calls are idempotent and must end the request with exactly one
/// close event: `Close(Abort)` after [`abort`](Self::abort),
/// `Close(Timeout)` after [`timeout`](Self::timeout).
#[cfg_attr(test, automock)]
pub trait RequestControl: Send + Sync {
    fn abort(&self);

    /// Abort the request and report it as timed out.
    fn timeout(&self);
}

/// Receiver of transport lifecycle events.
///
/// For a given request the calls arrive in lifecycle order:
/// `on_open`, optionally `on_first_byte`, any number of `on_progress`, and
/// exactly one `on_close`.
pub trait TransportObserver: Send + Sync {
    fn on_open(&self, request: &RequestInfo, control: Arc<dyn RequestControl>);

    fn on_first_byte(&self, request: &RequestInfo);

    /// `loaded` is the cumulative body size received so far.
    fn on_progress(&self, request: &RequestInfo, loaded: u64);

    fn on_close(&self, request: &RequestInfo, reason: CloseReason);
}

/// Fetches one resource while reporting its lifecycle to an observer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, uri: Url, kind: RequestKind) -> NetResult<Bytes>;
}
