use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use aulos_events::Counter;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::{NetError, NetResult},
    traits::{RequestControl, Transport, TransportObserver},
    types::{CloseReason, NetOptions, RequestId, RequestInfo, RequestKind},
};

/// Abort switch handed to observers on open.
#[derive(Debug, Default)]
struct InterceptControl {
    cancel: CancellationToken,
    timed_out: AtomicBool,
}

impl InterceptControl {
    fn close_reason(&self) -> CloseReason {
        if self.timed_out.load(Ordering::Acquire) {
            CloseReason::Timeout
        } else {
            CloseReason::Abort
        }
    }
}

impl RequestControl for InterceptControl {
    fn abort(&self) {
        self.cancel.cancel();
    }

    fn timeout(&self) {
        self.timed_out.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

/// HTTP transport that reports every request's lifecycle.
///
/// Each [`fetch`](Transport::fetch) gets a fresh [`RequestId`] and produces
/// `on_open`, `on_first_byte` with the first body chunk, `on_progress` per
/// chunk, and exactly one `on_close`. The control passed on open can abort
/// or time out the request from anywhere.
pub struct HttpTransport {
    client: Client,
    options: NetOptions,
    observer: Arc<dyn TransportObserver>,
    ids: Counter,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("options", &self.options)
            .field("requests", &self.ids.get())
            .finish()
    }
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`NetError::Http`] if the HTTP client cannot be built.
    pub fn new(options: NetOptions, observer: Arc<dyn TransportObserver>) -> NetResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build()
            .map_err(|e| NetError::http(e.to_string()))?;
        Ok(Self {
            client,
            options,
            observer,
            ids: Counter::new(),
        })
    }

    pub fn options(&self) -> &NetOptions {
        &self.options
    }

    async fn download(&self, request: &RequestInfo) -> NetResult<Bytes> {
        let url = request.uri.as_str();
        let resp = self
            .client
            .get(request.uri.clone())
            .timeout(self.options.request_timeout)
            .send()
            .await
            .map_err(|e| NetError::from_reqwest(&e, url))?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) || status == 202 {
            return Err(NetError::http_status(status, url));
        }

        let mut body = BytesMut::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| NetError::from_reqwest(&e, url))?;
            if chunk.is_empty() {
                continue;
            }
            if body.is_empty() {
                self.observer.on_first_byte(request);
            }
            body.extend_from_slice(&chunk);
            self.observer.on_progress(request, body.len() as u64);
        }
        Ok(body.freeze())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, uri: Url, kind: RequestKind) -> NetResult<Bytes> {
        let request = RequestInfo::new(RequestId::new(self.ids.increment()), kind, uri);
        let control = Arc::new(InterceptControl::default());
        self.observer
            .on_open(&request, Arc::clone(&control) as Arc<dyn RequestControl>);

        let result = tokio::select! {
            biased;
            () = control.cancel.cancelled() => {
                let reason = control.close_reason();
                let url = request.uri.as_str();
                Err(match reason {
                    CloseReason::Timeout => NetError::timeout(url),
                    _ => NetError::aborted(url),
                })
            }
            result = self.download(&request) => result,
        };

        let reason = match &result {
            Ok(_) => CloseReason::Load,
            Err(NetError::Timeout { .. }) => CloseReason::Timeout,
            Err(NetError::Aborted { .. }) => CloseReason::Abort,
            Err(_) => CloseReason::Error,
        };
        self.observer.on_close(&request, reason);

        match &result {
            Ok(bytes) => tracing::debug!(
                id = %request.id,
                uri = %request.uri,
                bytes = bytes.len(),
                "request loaded"
            ),
            Err(error) => tracing::debug!(
                id = %request.id,
                uri = %request.uri,
                ?reason,
                %error,
                "request failed"
            ),
        }
        result
    }
}
