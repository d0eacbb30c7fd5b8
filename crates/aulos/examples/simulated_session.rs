//! Drive an ABR session against a simulated player and network.
//!
//! ```
//! RUST_LOG=aulos_abr=debug cargo run -p aulos --example simulated_session
//! ```
//!
//! Throughput follows a fixed profile that dips halfway through, so the
//! buffer drains, in-flight requests get shed and the selection drops to
//! the lowest variant before recovering.

use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use aulos::{
    platform::{Instant, Mutex},
    prelude::*,
};
use tracing::{info, metadata::LevelFilter, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const SEGMENT_SECS: f64 = 2.0;
const CHUNKS: u64 = 8;
/// Network throughput per segment, bits per second.
const PROFILE: &[u64] = &[
    6_000_000, 6_000_000, 5_000_000, 4_000_000, 1_500_000, 600_000, 400_000, 400_000, 900_000,
    2_500_000, 5_000_000, 6_000_000, 6_000_000, 6_000_000,
];

/// Player that plays in real time from whatever has been downloaded.
struct SimPlayer {
    started: Instant,
    buffered_end: Mutex<f64>,
}

impl SimPlayer {
    fn append_segment(&self) {
        *self.buffered_end.lock() += SEGMENT_SECS;
    }
}

impl Player for SimPlayer {
    fn buffered_ranges(&self) -> Vec<BufferedRange> {
        vec![BufferedRange::new(0.0, *self.buffered_end.lock())]
    }

    fn playhead_position(&self) -> Option<f64> {
        let end = *self.buffered_end.lock();
        Some(self.started.elapsed().as_secs_f64().min(end))
    }

    fn available_variants(&self) -> Vec<Variant> {
        vec![
            Variant::new(0, 400_000).with_resolution(640, 360),
            Variant::new(1, 1_200_000).with_resolution(1280, 720),
            Variant::new(2, 3_500_000).with_resolution(1920, 1080),
        ]
    }

    fn configure_retry(&self, params: RetryParameters) {
        info!(?params.timeout, ?params.stall_timeout, "player retry parameters");
    }
}

#[derive(Default)]
struct SimControl {
    cancelled: AtomicBool,
    timed_out: AtomicBool,
}

impl RequestControl for SimControl {
    fn abort(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn timeout(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Simulate one segment download at `network_bps`.
async fn download(
    session: &AbrSession<SimPlayer>,
    request: &RequestInfo,
    variant: &Variant,
    network_bps: u64,
) -> Result<u64, NetError> {
    let control = Arc::new(SimControl::default());
    session.on_open(request, control.clone());

    let bytes = (variant.bandwidth_bps as f64 * SEGMENT_SECS / 8.0) as u64;
    let transfer = Duration::from_secs_f64(bytes as f64 * 8.0 / network_bps as f64);
    let url = request.uri.as_str();

    tokio::time::sleep(Duration::from_millis(40)).await;
    for chunk in 1..=CHUNKS {
        if control.cancelled.load(Ordering::SeqCst) {
            return Err(if control.timed_out.load(Ordering::SeqCst) {
                session.on_close(request, CloseReason::Timeout);
                NetError::timeout(url)
            } else {
                session.on_close(request, CloseReason::Abort);
                NetError::aborted(url)
            });
        }
        if chunk == 1 {
            session.on_first_byte(request);
        }
        tokio::time::sleep(transfer / CHUNKS as u32).await;
        session.on_progress(request, bytes * chunk / CHUNKS);
    }
    session.on_close(request, CloseReason::Load);
    Ok(bytes)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::default()
                .add_directive("aulos_abr=info".parse()?)
                .add_directive("aulos_net=warn".parse()?)
                .add_directive(LevelFilter::INFO.into()),
        )
        .with_line_number(false)
        .with_file(false)
        .init();

    let player = Arc::new(SimPlayer {
        started: Instant::now(),
        buffered_end: Mutex::new(0.0),
    });
    let session = AbrSession::start(player.clone(), AbrOptions::default())?;
    let mut events = session.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(n, "events lagged");
                }
                Err(_) => break,
            }
        }
    });

    let next = Arc::new(Mutex::new(None::<Variant>));
    let slot = Arc::clone(&next);
    session.init(move |variant| *slot.lock() = Some(variant.clone()));
    session.refresh_variants();
    session.enable();

    let base = Url::parse("https://cdn.example/stream/")?;
    let mut id = 0_u64;
    for (segment, &network_bps) in PROFILE.iter().enumerate() {
        let variant = next
            .lock()
            .take()
            .or_else(|| session.choose_variant())
            .ok_or("no variants")?;

        loop {
            id += 1;
            let uri = base.join(&format!("v{}/seg{segment}.m4s", variant.variant_index))?;
            let request = RequestInfo::new(id, RequestKind::Segment, uri);
            let started = Instant::now();

            match download(&session, &request, &variant, network_bps).await {
                Ok(bytes) => {
                    session.on_success();
                    player.append_segment();
                    info!(
                        segment,
                        variant = variant.variant_index,
                        bytes,
                        estimate = session.bandwidth_estimate(),
                        health = ?session.health(),
                        "segment downloaded"
                    );
                    session.segment_downloaded(started.elapsed(), bytes);
                    break;
                }
                Err(error) => {
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    let decision = session.on_failure(&Failure::Net(error), move || {
                        let _ = tx.send(());
                    });
                    if decision.surfaces() {
                        return Err(format!("segment {segment} failed: {decision:?}").into());
                    }
                    rx.await?;
                }
            }
        }
    }

    session.stop();
    info!("simulation finished");
    Ok(())
}
