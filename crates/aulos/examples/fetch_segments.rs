//! Fetch segment URLs over HTTP with an ABR session observing the transfers.
//!
//! ```
//! cargo run -p aulos --example fetch_segments -- URL [URL...]
//! ```

use std::{env::args, error::Error, sync::Arc};

use aulos::{
    platform::{Instant, Mutex},
    prelude::*,
};
use tracing::{info, metadata::LevelFilter, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Stands in for a player with an unknown buffer: health stays low.
struct Headless {
    variants: Mutex<Vec<Variant>>,
}

impl Player for Headless {
    fn buffered_ranges(&self) -> Vec<BufferedRange> {
        Vec::new()
    }

    fn playhead_position(&self) -> Option<f64> {
        None
    }

    fn available_variants(&self) -> Vec<Variant> {
        self.variants.lock().clone()
    }

    fn configure_retry(&self, params: RetryParameters) {
        info!(?params.timeout, ?params.stall_timeout, "retry parameters");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::default()
                .add_directive("aulos_abr=debug".parse()?)
                .add_directive("aulos_net=debug".parse()?)
                .add_directive(LevelFilter::INFO.into()),
        )
        .with_line_number(false)
        .with_file(false)
        .init();

    let urls = args()
        .skip(1)
        .map(|arg| arg.parse::<Url>())
        .collect::<Result<Vec<_>, _>>()?;
    if urls.is_empty() {
        return Err("usage: fetch_segments URL [URL...]".into());
    }

    let player = Arc::new(Headless {
        variants: Mutex::new(vec![
            Variant::new(0, 500_000),
            Variant::new(1, 1_500_000),
            Variant::new(2, 4_000_000),
        ]),
    });
    let session = Arc::new(AbrSession::start(player, AbrOptions::default())?);
    let transport = HttpTransport::new(NetOptions::default(), session.clone())?;
    session.refresh_variants();

    for url in urls {
        let started = Instant::now();
        match transport.fetch(url.clone(), RequestKind::Segment).await {
            Ok(bytes) => {
                session.on_success();
                session.segment_downloaded(started.elapsed(), bytes.len() as u64);
                info!(%url, bytes = bytes.len(), elapsed = ?started.elapsed(), "fetched");
            }
            Err(error) => {
                let decision = session.on_failure(&Failure::Net(error.clone()), || {});
                warn!(%url, %error, ?decision, "fetch failed");
            }
        }
        session.estimator().tick();
        info!(
            estimate = session.bandwidth_estimate(),
            choice = ?session.choose_variant().map(|v| v.variant_index),
            "after segment"
        );
    }

    session.stop();
    Ok(())
}
