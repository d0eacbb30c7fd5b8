use std::sync::Arc;

use aulos_net::RetryParameters;
#[cfg(test)]
use mockall::automock;

use crate::types::{BufferedRange, Variant};

/// The media player driving an ABR session.
#[cfg_attr(test, automock)]
pub trait Player: Send + Sync + 'static {
    /// Buffered time ranges, ordered by start.
    fn buffered_ranges(&self) -> Vec<BufferedRange>;

    /// Current playback position in seconds, `None` before playback starts.
    fn playhead_position(&self) -> Option<f64>;

    fn available_variants(&self) -> Vec<Variant>;

    /// Apply new timeouts to the player's own request retries.
    fn configure_retry(&self, params: RetryParameters);
}

/// Invoked with the variant the player should fetch next.
pub type SwitchCallback = Arc<dyn Fn(&Variant) + Send + Sync>;
