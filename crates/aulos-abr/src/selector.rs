use std::{fmt, sync::Arc, time::Duration};

use aulos_events::{Observable, Subscription};
use aulos_platform::Mutex;

use crate::{
    player::SwitchCallback,
    types::{Variant, VariantRestrictions},
};

#[derive(Default)]
struct SelectorState {
    /// Strictly descending by bandwidth.
    catalog: Vec<Variant>,
    index: usize,
    enabled: bool,
    switch: Option<SwitchCallback>,
}

/// Picks the variant to download next.
///
/// The catalog is re-derived on every [`set_variants`](Self::set_variants):
/// filtered by the configured restrictions, then sorted by descending
/// bandwidth. Index `0` is the highest remaining variant.
#[derive(Clone)]
pub struct VariantSelector {
    restrictions: VariantRestrictions,
    state: Arc<Mutex<SelectorState>>,
    selection: Observable<usize>,
}

impl fmt::Debug for VariantSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VariantSelector")
            .field("restrictions", &self.restrictions)
            .field("variants", &state.catalog.len())
            .field("index", &state.index)
            .field("enabled", &state.enabled)
            .finish()
    }
}

impl VariantSelector {
    pub fn new(restrictions: VariantRestrictions) -> Self {
        Self {
            restrictions,
            state: Arc::new(Mutex::new(SelectorState::default())),
            selection: Observable::new(0),
        }
    }

    /// Register the callback notified on each downloaded segment.
    pub fn init(&self, switch: SwitchCallback) {
        self.state.lock().switch = Some(switch);
    }

    /// Replace the catalog and reset the selection to the highest variant.
    ///
    /// Of several variants with the same bandwidth only the first one offered
    /// is kept. Returns the size of the new catalog.
    pub fn set_variants<I>(&self, variants: I) -> usize
    where
        I: IntoIterator<Item = Variant>,
    {
        let mut catalog: Vec<Variant> = variants
            .into_iter()
            .filter(|v| self.restrictions.allows(v))
            .collect();
        catalog.sort_by(|a, b| b.bandwidth_bps.cmp(&a.bandwidth_bps));
        catalog.dedup_by_key(|v| v.bandwidth_bps);

        let len = catalog.len();
        {
            let mut state = self.state.lock();
            state.catalog = catalog;
            state.index = 0;
        }
        tracing::debug!(variants = len, "variant catalog updated");
        self.selection.publish(0);
        len
    }

    pub fn variants(&self) -> Vec<Variant> {
        self.state.lock().catalog.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().catalog.is_empty()
    }

    pub fn index(&self) -> usize {
        self.state.lock().index
    }

    /// The selected variant, `None` while the catalog is empty.
    pub fn choose_variant(&self) -> Option<Variant> {
        let state = self.state.lock();
        state.catalog.get(state.index).cloned()
    }

    /// Move the selection. Returns `true` if it changed.
    pub fn set_variant_index(&self, index: usize) -> bool {
        {
            let mut state = self.state.lock();
            if index == state.index {
                return false;
            }
            if index >= state.catalog.len() {
                tracing::warn!(
                    index,
                    variants = state.catalog.len(),
                    "variant index out of range"
                );
                return false;
            }
            state.index = index;
        }
        self.selection.publish(index);
        true
    }

    /// Select the highest variant whose bandwidth fits in
    /// `estimate_bps * usage_factor`, or the lowest one if none fits.
    ///
    /// Returns the selected index, `None` while the catalog is empty.
    pub fn recompute(&self, estimate_bps: u64, usage_factor: f64) -> Option<usize> {
        let budget = estimate_bps as f64 * usage_factor;
        let index = {
            let state = self.state.lock();
            let last = state.catalog.len().checked_sub(1)?;
            state
                .catalog
                .iter()
                .position(|v| v.bandwidth_bps as f64 <= budget)
                .unwrap_or(last)
        };
        if self.set_variant_index(index) {
            tracing::debug!(estimate_bps, usage_factor, index, "variant reselected");
        }
        Some(index)
    }

    pub fn select_lowest(&self) -> Option<usize> {
        let last = self.len().checked_sub(1)?;
        self.set_variant_index(last);
        Some(last)
    }

    pub fn enable(&self) {
        self.state.lock().enabled = true;
    }

    pub fn disable(&self) {
        self.state.lock().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Hand the current selection to the switch callback. Does nothing
    /// while disabled, before [`init`](Self::init) or with an empty catalog.
    pub fn segment_downloaded(&self, delta: Duration, bytes: u64) -> bool {
        let (switch, variant) = {
            let state = self.state.lock();
            if !state.enabled {
                return false;
            }
            let (Some(switch), Some(variant)) =
                (state.switch.clone(), state.catalog.get(state.index).cloned())
            else {
                return false;
            };
            (switch, variant)
        };
        tracing::trace!(?delta, bytes, variant = variant.variant_index, "segment downloaded");
        switch(&variant);
        true
    }

    /// Disable and release the switch callback. Idempotent.
    pub fn stop(&self) {
        let released = {
            let mut state = self.state.lock();
            state.enabled = false;
            state.switch.take()
        };
        drop(released);
    }

    pub fn selection(&self) -> &Observable<usize> {
        &self.selection
    }

    /// Called with every selected index.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&usize) + Send + Sync + 'static,
    {
        self.selection.subscribe(f)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;

    fn ladder() -> Vec<Variant> {
        vec![
            Variant::new(0, 1_000_000).with_resolution(1280, 720),
            Variant::new(1, 250_000).with_resolution(426, 240),
            Variant::new(2, 4_000_000).with_resolution(1920, 1080),
            Variant::new(3, 500_000).with_resolution(640, 360),
        ]
    }

    fn selector() -> VariantSelector {
        let selector = VariantSelector::new(VariantRestrictions::default());
        selector.set_variants(ladder());
        selector
    }

    fn bandwidths(selector: &VariantSelector) -> Vec<u64> {
        selector.variants().iter().map(|v| v.bandwidth_bps).collect()
    }

    #[test]
    fn catalog_is_sorted_descending_and_selection_reset() {
        let selector = selector();
        assert_eq!(
            bandwidths(&selector),
            vec![4_000_000, 1_000_000, 500_000, 250_000]
        );
        assert!(selector.set_variant_index(2));
        selector.set_variants(ladder());
        assert_eq!(selector.index(), 0);
        assert_eq!(selector.choose_variant().map(|v| v.variant_index), Some(2));
    }

    #[test]
    fn equal_bandwidths_keep_first_offered() {
        let selector = VariantSelector::new(VariantRestrictions::default());
        let len = selector.set_variants([
            Variant::new(0, 500_000),
            Variant::new(1, 800_000),
            Variant::new(2, 500_000),
        ]);
        assert_eq!(len, 2);
        assert_eq!(selector.variants()[1].variant_index, 0);
    }

    #[test]
    fn restrictions_filter_catalog() {
        let selector = VariantSelector::new(
            VariantRestrictions::default()
                .with_max_height(720)
                .with_min_bandwidth_bps(300_000),
        );
        selector.set_variants(ladder());
        assert_eq!(bandwidths(&selector), vec![1_000_000, 500_000]);
    }

    #[rstest]
    #[case::everything_fits(10_000_000, 0.9, 0)]
    #[case::exact_budget(8_000_000, 0.5, 0)]
    #[case::just_below(7_999_999, 0.5, 1)]
    #[case::middle(1_000_000, 0.5, 2)]
    #[case::lowest_fits(300_000, 0.9, 3)]
    #[case::nothing_fits(100_000, 0.5, 3)]
    #[case::zero_estimate(0, 0.9, 3)]
    fn recompute_picks_highest_affordable(
        #[case] estimate: u64,
        #[case] factor: f64,
        #[case] expected: usize,
    ) {
        let selector = selector();
        assert_eq!(selector.recompute(estimate, factor), Some(expected));
        assert_eq!(selector.index(), expected);
    }

    #[test]
    fn recompute_on_empty_catalog_is_none() {
        let selector = VariantSelector::new(VariantRestrictions::default());
        assert_eq!(selector.recompute(1_000_000, 0.9), None);
        assert_eq!(selector.select_lowest(), None);
        assert_eq!(selector.choose_variant(), None);
    }

    #[test]
    fn redundant_and_out_of_range_indices_do_not_publish() {
        let selector = selector();
        let published = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&published);
        let _sub = selector.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!selector.set_variant_index(0));
        assert!(!selector.set_variant_index(4));
        assert_eq!(selector.index(), 0);
        assert_eq!(published.load(Ordering::SeqCst), 0);

        assert!(selector.set_variant_index(3));
        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert_eq!(selector.selection().get(), 3);
    }

    #[test]
    fn segment_downloaded_requires_enabled_callback() {
        let selector = selector();
        let switched = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&switched);

        assert!(!selector.segment_downloaded(Duration::from_millis(200), 50_000));

        selector.init(Arc::new(move |v: &Variant| sink.lock().push(v.variant_index)));
        assert!(!selector.segment_downloaded(Duration::from_millis(200), 50_000));

        selector.enable();
        selector.select_lowest();
        assert!(selector.segment_downloaded(Duration::from_millis(200), 50_000));
        assert_eq!(*switched.lock(), vec![1]);

        selector.disable();
        assert!(!selector.segment_downloaded(Duration::from_millis(200), 50_000));
        assert_eq!(switched.lock().len(), 1);
    }

    #[test]
    fn stop_releases_callback() {
        let selector = selector();
        let callback: SwitchCallback = Arc::new(|_: &Variant| {});
        selector.init(Arc::clone(&callback));
        selector.enable();
        assert_eq!(Arc::strong_count(&callback), 2);

        selector.stop();
        selector.stop();
        assert_eq!(Arc::strong_count(&callback), 1);
        assert!(!selector.is_enabled());
        assert!(!selector.segment_downloaded(Duration::ZERO, 0));
    }

    #[test]
    fn switch_callback_may_reenter_selector() {
        let selector = selector();
        let inner = selector.clone();
        selector.init(Arc::new(move |_: &Variant| {
            inner.set_variant_index(1);
        }));
        selector.enable();
        assert!(selector.segment_downloaded(Duration::ZERO, 0));
        assert_eq!(selector.index(), 1);
        selector.stop();
    }
}
