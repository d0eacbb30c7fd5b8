use derive_setters::Setters;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn pixels(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// One selectable rendition of the content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variant {
    /// Stable identifier assigned by the player.
    pub variant_index: usize,
    /// Bandwidth required to play this rendition, bits per second.
    pub bandwidth_bps: u64,
    /// `None` for audio-only renditions.
    pub resolution: Option<Resolution>,
}

impl Variant {
    pub fn new(variant_index: usize, bandwidth_bps: u64) -> Self {
        Self {
            variant_index,
            bandwidth_bps,
            resolution: None,
        }
    }

    #[must_use]
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution { width, height });
        self
    }
}

/// Bounds a variant must satisfy to stay in the catalog.
///
/// Resolution bounds only apply to variants that carry a resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Setters)]
#[setters(prefix = "with_", strip_option)]
pub struct VariantRestrictions {
    pub min_bandwidth_bps: Option<u64>,
    pub max_bandwidth_bps: Option<u64>,
    pub min_width: Option<u32>,
    pub max_width: Option<u32>,
    pub min_height: Option<u32>,
    pub max_height: Option<u32>,
    pub min_pixels: Option<u64>,
    pub max_pixels: Option<u64>,
}

fn within<T: PartialOrd>(value: T, min: Option<T>, max: Option<T>) -> bool {
    min.is_none_or(|min| value >= min) && max.is_none_or(|max| value <= max)
}

impl VariantRestrictions {
    pub fn allows(&self, variant: &Variant) -> bool {
        if !within(
            variant.bandwidth_bps,
            self.min_bandwidth_bps,
            self.max_bandwidth_bps,
        ) {
            return false;
        }
        let Some(resolution) = variant.resolution else {
            return true;
        };
        within(resolution.width, self.min_width, self.max_width)
            && within(resolution.height, self.min_height, self.max_height)
            && within(resolution.pixels(), self.min_pixels, self.max_pixels)
    }

    pub fn is_unrestricted(&self) -> bool {
        *self == Self::default()
    }
}

/// Buffered media time range, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Half-open: `start <= position < end`.
    pub fn contains(&self, position: f64) -> bool {
        self.start <= position && position < self.end
    }
}
