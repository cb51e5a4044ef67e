use crate::error::RateError;
use crate::progression::ProgressionSegment;

/// Largest precinct partition exponent the COD marker can carry.
pub const MAX_PRECINCT_EXP: u8 = 15;

/// Coding options the rate allocator and packet encoder operate under.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Number of wavelet decomposition levels (resolution levels - 1).
    pub decomposition_levels: u8,
    /// log2 of the nominal code-block width (6 = 64 samples).
    pub codeblock_width_exp: u8,
    /// log2 of the nominal code-block height.
    pub codeblock_height_exp: u8,
    /// Per-resolution precinct partition exponents (PPx, PPy). Empty means
    /// maximal precincts everywhere; otherwise the last entry repeats for
    /// the remaining resolution levels.
    pub precinct_exponents: Vec<(u8, u8)>,
    /// Quality layer schedule.
    pub layers: LayerSchedule,
    /// Per-tile options; the last entry repeats for further tiles.
    pub tiles: Vec<TileConfig>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            decomposition_levels: 5,
            codeblock_width_exp: 6,
            codeblock_height_exp: 6,
            precinct_exponents: Vec::new(),
            layers: LayerSchedule::default(),
            tiles: vec![TileConfig::default()],
        }
    }
}

impl EncoderConfig {
    /// Precinct exponents for resolution level `r`.
    pub fn precinct_exponents(&self, r: u8) -> (u8, u8) {
        if self.precinct_exponents.is_empty() {
            return (MAX_PRECINCT_EXP, MAX_PRECINCT_EXP);
        }
        let idx = (r as usize).min(self.precinct_exponents.len() - 1);
        self.precinct_exponents[idx]
    }

    /// Options for tile `t`.
    pub fn tile(&self, t: usize) -> &TileConfig {
        let idx = t.min(self.tiles.len().saturating_sub(1));
        &self.tiles[idx]
    }

    pub fn validate(&self) -> Result<(), RateError> {
        if self.decomposition_levels > 32 {
            return Err(RateError::InvalidParameterDecompositionLevels);
        }
        // Code-block dimensions: 4..=1024 samples, area at most 4096.
        let (wx, wy) = (self.codeblock_width_exp, self.codeblock_height_exp);
        if !(2..=10).contains(&wx) || !(2..=10).contains(&wy) || wx + wy > 12 {
            return Err(RateError::InvalidParameterCodeBlockSize);
        }
        for (i, &(ppx, ppy)) in self.precinct_exponents.iter().enumerate() {
            if ppx > MAX_PRECINCT_EXP || ppy > MAX_PRECINCT_EXP {
                return Err(RateError::InvalidParameterPrecinctSize);
            }
            // Above the lowest resolution level the partition is halved in
            // band coordinates, so a zero exponent cannot be represented.
            let used_above_r0 =
                i > 0 || (self.decomposition_levels > 0 && self.precinct_exponents.len() == 1);
            if used_above_r0 && (ppx == 0 || ppy == 0) {
                return Err(RateError::InvalidParameterPrecinctSize);
            }
        }
        if self.tiles.is_empty() {
            return Err(RateError::InvalidParameterProgression);
        }
        self.layers.validate()
    }
}

/// Quality layer schedule: a target rate plus optional optimization points
/// that pin intermediate layers to given bitrates.
#[derive(Debug, Clone)]
pub struct LayerSchedule {
    /// Intermediate (bitrate, extra layers) pairs, bitrates strictly
    /// increasing and below the target.
    pub optimization_points: Vec<OptimizationPoint>,
    /// Overall target bitrate in bits per sample.
    pub target_bitrate: f32,
}

/// An intermediate layer anchor: `extra_layers` additional layers are
/// interpolated geometrically below `bitrate`, then a layer is placed at
/// `bitrate` itself.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationPoint {
    pub bitrate: f32,
    pub extra_layers: u32,
}

impl Default for LayerSchedule {
    fn default() -> Self {
        Self {
            optimization_points: Vec::new(),
            target_bitrate: 1.0,
        }
    }
}

impl LayerSchedule {
    /// Cumulative per-layer bitrates, ending at the target.
    pub fn layer_bitrates(&self) -> Vec<f64> {
        let mut rates: Vec<f64> = Vec::new();
        let mut prev: Option<f64> = None;
        for pt in &self.optimization_points {
            let hi = pt.bitrate as f64;
            // Geometric spacing up to the anchor; with no lower anchor the
            // spacing halves the rate per extra layer.
            let lo = prev.unwrap_or(hi / (1u64 << pt.extra_layers.min(32)) as f64);
            let steps = pt.extra_layers as usize + 1;
            for i in 1..=steps {
                rates.push(lo * (hi / lo).powf(i as f64 / steps as f64));
            }
            prev = Some(hi);
        }
        let target = self.target_bitrate as f64;
        if rates.last().is_none_or(|&r| r < target) {
            rates.push(target);
        }
        rates
    }

    pub fn validate(&self) -> Result<(), RateError> {
        if !(self.target_bitrate > 0.0) {
            return Err(RateError::InvalidParameterLayers);
        }
        let mut prev = 0.0f32;
        for pt in &self.optimization_points {
            if pt.bitrate <= prev || pt.bitrate > self.target_bitrate {
                return Err(RateError::InvalidParameterLayers);
            }
            prev = pt.bitrate;
        }
        Ok(())
    }
}

/// Per-tile codestream options.
#[derive(Debug, Clone, Default)]
pub struct TileConfig {
    /// Emit SOP markers before each packet.
    pub sop_markers: bool,
    /// Emit an EPH marker after each packet header.
    pub eph_markers: bool,
    /// Progression segments; empty means one LRCP segment covering the
    /// whole tile.
    pub progression: Vec<ProgressionSegment>,
}
