//! Tile/component/resolution/subband/precinct geometry.
//!
//! Computes, once per tile-component, the spatial partitioning the packet
//! encoder and the progression iterators rely on: resolution rects, subband
//! rects, precinct grids and the code-block slots each precinct owns.
//! The partitioning is immutable after construction and reused for every
//! quality layer.

use std::collections::HashMap;

use crate::codeblock::CodeBlockId;
use crate::coding_parameters::EncoderConfig;
use crate::error::RateError;

/// Orientation of a wavelet subband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubbandOrientation {
    #[default]
    /// Low-Low (base image)
    LL,
    /// High-Low (horizontal details)
    HL,
    /// Low-High (vertical details)
    LH,
    /// High-High (diagonal details)
    HH,
}

impl SubbandOrientation {
    /// Horizontal orientation offset in the band coordinate formula; 1 once
    /// the horizontal direction went through a high-pass split.
    fn x_offset(self) -> u32 {
        match self {
            SubbandOrientation::LL | SubbandOrientation::LH => 0,
            SubbandOrientation::HL | SubbandOrientation::HH => 1,
        }
    }

    fn y_offset(self) -> u32 {
        match self {
            SubbandOrientation::LL | SubbandOrientation::HL => 0,
            SubbandOrientation::LH | SubbandOrientation::HH => 1,
        }
    }
}

/// Half-open rectangle on one of the coordinate grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GridRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl GridRect {
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    fn intersect(&self, other: &GridRect) -> GridRect {
        GridRect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }
}

/// Image-level geometry as established by the SIZ parameters.
#[derive(Debug, Clone, Default)]
pub struct ImageGeometry {
    /// Total width of the image area on the reference grid.
    pub width: u32,
    /// Total height of the image area on the reference grid.
    pub height: u32,
    /// Horizontal offset of the image area on the reference grid.
    pub x_origin: u32,
    /// Vertical offset of the image area on the reference grid.
    pub y_origin: u32,
    /// Width of an individual tile.
    pub tile_width: u32,
    /// Height of an individual tile.
    pub tile_height: u32,
    /// Horizontal offset of the first tile on the reference grid.
    pub tile_x_origin: u32,
    /// Vertical offset of the first tile on the reference grid.
    pub tile_y_origin: u32,
    /// Per-component subsampling factors.
    pub components: Vec<ComponentGeometry>,
}

/// Subsampling of a single component relative to the reference grid.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentGeometry {
    pub dx: u8,
    pub dy: u8,
}

impl ImageGeometry {
    pub fn num_tiles_x(&self) -> u32 {
        let span = self.x_origin + self.width - self.tile_x_origin;
        span.div_ceil(self.tile_width)
    }

    pub fn num_tiles_y(&self) -> u32 {
        let span = self.y_origin + self.height - self.tile_y_origin;
        span.div_ceil(self.tile_height)
    }

    pub fn num_tiles(&self) -> usize {
        (self.num_tiles_x() * self.num_tiles_y()) as usize
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Tile rectangle on the reference grid, clipped to the image area.
    pub fn tile_rect(&self, tile: usize) -> GridRect {
        let tx = tile as u32 % self.num_tiles_x();
        let ty = tile as u32 / self.num_tiles_x();
        let x0 = (self.tile_x_origin + tx * self.tile_width).max(self.x_origin);
        let y0 = (self.tile_y_origin + ty * self.tile_height).max(self.y_origin);
        let x1 = (self.tile_x_origin + (tx + 1) * self.tile_width).min(self.x_origin + self.width);
        let y1 = (self.tile_y_origin + (ty + 1) * self.tile_height).min(self.y_origin + self.height);
        GridRect { x0, y0, x1, y1 }
    }

    /// Total number of image samples, used to convert bitrates to bytes.
    pub fn num_samples(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn validate(&self) -> Result<(), RateError> {
        if self.width == 0
            || self.height == 0
            || self.tile_width == 0
            || self.tile_height == 0
            || self.components.is_empty()
            || self.tile_x_origin > self.x_origin
            || self.tile_y_origin > self.y_origin
        {
            return Err(RateError::InvalidParameterGeometry);
        }
        if self.components.iter().any(|c| c.dx == 0 || c.dy == 0) {
            return Err(RateError::InvalidParameterGeometry);
        }
        Ok(())
    }
}

/// One code-block position inside a precinct.
#[derive(Debug, Clone)]
pub struct CodeBlockSlot {
    /// Position within the precinct's code-block grid (tag tree leaf).
    pub tt_x: usize,
    pub tt_y: usize,
    /// Index within the subband's global code-block grid, the coordinate
    /// space the entropy coder reports blocks in.
    pub sb_x: u32,
    pub sb_y: u32,
    /// Spatial extent in band coordinates.
    pub rect: GridRect,
    /// Bound rate-distortion record, filled during statistics collection.
    pub block: Option<CodeBlockId>,
}

/// Per-subband slice of a precinct.
#[derive(Debug, Clone, Default)]
pub struct PrecinctBand {
    /// Code-block grid dimensions (also the tag tree dimensions).
    pub grid_width: usize,
    pub grid_height: usize,
    /// Slots in raster order within the grid.
    pub slots: Vec<CodeBlockSlot>,
}

/// A precinct of one resolution level.
#[derive(Debug, Clone)]
pub struct PrecinctGeometry {
    /// Rectangle on resolution-level coordinates, clipped.
    pub rect: GridRect,
    /// Upper-left corner projected onto the image reference grid; the
    /// ordering key for position-driven progressions. Shared across
    /// resolution levels of the same tile-component so precinct visiting
    /// order stays consistent.
    pub ref_x: u64,
    pub ref_y: u64,
    /// One entry per subband of the resolution level.
    pub bands: Vec<PrecinctBand>,
}

impl PrecinctGeometry {
    pub fn num_code_blocks(&self) -> usize {
        self.bands.iter().map(|b| b.slots.len()).sum()
    }
}

/// A subband of one resolution level, in band coordinates.
#[derive(Debug, Clone)]
pub struct SubbandGeometry {
    pub orientation: SubbandOrientation,
    /// Decomposition level the band was produced at.
    pub decomposition_level: u8,
    pub rect: GridRect,
    /// Effective code-block exponents, nominal size clipped to the
    /// precinct extent in band coordinates.
    pub cb_width_exp: u8,
    pub cb_height_exp: u8,
}

/// One resolution level of a tile-component.
#[derive(Debug, Clone)]
pub struct ResolutionGeometry {
    pub level: u8,
    pub rect: GridRect,
    /// Precinct partition exponents on resolution coordinates.
    pub ppx: u8,
    pub ppy: u8,
    pub num_prec_x: u32,
    pub num_prec_y: u32,
    pub subbands: Vec<SubbandGeometry>,
    pub precincts: Vec<PrecinctGeometry>,
}

impl ResolutionGeometry {
    pub fn num_precincts(&self) -> usize {
        self.precincts.len()
    }
}

/// All resolution levels of one tile-component plus the lookup table
/// binding entropy-coder block coordinates to precinct slots.
pub struct TileCompGeometry {
    pub resolutions: Vec<ResolutionGeometry>,
    slot_index: HashMap<(u8, SubbandOrientation, u32, u32), (usize, usize, usize)>,
}

impl TileCompGeometry {
    pub fn num_precincts(&self, resolution: usize) -> usize {
        self.resolutions
            .get(resolution)
            .map_or(0, |r| r.num_precincts())
    }

    /// Attach a rate-distortion record to its slot.
    pub fn bind(
        &mut self,
        resolution: u8,
        orientation: SubbandOrientation,
        x: u32,
        y: u32,
        id: CodeBlockId,
    ) -> Result<(), RateError> {
        let &(prec, band, slot) = self
            .slot_index
            .get(&(resolution, orientation, x, y))
            .ok_or(RateError::OrphanCodeBlock)?;
        self.resolutions[resolution as usize].precincts[prec].bands[band].slots[slot].block =
            Some(id);
        Ok(())
    }
}

fn ceil_shift(v: u32, shift: u8) -> u32 {
    (((v as u64) + (1u64 << shift) - 1) >> shift) as u32
}

fn ceil_div_i64(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    (a + b - 1).div_euclid(b)
}

/// Band rectangle of orientation `orient` at decomposition level `nb`,
/// derived from the component tile rect. The band origin degenerates to 0
/// in a direction once an ancestor subband was high-pass split there; the
/// orientation offset term realizes exactly that.
fn band_rect(comp_rect: &GridRect, nb: u8, orient: SubbandOrientation) -> GridRect {
    let scale = 1i64 << nb;
    let half = if nb > 0 { 1i64 << (nb - 1) } else { 0 };
    let xo = half * orient.x_offset() as i64;
    let yo = half * orient.y_offset() as i64;
    GridRect {
        x0: ceil_div_i64(comp_rect.x0 as i64 - xo, scale).max(0) as u32,
        y0: ceil_div_i64(comp_rect.y0 as i64 - yo, scale).max(0) as u32,
        x1: ceil_div_i64(comp_rect.x1 as i64 - xo, scale).max(0) as u32,
        y1: ceil_div_i64(comp_rect.y1 as i64 - yo, scale).max(0) as u32,
    }
}

/// Build the full geometry of one tile-component.
pub fn build_tile_comp(
    image: &ImageGeometry,
    tile: usize,
    comp: usize,
    config: &EncoderConfig,
) -> TileCompGeometry {
    let tile_rect = image.tile_rect(tile);
    let cg = image.components[comp];
    let comp_rect = GridRect {
        x0: (tile_rect.x0).div_ceil(cg.dx as u32),
        y0: (tile_rect.y0).div_ceil(cg.dy as u32),
        x1: (tile_rect.x1).div_ceil(cg.dx as u32),
        y1: (tile_rect.y1).div_ceil(cg.dy as u32),
    };

    let ndl = config.decomposition_levels;
    let mut resolutions = Vec::with_capacity(ndl as usize + 1);
    let mut slot_index = HashMap::new();

    for r in 0..=ndl {
        let shift = ndl - r;
        let rect = GridRect {
            x0: ceil_shift(comp_rect.x0, shift),
            y0: ceil_shift(comp_rect.y0, shift),
            x1: ceil_shift(comp_rect.x1, shift),
            y1: ceil_shift(comp_rect.y1, shift),
        };

        let (ppx, ppy) = config.precinct_exponents(r);
        // Precinct partition size in band coordinates; halved for
        // resolution levels above the lowest (wire-format rule).
        let band_shift: u8 = if r == 0 { 0 } else { 1 };
        let cbw_exp = config.codeblock_width_exp.min(ppx.saturating_sub(band_shift));
        let cbh_exp = config.codeblock_height_exp.min(ppy.saturating_sub(band_shift));

        let subbands: Vec<SubbandGeometry> = if r == 0 {
            vec![SubbandGeometry {
                orientation: SubbandOrientation::LL,
                decomposition_level: ndl,
                rect: band_rect(&comp_rect, ndl, SubbandOrientation::LL),
                cb_width_exp: cbw_exp,
                cb_height_exp: cbh_exp,
            }]
        } else {
            let nb = ndl - r + 1;
            [
                SubbandOrientation::HL,
                SubbandOrientation::LH,
                SubbandOrientation::HH,
            ]
            .into_iter()
            .map(|orient| SubbandGeometry {
                orientation: orient,
                decomposition_level: nb,
                rect: band_rect(&comp_rect, nb, orient),
                cb_width_exp: cbw_exp,
                cb_height_exp: cbh_exp,
            })
            .collect()
        };

        let mut precincts = Vec::new();
        let (num_prec_x, num_prec_y) = if rect.is_empty() {
            (0, 0)
        } else {
            let pmin_x = rect.x0 >> ppx;
            let pmin_y = rect.y0 >> ppy;
            let pmax_x = ceil_shift(rect.x1, ppx);
            let pmax_y = ceil_shift(rect.y1, ppy);

            for py in pmin_y..pmax_y {
                for px in pmin_x..pmax_x {
                    let prec_idx = precincts.len();
                    let cell = GridRect {
                        x0: px << ppx,
                        y0: py << ppy,
                        x1: (px + 1) << ppx,
                        y1: (py + 1) << ppy,
                    };
                    let rect_clipped = cell.intersect(&rect);
                    let mut bands = Vec::with_capacity(subbands.len());
                    for (band_idx, sb) in subbands.iter().enumerate() {
                        let band_cell = GridRect {
                            x0: cell.x0 >> band_shift,
                            y0: cell.y0 >> band_shift,
                            x1: cell.x1 >> band_shift,
                            y1: cell.y1 >> band_shift,
                        };
                        let region = band_cell.intersect(&sb.rect);
                        if region.is_empty() {
                            bands.push(PrecinctBand::default());
                            continue;
                        }

                        let cbw_exp = sb.cb_width_exp;
                        let cbh_exp = sb.cb_height_exp;
                        // Code-block partition anchored at 0 in band
                        // coordinates, grid indices relative to the band
                        // origin cell.
                        let gmin_x = region.x0 >> cbw_exp;
                        let gmin_y = region.y0 >> cbh_exp;
                        let gmax_x = ceil_shift(region.x1, cbw_exp);
                        let gmax_y = ceil_shift(region.y1, cbh_exp);
                        let base_x = sb.rect.x0 >> cbw_exp;
                        let base_y = sb.rect.y0 >> cbh_exp;

                        let mut slots = Vec::new();
                        for gy in gmin_y..gmax_y {
                            for gx in gmin_x..gmax_x {
                                let cb_cell = GridRect {
                                    x0: gx << cbw_exp,
                                    y0: gy << cbh_exp,
                                    x1: (gx + 1) << cbw_exp,
                                    y1: (gy + 1) << cbh_exp,
                                };
                                let cb_rect = cb_cell.intersect(&region);
                                if cb_rect.is_empty() {
                                    continue;
                                }
                                let slot_idx = slots.len();
                                slots.push(CodeBlockSlot {
                                    tt_x: (gx - gmin_x) as usize,
                                    tt_y: (gy - gmin_y) as usize,
                                    sb_x: gx - base_x,
                                    sb_y: gy - base_y,
                                    rect: cb_rect,
                                    block: None,
                                });
                                slot_index.insert(
                                    (r, sb.orientation, gx - base_x, gy - base_y),
                                    (prec_idx, band_idx, slot_idx),
                                );
                            }
                        }
                        bands.push(PrecinctBand {
                            grid_width: (gmax_x - gmin_x) as usize,
                            grid_height: (gmax_y - gmin_y) as usize,
                            slots,
                        });
                    }
                    precincts.push(PrecinctGeometry {
                        rect: rect_clipped,
                        ref_x: ((px as u64) << (ppx as u64 + shift as u64)) * cg.dx as u64,
                        ref_y: ((py as u64) << (ppy as u64 + shift as u64)) * cg.dy as u64,
                        bands,
                    });
                }
            }
            (pmax_x - pmin_x, pmax_y - pmin_y)
        };

        resolutions.push(ResolutionGeometry {
            level: r,
            rect,
            ppx,
            ppy,
            num_prec_x,
            num_prec_y,
            subbands,
            precincts,
        });
    }

    TileCompGeometry {
        resolutions,
        slot_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding_parameters::EncoderConfig;

    fn single_tile_image(w: u32, h: u32) -> ImageGeometry {
        ImageGeometry {
            width: w,
            height: h,
            tile_width: w,
            tile_height: h,
            components: vec![ComponentGeometry { dx: 1, dy: 1 }],
            ..Default::default()
        }
    }

    #[test]
    fn test_single_tile_counts() {
        let image = single_tile_image(64, 64);
        let config = EncoderConfig {
            decomposition_levels: 1,
            codeblock_width_exp: 5,
            codeblock_height_exp: 5,
            ..Default::default()
        };
        let geom = build_tile_comp(&image, 0, 0, &config);

        assert_eq!(geom.resolutions.len(), 2);
        // Resolution 0: 32x32 LL, one precinct, one 32x32 code-block.
        let r0 = &geom.resolutions[0];
        assert_eq!(r0.rect.width(), 32);
        assert_eq!(r0.num_precincts(), 1);
        assert_eq!(r0.subbands.len(), 1);
        assert_eq!(r0.precincts[0].bands[0].slots.len(), 1);
        // Resolution 1: HL/LH/HH of 32x32 each, one code-block per band.
        let r1 = &geom.resolutions[1];
        assert_eq!(r1.subbands.len(), 3);
        assert_eq!(r1.num_precincts(), 1);
        assert_eq!(r1.precincts[0].num_code_blocks(), 3);
    }

    #[test]
    fn test_codeblock_grid_split() {
        let image = single_tile_image(128, 64);
        let config = EncoderConfig {
            decomposition_levels: 0,
            codeblock_width_exp: 5,
            codeblock_height_exp: 5,
            ..Default::default()
        };
        let geom = build_tile_comp(&image, 0, 0, &config);
        let r0 = &geom.resolutions[0];
        // 128x64 LL with 32x32 blocks: 4x2 grid in one precinct.
        let band = &r0.precincts[0].bands[0];
        assert_eq!(band.grid_width, 4);
        assert_eq!(band.grid_height, 2);
        assert_eq!(band.slots.len(), 8);
        assert_eq!(band.slots[5].sb_x, 1);
        assert_eq!(band.slots[5].sb_y, 1);
    }

    #[test]
    fn test_precinct_partition_and_halving() {
        let image = single_tile_image(128, 128);
        let config = EncoderConfig {
            decomposition_levels: 1,
            codeblock_width_exp: 6,
            codeblock_height_exp: 6,
            precinct_exponents: vec![(6, 6), (6, 6)],
            ..Default::default()
        };
        let geom = build_tile_comp(&image, 0, 0, &config);

        // Resolution 1 spans 128x128, precinct size 64 -> 2x2 precincts;
        // in band coordinates each precinct is 32x32, so the effective
        // code-block size drops to 32 despite the nominal 64.
        let r1 = &geom.resolutions[1];
        assert_eq!(r1.num_prec_x, 2);
        assert_eq!(r1.num_prec_y, 2);
        assert_eq!(r1.subbands[0].cb_width_exp, 5);
        for prec in &r1.precincts {
            for band in &prec.bands {
                assert_eq!(band.slots.len(), 1);
            }
        }
    }

    #[test]
    fn test_zero_extent_band_has_no_slots() {
        // A 1x1 image with one decomposition: the high-pass bands at
        // resolution 1 are empty and must produce no code-blocks.
        let image = single_tile_image(1, 1);
        let config = EncoderConfig {
            decomposition_levels: 1,
            codeblock_width_exp: 6,
            codeblock_height_exp: 6,
            ..Default::default()
        };
        let geom = build_tile_comp(&image, 0, 0, &config);
        let r1 = &geom.resolutions[1];
        assert_eq!(r1.num_precincts(), 1);
        for band in &r1.precincts[0].bands {
            assert!(band.slots.is_empty());
        }
        // Resolution 0 still carries the single LL sample.
        assert_eq!(geom.resolutions[0].precincts[0].num_code_blocks(), 1);
    }

    #[test]
    fn test_bind_rejects_unknown_block() {
        let image = single_tile_image(64, 64);
        let config = EncoderConfig::default();
        let mut geom = build_tile_comp(&image, 0, 0, &config);
        let err = geom.bind(0, SubbandOrientation::LL, 99, 0, 0);
        assert_eq!(err, Err(RateError::OrphanCodeBlock));
    }

    #[test]
    fn test_subsampled_component_rects() {
        let mut image = single_tile_image(100, 100);
        image.components = vec![
            ComponentGeometry { dx: 1, dy: 1 },
            ComponentGeometry { dx: 2, dy: 2 },
        ];
        let config = EncoderConfig {
            decomposition_levels: 0,
            ..Default::default()
        };
        let g1 = build_tile_comp(&image, 0, 1, &config);
        assert_eq!(g1.resolutions[0].rect.width(), 50);
        assert_eq!(g1.resolutions[0].rect.height(), 50);
    }
}
