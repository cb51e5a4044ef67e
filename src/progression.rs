//! Progression orders and packet sequencing.
//!
//! A progression segment declares which (component, resolution, layer)
//! ranges its packets cover and the nesting order they appear in. All five
//! orders of the format are realized by one parameterized sequence builder
//! producing the explicit packet slot list; the per-(component, resolution)
//! "layers started" watermark prevents double emission when several
//! segments are concatenated.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::geometry::TileCompGeometry;

/// Packet nesting order, with the numeric values the COD marker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ProgressionOrder {
    /// Layer -> resolution -> component -> position.
    Lrcp = 0,
    /// Resolution -> layer -> component -> position.
    Rlcp = 1,
    /// Resolution -> position -> component -> layer.
    Rpcl = 2,
    /// Position -> component -> resolution -> layer.
    Pcrl = 3,
    /// Component -> position -> resolution -> layer.
    Cprl = 4,
}

/// One progression segment of a tile's packet sequence.
#[derive(Debug, Clone, Copy)]
pub struct ProgressionSegment {
    pub order: ProgressionOrder,
    /// Component range [comp_start, comp_end).
    pub comp_start: u16,
    pub comp_end: u16,
    /// Resolution level range [res_start, res_end).
    pub res_start: u8,
    pub res_end: u8,
    /// Layers run from each (component, resolution)'s watermark up to
    /// this exclusive bound.
    pub layer_end: u16,
}

impl ProgressionSegment {
    /// A single segment covering everything, the common configuration.
    pub fn full(order: ProgressionOrder, num_comps: u16, num_res: u8, num_layers: u16) -> Self {
        Self {
            order,
            comp_start: 0,
            comp_end: num_comps,
            res_start: 0,
            res_end: num_res,
            layer_end: num_layers,
        }
    }
}

/// One packet to emit: a (layer, component, resolution, precinct) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSlot {
    pub layer: u16,
    pub comp: u16,
    pub resolution: u8,
    pub precinct: u32,
}

/// Tracks, per (component, resolution), the first layer not yet emitted.
pub struct LayerWatermark {
    started: Vec<Vec<u16>>,
}

impl LayerWatermark {
    pub fn new(comps: &[TileCompGeometry]) -> Self {
        Self {
            started: comps
                .iter()
                .map(|c| vec![0u16; c.resolutions.len()])
                .collect(),
        }
    }

    fn first_layer(&self, comp: u16, res: u8) -> u16 {
        self.started[comp as usize][res as usize]
    }

    fn advance(&mut self, comp: u16, res: u8, layer_end: u16) {
        let entry = &mut self.started[comp as usize][res as usize];
        *entry = (*entry).max(layer_end);
    }
}

/// A precinct instance flattened out of the geometry, keyed for sorting.
struct PrecinctInstance {
    ref_y: u64,
    ref_x: u64,
    comp: u16,
    resolution: u8,
    precinct: u32,
}

/// Build the packet slot sequence of one progression segment.
///
/// `comps` holds the tile's per-component geometry; the watermark is
/// advanced so a following segment does not re-emit covered layers.
pub fn build_segment_sequence(
    comps: &[TileCompGeometry],
    segment: &ProgressionSegment,
    watermark: &mut LayerWatermark,
) -> Vec<PacketSlot> {
    let comp_range = segment.comp_start..segment.comp_end.min(comps.len() as u16);
    let mut sequence = Vec::new();

    let res_range = |comp: u16| {
        let max_res = comps[comp as usize].resolutions.len() as u8;
        segment.res_start..segment.res_end.min(max_res)
    };

    match segment.order {
        ProgressionOrder::Lrcp => {
            for layer in 0..segment.layer_end {
                for res in segment.res_start..segment.res_end {
                    for comp in comp_range.clone() {
                        if !res_range(comp).contains(&res) {
                            continue;
                        }
                        push_precincts(comps, comp, res, layer, watermark, &mut sequence);
                    }
                }
            }
        }
        ProgressionOrder::Rlcp => {
            for res in segment.res_start..segment.res_end {
                for layer in 0..segment.layer_end {
                    for comp in comp_range.clone() {
                        if !res_range(comp).contains(&res) {
                            continue;
                        }
                        push_precincts(comps, comp, res, layer, watermark, &mut sequence);
                    }
                }
            }
        }
        ProgressionOrder::Rpcl | ProgressionOrder::Pcrl | ProgressionOrder::Cprl => {
            let mut instances = Vec::new();
            for comp in comp_range.clone() {
                for res in res_range(comp) {
                    let geometry = &comps[comp as usize].resolutions[res as usize];
                    for (p, prec) in geometry.precincts.iter().enumerate() {
                        instances.push(PrecinctInstance {
                            ref_y: prec.ref_y,
                            ref_x: prec.ref_x,
                            comp,
                            resolution: res,
                            precinct: p as u32,
                        });
                    }
                }
            }
            match segment.order {
                ProgressionOrder::Rpcl => instances
                    .sort_by_key(|i| (i.resolution, i.ref_y, i.ref_x, i.comp, i.precinct)),
                ProgressionOrder::Pcrl => instances
                    .sort_by_key(|i| (i.ref_y, i.ref_x, i.comp, i.resolution, i.precinct)),
                ProgressionOrder::Cprl => instances
                    .sort_by_key(|i| (i.comp, i.ref_y, i.ref_x, i.resolution, i.precinct)),
                _ => unreachable!(),
            }
            for inst in &instances {
                let first = watermark.first_layer(inst.comp, inst.resolution);
                for layer in first..segment.layer_end {
                    sequence.push(PacketSlot {
                        layer,
                        comp: inst.comp,
                        resolution: inst.resolution,
                        precinct: inst.precinct,
                    });
                }
            }
        }
    }

    // Advance the watermark for everything this segment covered.
    for comp in comp_range {
        for res in res_range(comp) {
            watermark.advance(comp, res, segment.layer_end);
        }
    }

    sequence
}

fn push_precincts(
    comps: &[TileCompGeometry],
    comp: u16,
    res: u8,
    layer: u16,
    watermark: &LayerWatermark,
    sequence: &mut Vec<PacketSlot>,
) {
    if layer < watermark.first_layer(comp, res) {
        return;
    }
    let num_prec = comps[comp as usize].num_precincts(res as usize);
    for p in 0..num_prec {
        sequence.push(PacketSlot {
            layer,
            comp,
            resolution: res,
            precinct: p as u32,
        });
    }
}
