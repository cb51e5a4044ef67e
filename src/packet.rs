//! Packet encoding (Tier-2 coding of code-block contributions).
//!
//! For every (tile, component, resolution, precinct) the encoder keeps the
//! persistent signalling state a packet stream needs across quality layers:
//! the inclusion and maximum-bit-plane tag trees, each code-block's last
//! included truncation point and its Lblock length-signalling budget. The
//! whole state is snapshot-able so the rate allocator can trial-encode a
//! candidate threshold and roll back.

use crate::bit_io::PacketBitWriter;
use crate::codeblock::{CodeBlockId, CodeBlockStore};
use crate::error::RateError;
use crate::geometry::TileCompGeometry;
use crate::tag_tree::TagTree;

/// Truncation point count ceiling of the packet header syntax.
pub const MAX_TRUNC_POINTS_PER_STEP: usize = 163;

/// Initial Lblock value of every code-block.
const INITIAL_LBLOCK: u8 = 3;

/// An encoded packet: header bits (byte-padded, stuffing applied), body
/// bytes, and the region-of-interest span of the body.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    /// True if any body byte falls inside a code-block's ROI cutoff.
    pub roi_in_packet: bool,
    /// Offset within the body up to which ROI data extends.
    pub roi_len: usize,
}

impl Packet {
    pub fn total_len(&self) -> usize {
        self.header.len() + self.body.len()
    }
}

#[derive(Clone)]
struct BandState {
    inclusion: TagTree,
    max_bitplane: TagTree,
}

#[derive(Clone)]
struct PrecinctState {
    bands: Vec<BandState>,
    /// Last layer this precinct encoded a packet for; layers must strictly
    /// increase between calls.
    last_layer: i32,
}

#[derive(Clone)]
struct ResolutionState {
    precincts: Vec<PrecinctState>,
}

#[derive(Clone)]
struct TileCompState {
    resolutions: Vec<ResolutionState>,
}

#[derive(Clone)]
struct EncoderState {
    tile_comps: Vec<Vec<TileCompState>>,
    /// Per code-block: index of the last truncation point included in any
    /// layer so far; -1 while the block has never been included.
    last_trunc: Vec<i32>,
    /// Per code-block: current length-field bit budget, never decreasing.
    lblock: Vec<u8>,
}

/// Persistent packet encoder state for a whole image.
pub struct PacketEncoder {
    state: EncoderState,
    snapshot: Option<EncoderState>,
}

impl PacketEncoder {
    /// Build the encoder state from the precomputed geometry. The tag trees
    /// take their dimensions from each precinct's code-block grid.
    pub fn new(geometry: &[Vec<TileCompGeometry>], num_code_blocks: usize) -> Self {
        let tile_comps = geometry
            .iter()
            .map(|comps| {
                comps
                    .iter()
                    .map(|tc| TileCompState {
                        resolutions: tc
                            .resolutions
                            .iter()
                            .map(|res| ResolutionState {
                                precincts: res
                                    .precincts
                                    .iter()
                                    .map(|prec| PrecinctState {
                                        bands: prec
                                            .bands
                                            .iter()
                                            .map(|band| BandState {
                                                inclusion: TagTree::new(
                                                    band.grid_width,
                                                    band.grid_height,
                                                ),
                                                max_bitplane: TagTree::new(
                                                    band.grid_width,
                                                    band.grid_height,
                                                ),
                                            })
                                            .collect(),
                                        last_layer: -1,
                                    })
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect()
            })
            .collect();

        Self {
            state: EncoderState {
                tile_comps,
                last_trunc: vec![-1; num_code_blocks],
                lblock: vec![INITIAL_LBLOCK; num_code_blocks],
            },
            snapshot: None,
        }
    }

    /// Last included truncation point of a code-block (-1 = never).
    pub fn last_trunc_idx(&self, id: CodeBlockId) -> i32 {
        self.state.last_trunc[id]
    }

    /// Current Lblock of a code-block.
    pub fn lblock(&self, id: CodeBlockId) -> u8 {
        self.state.lblock[id]
    }

    /// Snapshot the complete signalling state.
    pub fn save(&mut self) {
        self.snapshot = Some(self.state.clone());
    }

    /// Roll back to the last snapshot, atomically. The snapshot stays in
    /// place so several trials can restore from the same point.
    pub fn restore(&mut self) {
        let snapshot = self
            .snapshot
            .as_ref()
            .expect("restore() called without a prior save()");
        self.state = snapshot.clone();
    }

    /// Return every code-block to its initial state: no inclusions, Lblock
    /// back at 3, fresh tag trees. Used once before the real write pass so
    /// simulation state does not leak into the output stream.
    pub fn reset(&mut self) {
        for tc in self.state.tile_comps.iter_mut().flatten() {
            for res in &mut tc.resolutions {
                for prec in &mut res.precincts {
                    prec.last_layer = -1;
                    for band in &mut prec.bands {
                        band.inclusion.reset();
                        band.max_bitplane.reset();
                    }
                }
            }
        }
        self.state.last_trunc.fill(-1);
        self.state.lblock.fill(INITIAL_LBLOCK);
        self.snapshot = None;
    }

    /// Encode the packet of `(layer, tile, comp, resolution, precinct)`.
    ///
    /// `trunc_sel` holds, per code-block, the truncation point selected for
    /// this layer (-1 = not included). Returns `None` when the precinct
    /// does not exist at this resolution level, in which case nothing must
    /// be emitted. A precinct that exists but contributes no data yields
    /// the zero-length packet (a single absent bit).
    #[allow(clippy::too_many_arguments)]
    pub fn encode_packet(
        &mut self,
        layer: u16,
        tile: usize,
        comp: usize,
        resolution: usize,
        precinct: usize,
        geometry: &TileCompGeometry,
        store: &CodeBlockStore,
        trunc_sel: &[i32],
    ) -> Result<Option<Packet>, RateError> {
        let Some(res_geom) = geometry.resolutions.get(resolution) else {
            return Ok(None);
        };
        let Some(prec_geom) = res_geom.precincts.get(precinct) else {
            return Ok(None);
        };

        {
            let prec_state = &mut self.state.tile_comps[tile][comp].resolutions[resolution]
                .precincts[precinct];
            assert!(
                (layer as i32) > prec_state.last_layer,
                "packet layer index must be strictly increasing per precinct"
            );
            prec_state.last_layer = layer as i32;
        }

        let threshold = layer as i32 + 1;

        // Zero-length packet if nothing is newly included in any subband.
        let mut any_included = false;
        for band in &prec_geom.bands {
            for slot in &band.slots {
                if let Some(id) = slot.block
                    && trunc_sel[id] > self.state.last_trunc[id]
                {
                    any_included = true;
                }
            }
        }

        let mut hbuf = PacketBitWriter::new();
        if !any_included {
            hbuf.write_bit(0);
            return Ok(Some(Packet {
                header: hbuf.finish(),
                ..Default::default()
            }));
        }
        hbuf.write_bit(1);

        // Tag tree values must be in place before any inclusion coding:
        // first inclusions of this layer pin the inclusion tree, and every
        // bound block contributes its skipped-bit-plane count.
        for (band_idx, band) in prec_geom.bands.iter().enumerate() {
            let bands = &mut self.state.tile_comps[tile][comp].resolutions[resolution].precincts
                [precinct]
                .bands;
            let bs = &mut bands[band_idx];
            for slot in &band.slots {
                if let Some(id) = slot.block {
                    bs.max_bitplane
                        .set_value(slot.tt_x, slot.tt_y, store.get(id).skip_msbp as i32);
                    if self.state.last_trunc[id] < 0 && trunc_sel[id] >= 0 {
                        bs.inclusion.set_value(slot.tt_x, slot.tt_y, layer as i32);
                    }
                }
            }
        }

        // Header: per subband, per code-block in raster order.
        for (band_idx, band) in prec_geom.bands.iter().enumerate() {
            for slot in &band.slots {
                let bs = &mut self.state.tile_comps[tile][comp].resolutions[resolution].precincts
                    [precinct]
                    .bands[band_idx];

                let Some(id) = slot.block else {
                    // No contribution was ever produced for this slot; it
                    // reads as a block that never gets included.
                    bs.inclusion.encode(&mut hbuf, slot.tt_x, slot.tt_y, threshold);
                    continue;
                };
                let cb = store.get(id);
                let prev = self.state.last_trunc[id];
                let cur = trunc_sel[id];

                if prev < 0 {
                    bs.inclusion.encode(&mut hbuf, slot.tt_x, slot.tt_y, threshold);
                    if cur >= 0 {
                        // First inclusion: reveal the skipped bit-planes.
                        bs.max_bitplane.encode(
                            &mut hbuf,
                            slot.tt_x,
                            slot.tt_y,
                            cb.skip_msbp as i32 + 1,
                        );
                    }
                } else {
                    hbuf.write_bit(if cur > prev { 1 } else { 0 });
                }

                if cur <= prev {
                    continue;
                }

                let npnew = (cur - prev) as usize;
                write_trunc_count_vlc(&mut hbuf, npnew)?;

                // Split the new truncation points into independently
                // terminated segments; the last one ends at `cur` whether
                // terminated or not.
                let mut seg_lens: Vec<usize> = Vec::new();
                let mut seg_start = cb.covered_bytes(prev);
                for j in (prev + 1)..=cur {
                    let j = j as usize;
                    if cb.terminated[j] || j as i32 == cur {
                        seg_lens.push(cb.rates[j] - seg_start);
                        seg_start = cb.rates[j];
                    }
                }
                let extra_bits = ceil_log2(seg_lens.len());

                // Comma-coded Lblock increase: enough for the widest
                // segment length to fit its field.
                let lblock = &mut self.state.lblock[id];
                let mut needed = 0u32;
                for &len in &seg_lens {
                    let w = bit_width(len);
                    needed = needed.max(w.saturating_sub(*lblock as u32 + extra_bits));
                }
                for _ in 0..needed {
                    hbuf.write_bit(1);
                }
                hbuf.write_bit(0);
                *lblock += needed as u8;

                let field_bits = (*lblock as u32 + extra_bits) as u8;
                for &len in &seg_lens {
                    hbuf.write_bits(len as u32, field_bits);
                }
            }
        }

        assert!(
            hbuf.bit_len() > 1,
            "non-empty packet produced an empty header"
        );

        // Body: concatenate each included block's newly covered byte range
        // in subband-then-code-block order, tracking the ROI span.
        let mut body = Vec::new();
        let mut roi_in_packet = false;
        let mut roi_len = 0usize;
        for band in &prec_geom.bands {
            for slot in &band.slots {
                let Some(id) = slot.block else { continue };
                let prev = self.state.last_trunc[id];
                let cur = trunc_sel[id];
                if cur <= prev {
                    continue;
                }
                let cb = store.get(id);
                let start = cb.covered_bytes(prev);
                let end = cb.rates[cur as usize];
                body.extend_from_slice(&cb.data[start..end]);
                if cb.roi_trunc_idx > 0 {
                    let roi_end = cb.rates[cb.roi_trunc_idx - 1];
                    if start < roi_end {
                        roi_in_packet = true;
                        roi_len = body.len() - end.saturating_sub(roi_end.min(end));
                    }
                }
                self.state.last_trunc[id] = cur;
            }
        }

        Ok(Some(Packet {
            header: hbuf.finish(),
            body,
            roi_in_packet,
            roi_len,
        }))
    }
}

/// Variable-length code for the number of truncation points transmitted in
/// one inclusion step.
fn write_trunc_count_vlc(writer: &mut PacketBitWriter, n: usize) -> Result<(), RateError> {
    match n {
        0 => writer.write_bit(0),
        1 => writer.write_bits(0b10, 2),
        2..=4 => {
            writer.write_bits(0b110, 3);
            writer.write_bits((n - 2) as u32, 2);
        }
        5..=35 => {
            writer.write_bits(0b1111, 4);
            writer.write_bits((n - 5) as u32, 5);
        }
        36..=MAX_TRUNC_POINTS_PER_STEP => {
            writer.write_bits(0b1_1111_1111, 9);
            writer.write_bits((n - 36) as u32, 7);
        }
        _ => return Err(RateError::TruncationPointLimit(n)),
    }
    Ok(())
}

fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

fn bit_width(v: usize) -> u32 {
    usize::BITS - v.leading_zeros()
}
