use crate::geometry::SubbandOrientation;

/// Rate-distortion statistics for one entropy-coded code-block.
///
/// Produced once by the entropy coder and read-only afterwards; the
/// allocator references blocks through [`CodeBlockId`] indices into the
/// [`CodeBlockStore`] arena.
#[derive(Debug, Clone, Default)]
pub struct CodeBlockRateInfo {
    /// Resolution level the block belongs to (0 = lowest).
    pub resolution: u8,
    /// Orientation of the subband containing the block.
    pub orientation: SubbandOrientation,
    /// Horizontal index of the block in the subband's code-block grid.
    pub x: u32,
    /// Vertical index of the block in the subband's code-block grid.
    pub y: u32,
    /// Cumulative byte length at each truncation point.
    pub rates: Vec<usize>,
    /// Distortion decrease per byte at each truncation point. Truncation
    /// points are ordered by non-increasing slope.
    pub slopes: Vec<f32>,
    /// Whether the coded data ending at each truncation point is
    /// independently terminated (decodable on its own segment boundary).
    pub terminated: Vec<bool>,
    /// Most significant bit-planes skipped by the entropy coder.
    pub skip_msbp: u8,
    /// Raw entropy-coded data; truncation rates index into this buffer.
    pub data: Vec<u8>,
    /// Number of region-of-interest coefficients in the block.
    pub roi_coeff_count: u32,
    /// Truncation point index up to which the coded data belongs to the
    /// region of interest (0 = none).
    pub roi_trunc_idx: usize,
}

impl CodeBlockRateInfo {
    /// Number of truncation points available for this block.
    pub fn num_trunc_points(&self) -> usize {
        self.rates.len()
    }

    /// Byte offset covered once truncation point `idx` is included,
    /// with -1 meaning "nothing included".
    pub fn covered_bytes(&self, idx: i32) -> usize {
        if idx < 0 { 0 } else { self.rates[idx as usize] }
    }
}

/// Dense index of a code-block within the [`CodeBlockStore`].
pub type CodeBlockId = usize;

/// Supplier of rate-distortion statistics, implemented by the entropy
/// coding stage.
pub trait CodeBlockSource {
    /// Next code-block of the given tile-component, in any order.
    /// Returns `None` once the tile-component is exhausted.
    fn next_code_block(&mut self, tile: usize, comp: usize) -> Option<CodeBlockRateInfo>;
}

/// Arena owning every code-block of the image.
#[derive(Default)]
pub struct CodeBlockStore {
    blocks: Vec<CodeBlockRateInfo>,
}

impl CodeBlockStore {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: CodeBlockRateInfo) -> CodeBlockId {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub fn get(&self, id: CodeBlockId) -> &CodeBlockRateInfo {
        &self.blocks[id]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeBlockRateInfo> {
        self.blocks.iter()
    }
}
