use crate::bit_io::PacketBitWriter;

/// Leaf/node value meaning "not set yet"; larger than any layer index or
/// bit-plane count the format can represent.
const UNSET: i32 = 99999;

/// Tag tree for JPEG 2000 packet header coding.
///
/// A quad-tree over a 2D grid of non-decreasing integer values (first
/// inclusion layer, skipped bit-planes). Each internal node carries the
/// minimum of its children; encoding a leaf emits only the information the
/// decoder does not already have. A 0 bit means the value at the current
/// node is larger than the count reached so far, a 1 bit pins it.
#[derive(Clone)]
pub struct TagTree {
    nodes: Vec<TagTreeNode>,
    leaf_width: usize,
    leaf_height: usize,
}

#[derive(Clone, Default, Debug)]
struct TagTreeNode {
    /// Value to convey (leaves: set explicitly; internal: min of children).
    value: i32,
    /// Lower bound already conveyed to the decoder.
    low: i32,
    /// True once the exact value has been signalled.
    known: bool,
    parent_index: Option<usize>,
}

impl TagTree {
    /// Create a new tag tree for a grid of `w` x `h` leaves.
    pub fn new(w: usize, h: usize) -> Self {
        let mut nodes = Vec::new();

        // Level 0 (leaves)
        let mut current_level_start = 0;
        let mut current_w = w;
        let mut current_h = h;

        for _ in 0..(w * h) {
            nodes.push(TagTreeNode::default());
        }

        // Build levels up to the root, linking children to parents.
        while current_w > 1 || current_h > 1 {
            let next_w = current_w.div_ceil(2);
            let next_h = current_h.div_ceil(2);
            let next_level_start = nodes.len();

            for _ in 0..(next_w * next_h) {
                nodes.push(TagTreeNode::default());
            }

            for y in 0..current_h {
                for x in 0..current_w {
                    let child_idx = current_level_start + y * current_w + x;
                    let parent_idx = next_level_start + (y / 2) * next_w + (x / 2);
                    nodes[child_idx].parent_index = Some(parent_idx);
                }
            }

            current_w = next_w;
            current_h = next_h;
            current_level_start = next_level_start;
        }

        let mut tree = Self {
            nodes,
            leaf_width: w,
            leaf_height: h,
        };
        tree.reset();
        tree
    }

    pub fn width(&self) -> usize {
        self.leaf_width
    }

    pub fn height(&self) -> usize {
        self.leaf_height
    }

    /// Reset all node state (values and transmission progress).
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.value = UNSET;
            node.low = 0;
            node.known = false;
        }
    }

    /// Set the value at leaf (x, y) and propagate minima to the ancestors.
    ///
    /// Values must be set in non-decreasing order per leaf, before any
    /// encode call at a threshold that would reveal them.
    pub fn set_value(&mut self, x: usize, y: usize, value: i32) {
        if x >= self.leaf_width || y >= self.leaf_height {
            return;
        }
        let leaf_idx = y * self.leaf_width + x;
        self.nodes[leaf_idx].value = value;

        let mut idx = leaf_idx;
        while let Some(parent) = self.nodes[idx].parent_index {
            if self.nodes[parent].value <= value {
                break;
            }
            self.nodes[parent].value = value;
            idx = parent;
        }
    }

    /// Encode what the decoder needs to determine whether the value at leaf
    /// (x, y) is below `threshold`, continuing from whatever was conveyed
    /// by earlier calls.
    pub fn encode(&mut self, writer: &mut PacketBitWriter, x: usize, y: usize, threshold: i32) {
        if x >= self.leaf_width || y >= self.leaf_height {
            return;
        }
        let leaf_idx = y * self.leaf_width + x;

        // Collect the path from root to leaf.
        let mut path = Vec::new();
        let mut idx = leaf_idx;
        loop {
            path.push(idx);
            match self.nodes[idx].parent_index {
                Some(parent) => idx = parent,
                None => break,
            }
        }

        // A child's count can never be below what its parent has already
        // conveyed, so the bound propagates downwards.
        let mut low = 0;
        for &curr_idx in path.iter().rev() {
            let node = &mut self.nodes[curr_idx];
            if node.low < low {
                node.low = low;
            }
            if !node.known {
                while node.low < threshold {
                    if node.value > node.low {
                        writer.write_bit(0);
                        node.low += 1;
                    } else {
                        writer.write_bit(1);
                        node.known = true;
                        break;
                    }
                }
            }
            if !node.known || node.value >= threshold {
                // The decoder stops here: either the value is only bounded
                // from below, or it is at or past the threshold.
                return;
            }
            low = node.value;
        }
    }
}

#[cfg(test)]
impl TagTree {
    /// Mirror of the decoder side, for verifying encoded bit streams.
    /// Returns the value if it was pinned below `threshold`, otherwise the
    /// lower bound reached (>= threshold means "not included").
    pub(crate) fn decode(
        &mut self,
        reader: &mut crate::bit_io::PacketBitReader,
        x: usize,
        y: usize,
        threshold: i32,
    ) -> Result<i32, ()> {
        let leaf_idx = y * self.leaf_width + x;

        let mut path = Vec::new();
        let mut idx = leaf_idx;
        loop {
            path.push(idx);
            match self.nodes[idx].parent_index {
                Some(parent) => idx = parent,
                None => break,
            }
        }

        let mut low = 0;
        for &curr_idx in path.iter().rev() {
            let node = &mut self.nodes[curr_idx];
            if node.low < low {
                node.low = low;
            }
            if !node.known {
                while node.low < threshold {
                    if reader.read_bit()? == 1 {
                        node.known = true;
                        break;
                    }
                    node.low += 1;
                }
                node.value = node.low;
            }
            if !node.known || node.value >= threshold {
                return Ok(node.low.max(low));
            }
            low = node.value;
        }
        Ok(self.nodes[leaf_idx].value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_io::PacketBitReader;

    #[test]
    fn test_tag_tree_structure() {
        let tt = TagTree::new(3, 3);
        // 9 leaves + 4 mid nodes + root
        assert_eq!(tt.nodes.len(), 14);
        assert_eq!(tt.nodes[0].parent_index, Some(9));
        assert_eq!(tt.nodes[8].parent_index, Some(12));
        assert_eq!(tt.nodes[13].parent_index, None);
    }

    #[test]
    fn test_single_leaf_roundtrip() {
        let mut enc = TagTree::new(1, 1);
        enc.set_value(0, 0, 5);
        let mut writer = PacketBitWriter::new();
        enc.encode(&mut writer, 0, 0, 6);
        let buf = writer.finish();

        let mut dec = TagTree::new(1, 1);
        let mut reader = PacketBitReader::new(&buf);
        assert_eq!(dec.decode(&mut reader, 0, 0, 6).unwrap(), 5);
    }

    #[test]
    fn test_grid_roundtrip() {
        let values = [[5, 2], [10, 0]];
        let mut enc = TagTree::new(2, 2);
        for y in 0..2 {
            for x in 0..2 {
                enc.set_value(x, y, values[y][x]);
            }
        }
        let mut writer = PacketBitWriter::new();
        for y in 0..2 {
            for x in 0..2 {
                enc.encode(&mut writer, x, y, 11);
            }
        }
        let buf = writer.finish();

        let mut dec = TagTree::new(2, 2);
        let mut reader = PacketBitReader::new(&buf);
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(dec.decode(&mut reader, x, y, 11).unwrap(), values[y][x]);
            }
        }
    }

    #[test]
    fn test_incremental_thresholds() {
        // Encode the same leaves at rising thresholds; each round only adds
        // the new information, like inclusion signalling across layers.
        let values = [[0, 2], [1, 3]];
        let mut enc = TagTree::new(2, 2);
        for y in 0..2 {
            for x in 0..2 {
                enc.set_value(x, y, values[y][x]);
            }
        }

        let mut writer = PacketBitWriter::new();
        for threshold in 1..=4 {
            for y in 0..2 {
                for x in 0..2 {
                    enc.encode(&mut writer, x, y, threshold);
                }
            }
        }
        let buf = writer.finish();

        let mut dec = TagTree::new(2, 2);
        let mut reader = PacketBitReader::new(&buf);
        for threshold in 1..=4 {
            for y in 0..2 {
                for x in 0..2 {
                    let got = dec.decode(&mut reader, x, y, threshold).unwrap();
                    if values[y][x] < threshold {
                        assert_eq!(got, values[y][x]);
                    } else {
                        assert!(got >= threshold.min(values[y][x]));
                    }
                }
            }
        }
    }

    #[test]
    fn test_save_restore_via_clone() {
        let mut tree = TagTree::new(2, 2);
        tree.set_value(0, 0, 1);
        let mut writer = PacketBitWriter::new();
        tree.encode(&mut writer, 0, 0, 2);

        let snapshot = tree.clone();

        tree.set_value(1, 0, 3);
        let mut writer2 = PacketBitWriter::new();
        tree.encode(&mut writer2, 1, 0, 4);

        tree = snapshot;
        // After rollback the second leaf is unset again and re-encoding the
        // first leaf at the same threshold emits nothing new.
        let mut writer3 = PacketBitWriter::new();
        tree.encode(&mut writer3, 0, 0, 2);
        assert_eq!(writer3.bit_len(), 0);
    }
}
