//! End-to-end rate allocation tests: synthetic entropy-coder statistics
//! through the full allocate-and-write pipeline.

use j2krate_rs::{
    BufferedCodestreamWriter, CodeBlockRateInfo, CodeBlockSource, ComponentGeometry,
    EncoderConfig, ImageGeometry, LayerSchedule, OptimizationPoint, ProgressionOrder,
    ProgressionSegment, RateAllocator, SubbandOrientation, TileConfig,
};

/// Hands out a fixed set of code-blocks for tile 0, component 0.
struct TestSource {
    blocks: Vec<CodeBlockRateInfo>,
}

impl CodeBlockSource for TestSource {
    fn next_code_block(&mut self, tile: usize, comp: usize) -> Option<CodeBlockRateInfo> {
        if tile != 0 || comp != 0 {
            return None;
        }
        self.blocks.pop()
    }
}

/// 64x64 single-tile grayscale image, one decomposition level, 16x16
/// code-blocks: a 2x2 grid in the LL band and in each of HL/LH/HH.
fn test_image() -> ImageGeometry {
    ImageGeometry {
        width: 64,
        height: 64,
        tile_width: 64,
        tile_height: 64,
        components: vec![ComponentGeometry { dx: 1, dy: 1 }],
        ..Default::default()
    }
}

fn test_config(layers: LayerSchedule, tiles: Vec<TileConfig>) -> EncoderConfig {
    EncoderConfig {
        decomposition_levels: 1,
        codeblock_width_exp: 4,
        codeblock_height_exp: 4,
        layers,
        tiles,
        ..Default::default()
    }
}

/// Five truncation points of 40 bytes each; slopes fall off faster for
/// blocks with a higher `seed` so the allocator has real choices to make.
fn synthetic_block(
    resolution: u8,
    orientation: SubbandOrientation,
    x: u32,
    y: u32,
    seed: u32,
) -> CodeBlockRateInfo {
    let rates: Vec<usize> = (1..=5).map(|j| j * 40).collect();
    let slopes: Vec<f32> = (0..5)
        .map(|j| 256.0 / ((seed + 1) as f32 * (1 << j) as f32))
        .collect();
    CodeBlockRateInfo {
        resolution,
        orientation,
        x,
        y,
        rates,
        slopes,
        terminated: vec![false; 5],
        skip_msbp: (seed % 3) as u8,
        data: (0..200u32).map(|i| (i * 7 + seed) as u8).collect(),
        ..Default::default()
    }
}

fn all_blocks() -> Vec<CodeBlockRateInfo> {
    let mut blocks = Vec::new();
    let mut seed = 0;
    for (res, orient) in [
        (0, SubbandOrientation::LL),
        (1, SubbandOrientation::HL),
        (1, SubbandOrientation::LH),
        (1, SubbandOrientation::HH),
    ] {
        for y in 0..2 {
            for x in 0..2 {
                blocks.push(synthetic_block(res, orient, x, y, seed));
                seed += 1;
            }
        }
    }
    blocks
}

/// The two-layer budget scenario: 500 then 2000 cumulative bytes.
fn two_layer_schedule() -> LayerSchedule {
    // 64x64 samples: 0.9765625 bpp = 500 bytes, 3.90625 bpp = 2000 bytes.
    LayerSchedule {
        optimization_points: vec![OptimizationPoint {
            bitrate: 0.9765625,
            extra_layers: 0,
        }],
        target_bitrate: 3.90625,
    }
}

#[test]
fn test_two_layer_budget_conformance() {
    let mut alloc =
        RateAllocator::new(test_image(), test_config(two_layer_schedule(), vec![TileConfig::default()]))
            .unwrap();
    let mut source = TestSource { blocks: all_blocks() };
    alloc.initialize(&mut source).unwrap();

    assert_eq!(alloc.layers().len(), 2);
    assert_eq!(alloc.layers()[0].max_bytes, 500);
    assert_eq!(alloc.layers()[1].max_bytes, 2000);

    let mut buffer = vec![0u8; 8192];
    let mut writer = BufferedCodestreamWriter::new(&mut buffer);
    alloc.run_and_write(&mut writer).unwrap();
    let written = writer.len();

    let layers = alloc.layers();
    assert!(layers[0].actual_bytes <= 500, "layer 0: {}", layers[0].actual_bytes);
    assert!(layers[1].actual_bytes <= 2000, "layer 1: {}", layers[1].actual_bytes);
    assert!(layers[1].actual_bytes >= layers[0].actual_bytes);
    // The budget should be mostly used, not left on the table.
    assert!(layers[1].actual_bytes > 1500, "layer 1: {}", layers[1].actual_bytes);

    // The real pass must produce exactly the bytes the simulation pass
    // promised, plus the closing EOC marker.
    assert_eq!(written, layers[1].actual_bytes + 2);
    assert_eq!(alloc.tile_lengths().len(), 1);
    assert_eq!(alloc.tile_lengths()[0], layers[1].actual_bytes);

    // Codestream structure: starts with SOT, ends with EOC.
    assert_eq!(&buffer[0..2], &[0xFF, 0x90]);
    assert_eq!(&buffer[written - 2..written], &[0xFF, 0xD9]);
}

#[test]
fn test_selection_monotonicity_and_thresholds() {
    let mut alloc =
        RateAllocator::new(test_image(), test_config(two_layer_schedule(), vec![TileConfig::default()]))
            .unwrap();
    let mut source = TestSource { blocks: all_blocks() };
    alloc.initialize(&mut source).unwrap();

    let mut buffer = vec![0u8; 8192];
    let mut writer = BufferedCodestreamWriter::new(&mut buffer);
    alloc.run_and_write(&mut writer).unwrap();

    let selections = alloc.selections();
    assert_eq!(selections.len(), 2);
    let t1 = alloc.layers()[0].threshold;
    let t2 = alloc.layers()[1].threshold;
    assert!(t2 <= t1, "thresholds must not increase: {t1} -> {t2}");

    for (id, cb) in alloc.store().iter().enumerate() {
        let s1 = selections[0][id];
        let s2 = selections[1][id];
        // Inclusion can only move forward across layers.
        assert!(s2 >= s1, "block {id}: {s1} -> {s2}");
        if s2 >= 0 && t2 > 0.0 {
            // The final included point made the layer-2 threshold.
            assert!(cb.slopes[s2 as usize] >= t2);
        }
        if s2 > s1 && t1 > 0.0 {
            // Everything first included in layer 2 missed layer 1's bar.
            assert!(cb.slopes[s2 as usize] < t1);
        }
    }
}

#[test]
fn test_lossless_target_includes_everything() {
    // 100 bpp is far more than the 3200 data bytes need: the final layer
    // must become lossless (zero threshold, every point included).
    let schedule = LayerSchedule {
        optimization_points: Vec::new(),
        target_bitrate: 100.0,
    };
    let mut alloc =
        RateAllocator::new(test_image(), test_config(schedule, vec![TileConfig::default()])).unwrap();
    let mut source = TestSource { blocks: all_blocks() };
    alloc.initialize(&mut source).unwrap();

    let mut buffer = vec![0u8; 65536];
    let mut writer = BufferedCodestreamWriter::new(&mut buffer);
    alloc.run_and_write(&mut writer).unwrap();

    assert_eq!(alloc.layers().last().unwrap().threshold, 0.0);
    for (id, cb) in alloc.store().iter().enumerate() {
        let last = alloc.selections().last().unwrap()[id];
        assert_eq!(last, cb.num_trunc_points() as i32 - 1, "block {id}");
    }
    // All 16 blocks at 200 bytes each must be in the stream.
    assert!(writer.len() >= 16 * 200);
}

#[test]
fn test_markers_and_progression_combinations() {
    // RLCP progression with SOP and EPH markers on; byte accounting must
    // still match between the simulation and the real write.
    let tile = TileConfig {
        sop_markers: true,
        eph_markers: true,
        progression: vec![ProgressionSegment::full(ProgressionOrder::Rlcp, 1, 2, 2)],
    };
    let mut alloc =
        RateAllocator::new(test_image(), test_config(two_layer_schedule(), vec![tile])).unwrap();
    let mut source = TestSource { blocks: all_blocks() };
    alloc.initialize(&mut source).unwrap();

    let mut buffer = vec![0u8; 16384];
    let mut writer = BufferedCodestreamWriter::new(&mut buffer);
    alloc.run_and_write(&mut writer).unwrap();
    let written = writer.len();

    let layers = alloc.layers();
    assert!(layers[1].actual_bytes <= 2000);
    assert_eq!(written, layers[1].actual_bytes + 2);

    // Four packets (2 layers x 2 resolutions), each preceded by an SOP
    // marker segment.
    let sop_count = buffer[..written]
        .windows(2)
        .filter(|w| w == &[0xFF, 0x91])
        .count();
    assert_eq!(sop_count, 4);
    let eph_count = buffer[..written]
        .windows(2)
        .filter(|w| w == &[0xFF, 0x92])
        .count();
    assert_eq!(eph_count, 4);
}

#[test]
fn test_multi_layer_thresholds_are_monotone() {
    // Four layers: two bisected (first/last), two estimated analytically.
    let schedule = LayerSchedule {
        optimization_points: vec![OptimizationPoint {
            bitrate: 1.953125, // 1000 bytes
            extra_layers: 2,
        }],
        target_bitrate: 5.0,
    };
    let mut alloc =
        RateAllocator::new(test_image(), test_config(schedule, vec![TileConfig::default()]))
            .unwrap();
    let mut source = TestSource { blocks: all_blocks() };
    alloc.initialize(&mut source).unwrap();
    assert_eq!(alloc.layers().len(), 4);

    let mut buffer = vec![0u8; 16384];
    let mut writer = BufferedCodestreamWriter::new(&mut buffer);
    alloc.run_and_write(&mut writer).unwrap();
    let written = writer.len();

    let layers = alloc.layers();
    for pair in layers.windows(2) {
        assert!(pair[1].threshold <= pair[0].threshold);
        assert!(pair[1].actual_bytes >= pair[0].actual_bytes);
    }
    // First and last layers are bisected against their budgets.
    assert!(layers[0].actual_bytes <= layers[0].max_bytes);
    assert!(layers[3].actual_bytes <= layers[3].max_bytes);
    assert_eq!(written, layers[3].actual_bytes + 2);

    // Selections stay monotone per block across all four layers.
    for id in 0..alloc.store().len() {
        for l in 1..4 {
            assert!(alloc.selections()[l][id] >= alloc.selections()[l - 1][id]);
        }
    }
}

#[test]
fn test_rate_too_low_is_fatal() {
    let schedule = LayerSchedule {
        optimization_points: Vec::new(),
        target_bitrate: 0.01,
    };
    let mut alloc =
        RateAllocator::new(test_image(), test_config(schedule, vec![TileConfig::default()])).unwrap();
    let mut source = TestSource { blocks: all_blocks() };
    assert!(alloc.initialize(&mut source).is_err());
}
