//! Frame geometry and compression parameters.

use crate::consts::{div_ceil, round_up_to_block_dim, BLOCK_DIM};

/// Pixel and block geometry of the frame being encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDimensions {
    /// Image width in pixels.
    pub xsize: usize,
    /// Image height in pixels.
    pub ysize: usize,
    /// Width rounded up to a multiple of the block dimension.
    pub xsize_padded: usize,
    /// Height rounded up to a multiple of the block dimension.
    pub ysize_padded: usize,
    /// Width in 8x8 blocks.
    pub xsize_blocks: usize,
    /// Height in 8x8 blocks.
    pub ysize_blocks: usize,
}

impl FrameDimensions {
    /// Derives all padded/block sizes from the pixel size.
    #[must_use]
    pub fn new(xsize: usize, ysize: usize) -> Self {
        Self {
            xsize,
            ysize,
            xsize_padded: round_up_to_block_dim(xsize),
            ysize_padded: round_up_to_block_dim(ysize),
            xsize_blocks: div_ceil(xsize, BLOCK_DIM),
            ysize_blocks: div_ceil(ysize, BLOCK_DIM),
        }
    }
}

/// Encoder effort level.
///
/// Discriminants order slow to fast, so comparisons read naturally:
/// `tier > SpeedTier::Kitten` means "faster than kitten".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpeedTier {
    /// Slowest, quality-first: local peak-descent refinement.
    Tortoise = 0,
    /// Default metric-guided refinement.
    Kitten = 1,
    Squirrel = 2,
    Wombat = 3,
    Hare = 4,
    Cheetah = 5,
    /// Fastest: single-shot constant quantization.
    Falcon = 6,
}

/// Parameters steering the quantization search.
#[derive(Debug, Clone)]
pub struct CompressParams {
    /// Target perceptual distance. Lower is higher quality.
    pub butteraugli_distance: f32,
    /// Iteration budget for the default metric-guided search.
    pub max_butteraugli_iters: u32,
    /// Iteration budget for the high-quality peak-descent search.
    pub max_butteraugli_iters_guetzli_mode: u32,
    /// Encoder effort level.
    pub speed_tier: SpeedTier,
    /// If positive, bypasses the search with a uniform quantization.
    pub uniform_quant: f32,
    /// Bound the per-channel reconstruction error instead of the
    /// perceptual distance.
    pub max_error_mode: bool,
    /// Per-channel absolute error bounds for max-error mode.
    pub max_error: [f32; 3],
}

impl Default for CompressParams {
    fn default() -> Self {
        Self {
            butteraugli_distance: 1.0,
            max_butteraugli_iters: 7,
            max_butteraugli_iters_guetzli_mode: 100,
            speed_tier: SpeedTier::Kitten,
            uniform_quant: 0.0,
            max_error_mode: false,
            max_error: [0.0; 3],
        }
    }
}
