//! # zenjxl - Adaptive Quantization Field Estimation
//!
//! zenjxl implements the adaptive quantization stage of a JPEG XL-style
//! perceptual encoder: it turns an opsin-space image into a per-8x8-block
//! quantization field that concentrates bits where the eye is most
//! sensitive (smooth regions, gamma-stretched shadows) and spares them
//! where masking permits (high activity, high frequency, large local
//! range).
//!
//! ## Key Features
//!
//! - **Psychovisual field estimation**: five feature channels (masking,
//!   DCT-space activity, dynamic range, high-frequency content, gamma
//!   matching) composed in log domain per block
//! - **Metric-guided refinement**: iteratively roundtrips the frame and
//!   tightens the field against a perceptual comparator
//! - **High-quality peak descent**: local search around distortion peaks
//!   for the slowest effort tier
//! - **Max-error mode**: bounds per-channel reconstruction error instead
//!   of a perceptual score
//!
//! ## Usage
//!
//! ```rust,ignore
//! use zenjxl::{
//!     find_best_quantizer, initial_quant_field, CompressParams, EncoderState,
//!     FrameDimensions,
//! };
//!
//! let frame_dim = FrameDimensions::new(width, height);
//! let mut state = EncoderState::new(CompressParams::default(), frame_dim);
//! state.initial_quant_field =
//!     initial_quant_field(target, &opsin, &frame_dim, 1.0);
//! find_best_quantizer(
//!     Some(&linear), &opsin, &mut state, &mut codec, &mut comparator,
//!     None, 1.0,
//! )?;
//! ```
//!
//! The roundtrip codec and the perceptual comparator are injected through
//! the [`FrameCodec`] and [`Comparator`] traits; this crate owns only the
//! estimation and search logic.

// Core modules
pub mod consts;
mod error;
pub mod image;
mod types;

// Support math
pub mod convolve;
pub mod dct;
pub mod fast_math;

// Quantization state
pub mod ac_strategy;
pub mod quantizer;

// Estimation and search
pub mod adaptive_quant;
pub mod pipeline;
pub mod search;

// Public API
pub use adaptive_quant::{
    adaptive_quantization_map, adjust_quant_field, diff_precompute, initial_quant_dc,
    initial_quant_field, intensity_ac_estimate,
};
pub use ac_strategy::{AcStrategy, AcStrategyImage, TransformType};
pub use error::Error;
pub use image::{Image3F, ImageF, ImageI};
pub use pipeline::{
    AuxOut, ColorEncoding, Comparator, DebugSink, EncoderState, FrameCodec, ImageBundle,
};
pub use quantizer::Quantizer;
pub use search::{
    dist_to_peak_map, find_best_quantization, find_best_quantization_hq,
    find_best_quantization_max_error, find_best_quantizer, tile_dist_map,
};
pub use types::{CompressParams, FrameDimensions, SpeedTier};

/// Result type for zenjxl operations
pub type Result<T> = std::result::Result<T, Error>;
