//! Collaborator seams of the quantization search.
//!
//! The search loops drive three external capabilities: a roundtrip codec
//! that encodes and decodes one frame under the current quantizer, a
//! perceptual comparator, and an optional debug sink. They are traits so
//! the estimator stays independent of the concrete coder and metric.

use crate::ac_strategy::AcStrategyImage;
use crate::error::Result;
use crate::image::{Image3F, ImageF, ImageI};
use crate::quantizer::Quantizer;
use crate::types::{CompressParams, FrameDimensions};
use imgref::ImgRef;
use rgb::RGB;

/// Color interpretation of an image bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorEncoding {
    /// Linear-light sRGB primaries.
    LinearSrgb,
    /// Gamma-encoded sRGB.
    Srgb,
    /// Encoder-internal opsin planes.
    Opsin,
}

/// An image together with its color interpretation.
#[derive(Debug, Clone)]
pub struct ImageBundle {
    image: Image3F,
    color: ColorEncoding,
}

impl ImageBundle {
    #[must_use]
    pub fn new(image: Image3F, color: ColorEncoding) -> Self {
        Self { image, color }
    }

    /// Wraps an interleaved linear-light sRGB buffer.
    #[must_use]
    pub fn from_linear_rgb(pixels: ImgRef<'_, RGB<f32>>) -> Self {
        let width = pixels.width();
        let height = pixels.height();
        let mut image = Image3F::new(width, height);
        let (r_plane, g_plane, b_plane) = image.planes_mut();
        for (y, row) in pixels.rows().enumerate() {
            let row_r = r_plane.row_mut(y);
            let row_g = g_plane.row_mut(y);
            let row_b = b_plane.row_mut(y);
            for (x, px) in row.iter().enumerate() {
                row_r[x] = px.r;
                row_g[x] = px.g;
                row_b[x] = px.b;
            }
        }
        Self {
            image,
            color: ColorEncoding::LinearSrgb,
        }
    }

    #[inline]
    #[must_use]
    pub fn image(&self) -> &Image3F {
        &self.image
    }

    #[inline]
    #[must_use]
    pub fn color(&self) -> ColorEncoding {
        self.color
    }
}

/// Perceptual distance metric.
///
/// Implementations may report either "higher is better" or "higher is
/// worse"; callers normalize using `good_quality_score()` versus
/// `bad_quality_score()`.
pub trait Comparator {
    /// Installs the reference image all later comparisons are against.
    fn set_reference(&mut self, reference: &ImageBundle) -> Result<()>;

    /// Compares against the reference, returning a per-pixel distance map
    /// and a scalar score.
    fn compare_with(&mut self, decoded: &ImageBundle) -> Result<(ImageF, f32)>;

    /// Score of a known-good comparison.
    fn good_quality_score(&self) -> f32;

    /// Score of a known-bad comparison.
    fn bad_quality_score(&self) -> f32;
}

/// One-frame encode/decode roundtrip under the current quantizer state.
pub trait FrameCodec {
    /// Encodes `opsin` with the quantizer in `state` and decodes the
    /// result.
    ///
    /// With `apply_color_transform` the output is linear sRGB; without it
    /// the decoded opsin planes are returned directly.
    fn roundtrip(
        &mut self,
        opsin: &Image3F,
        state: &EncoderState,
        save_decompressed: bool,
        apply_color_transform: bool,
    ) -> Result<Image3F>;
}

/// Encoder-side state shared between the estimator and the quantizer.
#[derive(Debug, Clone)]
pub struct EncoderState {
    pub cparams: CompressParams,
    pub frame_dim: FrameDimensions,
    pub ac_strategy: AcStrategyImage,
    pub quantizer: Quantizer,
    pub raw_quant_field: ImageI,
    pub initial_quant_field: ImageF,
}

impl EncoderState {
    /// Initializes state for a frame; the quantization field starts
    /// uniform and is expected to be filled by the estimator.
    #[must_use]
    pub fn new(cparams: CompressParams, frame_dim: FrameDimensions) -> Self {
        let (bw, bh) = (frame_dim.xsize_blocks, frame_dim.ysize_blocks);
        Self {
            cparams,
            frame_dim,
            ac_strategy: AcStrategyImage::all_dct8(bw, bh),
            quantizer: Quantizer::new(),
            raw_quant_field: ImageI::new(bw, bh),
            initial_quant_field: ImageF::filled(bw, bh, 1.0),
        }
    }
}

/// Receiver for debug artifacts produced during the search.
pub trait DebugSink {
    /// Receives a single-plane debug image.
    fn dump_plane(&mut self, name: &str, image: &ImageF);

    /// Receives a three-plane debug image in opsin space.
    fn dump_xyb(&mut self, name: &str, image: &Image3F);
}

/// Optional side-channel output of the search loops.
#[derive(Default)]
pub struct AuxOut {
    /// Running count of metric evaluations across all searches.
    pub num_butteraugli_iters: u32,
    sink: Option<Box<dyn DebugSink>>,
}

impl AuxOut {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a debug sink; dumps are dropped without one.
    #[must_use]
    pub fn with_sink(sink: Box<dyn DebugSink>) -> Self {
        Self {
            num_butteraugli_iters: 0,
            sink: Some(sink),
        }
    }

    /// Whether debug dumps will be delivered anywhere.
    #[inline]
    #[must_use]
    pub fn want_debug(&self) -> bool {
        self.sink.is_some()
    }

    pub(crate) fn dump_plane(&mut self, name: &str, image: &ImageF) {
        if let Some(sink) = self.sink.as_mut() {
            sink.dump_plane(name, image);
        }
    }

    pub(crate) fn dump_xyb(&mut self, name: &str, image: &Image3F) {
        if let Some(sink) = self.sink.as_mut() {
            sink.dump_xyb(name, image);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgref::ImgVec;

    #[test]
    fn test_bundle_from_linear_rgb() {
        let pixels = vec![RGB::new(0.25f32, 0.5, 0.75); 6];
        let img = ImgVec::new(pixels, 3, 2);
        let bundle = ImageBundle::from_linear_rgb(img.as_ref());
        assert_eq!(bundle.color(), ColorEncoding::LinearSrgb);
        assert_eq!(bundle.image().width(), 3);
        assert_eq!(bundle.image().plane(1).get(2, 1), 0.5);
        assert_eq!(bundle.image().plane(2).get(0, 0), 0.75);
    }

    #[test]
    fn test_encoder_state_geometry() {
        let state = EncoderState::new(CompressParams::default(), FrameDimensions::new(40, 24));
        assert_eq!(state.raw_quant_field.width(), 5);
        assert_eq!(state.raw_quant_field.height(), 3);
        assert_eq!(state.initial_quant_field.width(), 5);
        assert_eq!(state.ac_strategy.xsize(), 5);
    }

    #[test]
    fn test_aux_out_without_sink() {
        let mut aux = AuxOut::new();
        assert!(!aux.want_debug());
        aux.dump_plane("ignored", &ImageF::new(2, 2));
        aux.num_butteraugli_iters += 1;
        assert_eq!(aux.num_butteraugli_iters, 1);
    }
}
