//! Adaptive quantization field estimation.
//!
//! Builds the per-block multiplicative quantization field from the opsin
//! image: a gamma-matched local-difference seed, blurred and downsampled
//! to block resolution, then modulated per block by masking, DCT-space
//! activity, dynamic range, high-frequency content and a gamma correction
//! term. All modulations accumulate in log domain; the field is
//! exponentiated and scaled exactly once at the end.
//!
//! Every floating constant in this module is load-bearing; changing one
//! is a behavior change.

use crate::ac_strategy::AcStrategyImage;
use crate::consts::{BLOCK_DIM, DCT_BLOCK_SIZE, OPSIN_ABSORBANCE_BIAS};
use crate::convolve::{convolve_and_sample, gaussian_kernel, symmetric3, WeightsSymmetric3};
use crate::dct::{transposed_scaled_dct8, DCT_SCALES_8};
use crate::fast_math::fast_log2f_18bits;
use crate::image::{Image3F, ImageF};
use crate::types::FrameDimensions;
use rayon::prelude::*;
use std::sync::OnceLock;
use wide::f32x8;

pub(crate) const DC_QUANT_POW: f32 = 0.55;
pub(crate) const DC_QUANT: f32 = 1.18;
pub(crate) const AC_QUANT: f32 = 0.84;

const DIFF_CUTOFF: f32 = 0.118_832_879_488_471_32;
const DIFF_MUL0: f32 = 0.030_220_460_298_316_064;

// The opsin gamma is 3.0 to allow fast decoding with two muls. The
// comparator's gamma matches the human eye, around 2.6. Adding one cubic
// root here approximates the difference, for a total gamma of 2.6666 in
// quantization use.
const MATCH_GAMMA_OFFSET: f32 = 0.654_263_934_639_188_7;

// mul and mul2 represent a scaling difference between the coder and the
// comparator.
const SG_MUL: f32 = 200.0;
const SG_MUL2: f32 = 1.0 / 74.0;
const LOG2: f32 = 0.693_147_181;
const SG_RET_MUL: f32 = SG_MUL2 * 18.658_093_213_5 * LOG2;
const SG_VOFFSET: f32 = 7.146_724_700_03;

/// Derivative ratio between the cube-root opsin response and the
/// comparator's gamma, used to move quantization decisions from opsin
/// space into the metric's log-gamma space.
#[inline]
fn ratio_of_derivatives(v: f32, invert: bool) -> f32 {
    // Negative photons don't exist; clamp to avoid a NaN.
    let v = v.max(0.0);
    const NUM_MUL: f32 = SG_RET_MUL * 3.0 * SG_MUL;
    const VOFFSET: f32 = SG_VOFFSET * LOG2;
    const DEN_MUL: f32 = LOG2 * SG_MUL;
    let v2 = v * v;
    let num = NUM_MUL * v2;
    let den = DEN_MUL * v * v2 + VOFFSET;
    if invert {
        num / den
    } else {
        den / num
    }
}

const fn weights_gaussian_dc() -> WeightsSymmetric3 {
    WeightsSymmetric3 {
        center: 0.320_356,
        edge: 0.122_822,
        corner: 0.047_089,
    }
}

/// High-pass estimate of one opsin plane: the plane minus its
/// DC-preserving 3x3 blur.
#[must_use]
pub fn intensity_ac_estimate(opsin_plane: &ImageF, frame_dim: &FrameDimensions) -> ImageF {
    let xsize = frame_dim.xsize_padded;
    let ysize = frame_dim.ysize_padded;
    assert!(opsin_plane.width() == xsize && opsin_plane.height() == ysize);

    let mut smoothed = symmetric3(opsin_plane, weights_gaussian_dc());
    let stride = smoothed.stride();
    smoothed
        .data_mut()
        .par_chunks_mut(stride)
        .enumerate()
        .take(ysize)
        .for_each(|(y, row_smooth)| {
            let row_opsin = opsin_plane.row(y);
            for x in 0..xsize {
                row_smooth[x] = row_opsin[x] - row_smooth[x];
            }
        });
    smoothed
}

fn diff_row(
    xyb: &Image3F,
    xsize: usize,
    ysize: usize,
    y: usize,
    cutoff: f32,
    row_out: &mut [f32],
) {
    let y2 = if y + 1 < ysize {
        y + 1
    } else if y > 0 {
        y - 1
    } else {
        y
    };
    let y1 = if y == 0 && ysize >= 2 {
        1
    } else if y > 0 {
        y - 1
    } else {
        y
    };
    let row_in = xyb.plane_row(1, y);
    let row_in1 = xyb.plane_row(1, y1);
    let row_in2 = xyb.plane_row(1, y2);

    // First pixel: mirror the missing left neighbor.
    {
        let x2 = if xsize > 1 { 1 } else { 0 };
        let x1 = x2;
        let mut diff = DIFF_MUL0
            * ((row_in[0] - row_in[x2]).abs()
                + (row_in[0] - row_in2[0]).abs()
                + (row_in[0] - row_in[x1]).abs()
                + (row_in[0] - row_in1[0]).abs()
                + 3.0 * ((row_in2[0] - row_in1[0]).abs() + (row_in[x1] - row_in[x2]).abs()));
        diff *= ratio_of_derivatives(row_in[0] + MATCH_GAMMA_OFFSET, false);
        row_out[0] = cutoff.min(diff);
    }
    for x in 1..xsize.saturating_sub(1) {
        let mut diff = DIFF_MUL0
            * ((row_in[x] - row_in[x + 1]).abs()
                + (row_in[x] - row_in2[x]).abs()
                + (row_in[x] - row_in[x - 1]).abs()
                + (row_in[x] - row_in1[x]).abs()
                + 3.0 * ((row_in2[x] - row_in1[x]).abs() + (row_in[x - 1] - row_in[x + 1]).abs()));
        diff *= ratio_of_derivatives(row_in[x] + MATCH_GAMMA_OFFSET, false);
        row_out[x] = cutoff.min(diff);
    }
    // Last pixel of the row: only the vertical term remains, reweighted.
    if xsize >= 2 {
        let x = xsize - 1;
        let mut diff = 7.0 * DIFF_MUL0 * (row_in[x] - row_in2[x]).abs();
        diff *= ratio_of_derivatives(row_in[x] + MATCH_GAMMA_OFFSET, false);
        row_out[x] = cutoff.min(diff);
    }

    pad_row_right(row_out, xsize);
}

/// Extends a row to the padded width with the mean of its last valid
/// cells.
fn pad_row_right(row_out: &mut [f32], xsize: usize) {
    let mut lastval = row_out[xsize - 1];
    if xsize >= 3 {
        lastval += row_out[xsize - 2];
        lastval += row_out[xsize - 3];
        lastval *= 1.0 / 3.0;
    } else if xsize >= 2 {
        lastval += row_out[xsize - 2];
        lastval *= 0.5;
    }
    for v in row_out.iter_mut().skip(xsize) {
        *v = lastval;
    }
}

/// Per-pixel local difference map of the Y plane, gamma-matched, clamped
/// to `cutoff` and padded to multiples of the block dimension.
#[must_use]
pub fn diff_precompute(xyb: &Image3F, frame_dim: &FrameDimensions, cutoff: f32) -> ImageF {
    let xsize = frame_dim.xsize;
    let ysize = frame_dim.ysize;
    assert!(xsize > 0 && ysize > 0);
    let mut padded_diff = ImageF::new(frame_dim.xsize_padded, frame_dim.ysize_padded);
    let padded_xsize = padded_diff.width();
    let stride = padded_diff.stride();

    padded_diff
        .data_mut()
        .par_chunks_mut(stride)
        .enumerate()
        .take(ysize)
        .for_each(|(y, chunk)| {
            diff_row(xyb, xsize, ysize, y, cutoff, &mut chunk[..padded_xsize]);
        });

    // The last row keeps only horizontal differences.
    {
        let y = ysize - 1;
        let row_in = xyb.plane_row(1, y);
        let row_out = padded_diff.row_mut(y);
        for x in 0..xsize.saturating_sub(1) {
            let mut diff = 7.0 * DIFF_MUL0 * (row_in[x] - row_in[x + 1]).abs();
            diff *= ratio_of_derivatives(row_in[x] + MATCH_GAMMA_OFFSET, false);
            row_out[x] = cutoff.min(diff);
        }
        if xsize > 1 {
            row_out[xsize - 1] = row_out[xsize - 2];
        }
        pad_row_right(row_out, xsize);
    }

    // Extend to a multiple of the block dimension in y.
    if ysize != padded_diff.height() {
        for x in 0..padded_xsize {
            let mut lastval = padded_diff.get(x, ysize - 1);
            if ysize >= 3 {
                lastval += padded_diff.get(x, ysize - 2);
                lastval += padded_diff.get(x, ysize - 3);
                lastval *= 1.0 / 3.0;
            } else if ysize >= 2 {
                lastval += padded_diff.get(x, ysize - 2);
                lastval *= 0.5;
            }
            for y in ysize..padded_diff.height() {
                padded_diff.set(x, y, lastval);
            }
        }
    }

    padded_diff
}

// Masking response of the blurred difference seed.
const MASK_BASE: f32 = 0.9;
const MASK_MUL1: f32 = 0.012_830_564_950_968_305;
const MASK_OFFSET1: f32 = 0.010_638_874_536_303_307;
const MASK_MUL2: f32 = -0.177_661_975_675_651_59;
const MASK_OFFSET2: f32 = 0.106_476_028_328_482_34;

#[inline]
fn compute_mask(val: f32) -> f32 {
    // Avoid division by zero.
    let div = (val + MASK_OFFSET1).max(1e-3);
    MASK_BASE + MASK_MUL1 / div + MASK_MUL2 / (val * val + MASK_OFFSET2)
}

const QUANT64_POW: f64 = 4.662_903_750_827_961_6;

/// Per-coefficient weights for the DCT-space entropy proxy, already
/// raised to their tuning power.
fn quant64() -> &'static [f32; DCT_BLOCK_SIZE] {
    static QUANT: OnceLock<[f32; DCT_BLOCK_SIZE]> = OnceLock::new();
    QUANT.get_or_init(|| {
        const QUANT64_BASE: [f64; DCT_BLOCK_SIZE] = [
            0.00, 4.10, 3.30, 3.30, 1.10, 1.15, 0.70, 0.70, //
            4.10, 3.30, 3.30, 1.10, 1.15, 1.30, 0.70, 0.50, //
            3.00, 3.30, 2.90, 2.10, 1.30, 0.70, 0.50, 0.50, //
            0.87, 2.90, 2.10, 1.40, 0.70, 0.50, 0.50, 0.50, //
            0.87, 1.40, 1.40, 1.60, 0.50, 0.50, 0.50, 0.50, //
            1.40, 0.90, 1.60, 0.50, 0.50, 0.50, 0.50, 0.50, //
            0.90, 0.50, 0.50, 0.50, 0.50, 0.50, 0.50, 0.50, //
            0.50, 0.50, 0.50, 0.50, 0.50, 0.50, 0.50, 0.50,
        ];
        let mut quant = [0.0f32; DCT_BLOCK_SIZE];
        for (out, &base) in quant.iter_mut().zip(QUANT64_BASE.iter()) {
            *out = base.powf(QUANT64_POW) as f32;
        }
        quant
    })
}

const DCT_MUL_QL2: f32 = 0.031_421_498_869_129_76;
const DCT_MUL_QL4: f32 = -0.667_518_786_839_540_47;
const DCT_MUL_QL8: f32 = 0.385_378_899_652_108_25;
const DCT_MUL: f32 = 1.242_976_471_911_911_4;

/// Raises precision in blocks that are complicated in DCT space.
fn dct_modulation(
    x: usize,
    y: usize,
    xyb: &ImageF,
    dct_rescale: &[f32; DCT_BLOCK_SIZE],
) -> f32 {
    let mut dct = [0.0f32; DCT_BLOCK_SIZE];
    for dy in 0..BLOCK_DIM {
        let row = xyb.row(y + dy);
        dct[dy * BLOCK_DIM..(dy + 1) * BLOCK_DIM].copy_from_slice(&row[x..x + BLOCK_DIM]);
    }
    transposed_scaled_dct8(&mut dct);

    let quant = quant64();
    let mut entropy_ql2 = f32x8::splat(0.0);
    let mut entropy_ql4 = f32x8::splat(0.0);
    let mut entropy_ql8 = f32x8::splat(0.0);
    for i in (0..DCT_BLOCK_SIZE).step_by(8) {
        let coeffs: [f32; 8] = dct[i..i + 8].try_into().unwrap();
        let rescale: [f32; 8] = dct_rescale[i..i + 8].try_into().unwrap();
        let weights: [f32; 8] = quant[i..i + 8].try_into().unwrap();
        let mut v = f32x8::from(coeffs) * f32x8::from(rescale);
        v *= v;
        let q = f32x8::from(weights);
        entropy_ql2 += q * v;
        v *= v;
        entropy_ql4 += q * v;
        v *= v;
        entropy_ql8 += q * v;
    }
    // Fixed-order lane reduction keeps the result thread-count
    // independent.
    let sum_lanes = |v: f32x8| -> f32 {
        let lanes: [f32; 8] = v.into();
        lanes.iter().sum()
    };
    let entropy_ql2 = sum_lanes(entropy_ql2).sqrt();
    let entropy_ql4 = sum_lanes(entropy_ql4).sqrt().sqrt();
    let entropy_ql8 = sum_lanes(entropy_ql8).powf(0.125);
    DCT_MUL * (DCT_MUL_QL2 * entropy_ql2 + DCT_MUL_QL4 * entropy_ql4 + DCT_MUL_QL8 * entropy_ql8)
}

const RANGE_X_MUL: f32 = 1.722_170_574_780_931_7;
const RANGE_MUL0: f32 = -0.740_906_289_900_838_73;
const RANGE_MUL1: f32 = 0.376_864_218_531_510_2;
const RANGE_MUL2: f32 = -0.364_020_380_140_858_36;
const RANGE_MUL3: f32 = 0.143_968_207_170_871_75;
const RANGE_MUL4: f32 = 119.382_457_729_727_09;

/// Raises precision in blocks with high dynamic range.
fn range_modulation(x: usize, y: usize, xyb_x: &ImageF, xyb_y: &ImageF) -> f32 {
    let mut minval_x = f32::INFINITY;
    let mut minval_y = f32::INFINITY;
    let mut maxval_x = f32::NEG_INFINITY;
    let mut maxval_y = f32::NEG_INFINITY;
    let mut y_sum_of_squares = 0.0f32;
    for dy in 0..BLOCK_DIM {
        let row_x = xyb_x.row(y + dy);
        let row_y = xyb_y.row(y + dy);
        for dx in 0..BLOCK_DIM {
            let vx = row_x[x + dx];
            let vy = row_y[x + dx];
            minval_x = minval_x.min(vx);
            maxval_x = maxval_x.max(vx);
            minval_y = minval_y.min(vy);
            maxval_y = maxval_y.max(vy);
            y_sum_of_squares += vy * vy;
        }
    }
    let range_x = RANGE_X_MUL * (maxval_x - minval_x);
    let range_y = maxval_y - minval_y;
    let range0 = (range_x * range_y).sqrt();
    let range1 = (range_x * range_x + range_y * range_y).sqrt();
    let range2 = range_x.max(range_y);
    let range3 = range_x.min(range_y);
    let range4 = range_x * (y_sum_of_squares / DCT_BLOCK_SIZE as f32).sqrt();
    let total = RANGE_MUL0 * range0
        + RANGE_MUL1 * range1
        + RANGE_MUL2 * range2
        + RANGE_MUL3 * range3
        + RANGE_MUL4 * range4;
    // Values far from 0 occur in pathological cases and cause problems
    // downstream.
    total.clamp(-7.0, 7.0)
}

const HF_MUL: f32 = -1.927_220_582_901_299_4;

/// Lowers precision in blocks with high-frequency content.
fn hf_modulation(x: usize, y: usize, xyb: &ImageF) -> f32 {
    let mut sum = 0.0f32;
    let mut n = 0u32;
    for dy in 0..BLOCK_DIM {
        let row = xyb.row(y + dy);
        for dx in 0..BLOCK_DIM - 1 {
            sum += (row[x + dx] - row[x + dx + 1]).abs();
            n += 1;
        }
    }
    for dy in 0..BLOCK_DIM - 1 {
        let row = xyb.row(y + dy);
        let row_next = xyb.row(y + dy + 1);
        for dx in 0..BLOCK_DIM {
            sum += (row[x + dx] - row_next[x + dx]).abs();
            n += 1;
        }
    }
    if n != 0 {
        sum /= n as f32;
    }
    HF_MUL * sum
}

const GAMMA_MOD_BIAS: f32 = 0.16;
const GAMMA_MOD_MUL: f32 = 0.344_031_646_760_832_79;

/// Gamma correction term: average derivative ratio of the red/green
/// chromatic responses over the block, taken in log domain.
fn gamma_modulation(x: usize, y: usize, xyb_x: &ImageF, xyb_y: &ImageF) -> f32 {
    debug_assert!(OPSIN_ABSORBANCE_BIAS.iter().all(|&b| GAMMA_MOD_BIAS > b));
    let mut overall_ratio = 0.0f32;
    for dy in 0..BLOCK_DIM {
        let row_x = xyb_x.row(y + dy);
        let row_y = xyb_y.row(y + dy);
        for dx in 0..BLOCK_DIM {
            let iny = row_y[x + dx] + GAMMA_MOD_BIAS;
            let inx = row_x[x + dx];
            let r = iny - inx;
            let g = iny + inx;
            let ratio_r = ratio_of_derivatives(r, true);
            let ratio_g = ratio_of_derivatives(g, true);
            overall_ratio += 0.5 * (ratio_r + ratio_g);
        }
    }
    GAMMA_MOD_MUL * LOG2 * fast_log2f_18bits(overall_ratio / DCT_BLOCK_SIZE as f32)
}

/// Applies the five per-block modulations and the final exponentiation.
pub fn per_block_modulations(xyb_x: &ImageF, xyb_y: &ImageF, scale: f32, out: &mut ImageF) {
    assert_eq!(crate::consts::div_ceil(xyb_x.width(), BLOCK_DIM), out.width());
    assert_eq!(crate::consts::div_ceil(xyb_x.height(), BLOCK_DIM), out.height());
    assert!(xyb_x.same_size(xyb_y));

    let mut dct_rescale = [0.0f32; DCT_BLOCK_SIZE];
    for (i, v) in dct_rescale.iter_mut().enumerate() {
        *v = DCT_SCALES_8[i / BLOCK_DIM] * DCT_SCALES_8[i % BLOCK_DIM];
    }

    let xsize = xyb_x.width();
    let out_h = out.height();
    let out_stride = out.stride();
    out.data_mut()
        .par_chunks_mut(out_stride)
        .enumerate()
        .take(out_h)
        .for_each(|(iy, row_out)| {
            let y = iy * BLOCK_DIM;
            for x in (0..xsize).step_by(BLOCK_DIM) {
                let bx = x / BLOCK_DIM;
                let mut val = compute_mask(row_out[bx]);
                val += dct_modulation(x, y, xyb_y, &dct_rescale);
                val += range_modulation(x, y, xyb_x, xyb_y);
                val += hf_modulation(x, y, xyb_y);
                val += gamma_modulation(x, y, xyb_x, xyb_y);
                // Everything up to here modulated the exponent of the
                // multiplicative field.
                row_out[bx] = val.exp() * scale;
            }
        });
}

const GAUSS_SIGMA: f32 = 8.255_385_672_556_615_3;

/// Builds the adaptive quantization map for one frame.
#[must_use]
pub fn adaptive_quantization_map(
    opsin: &Image3F,
    intensity_ac_x: &ImageF,
    intensity_ac_y: &ImageF,
    frame_dim: &FrameDimensions,
    scale: f32,
) -> ImageF {
    let radius = (2.0 * GAUSS_SIGMA + 0.5) as usize;
    let kernel = gaussian_kernel(radius, GAUSS_SIGMA);

    let out = diff_precompute(opsin, frame_dim, DIFF_CUTOFF);
    assert!(out.width() % BLOCK_DIM == 0 && out.height() % BLOCK_DIM == 0);
    let mut out = convolve_and_sample(&out, &kernel, BLOCK_DIM);
    per_block_modulations(intensity_ac_x, intensity_ac_y, scale, &mut out);
    out
}

/// Scalar DC quantization for a perceptual target.
///
/// Non-increasing in the target and capped at 50 so the largest DC value
/// stays representable.
#[must_use]
pub fn initial_quant_dc(butteraugli_target: f32) -> f32 {
    // Butteraugli target where the non-linearity kicks in.
    const DC_MUL: f32 = 2.9;
    let butteraugli_target_dc = butteraugli_target
        .min(DC_MUL * (butteraugli_target / DC_MUL).powf(DC_QUANT_POW));
    (DC_QUANT / butteraugli_target_dc).min(50.0)
}

/// Initial AC quantization field before any search refinement.
#[must_use]
pub fn initial_quant_field(
    butteraugli_target: f32,
    opsin: &Image3F,
    frame_dim: &FrameDimensions,
    rescale: f32,
) -> ImageF {
    let quant_ac = AC_QUANT / butteraugli_target;
    let intensity_ac_x = intensity_ac_estimate(opsin.plane(0), frame_dim);
    let intensity_ac_y = intensity_ac_estimate(opsin.plane(1), frame_dim);
    adaptive_quantization_map(
        opsin,
        &intensity_ac_x,
        &intensity_ac_y,
        frame_dim,
        quant_ac * rescale,
    )
}

/// Broadcasts the maximum of each multi-block transform region over all
/// block positions it covers. Idempotent.
pub fn adjust_quant_field(ac_strategy: &AcStrategyImage, quant_field: &mut ImageF) {
    for y in 0..quant_field.height() {
        for x in 0..quant_field.width() {
            let acs = ac_strategy.const_row(y)[x];
            if !acs.is_first_block() {
                continue;
            }
            let cx = acs.covered_blocks_x();
            let cy = acs.covered_blocks_y();
            assert!(x + cx <= quant_field.width());
            assert!(y + cy <= quant_field.height());
            let mut max = quant_field.get(x, y);
            for iy in 0..cy {
                for ix in 0..cx {
                    max = max.max(quant_field.get(x + ix, y + iy));
                }
            }
            for iy in 0..cy {
                for ix in 0..cx {
                    quant_field.set(x + ix, y + iy, max);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ac_strategy::TransformType;

    fn opsin_from_y(y_plane: ImageF) -> Image3F {
        let w = y_plane.width();
        let h = y_plane.height();
        Image3F::from_planes(ImageF::new(w, h), y_plane, ImageF::new(w, h))
    }

    #[test]
    fn test_ratio_of_derivatives_finite_positive() {
        for &v in &[0.0f32, 1e-4, 0.16, 0.5, 1.0, 10.0, -3.0] {
            let inv = ratio_of_derivatives(v, true);
            assert!(inv.is_finite() && inv >= 0.0, "invert at {}: {}", v, inv);
        }
        for &v in &[1e-3f32, 0.16, 0.65, 1.0, 10.0] {
            let fwd = ratio_of_derivatives(v, false);
            assert!(fwd.is_finite() && fwd > 0.0, "forward at {}: {}", v, fwd);
        }
    }

    #[test]
    fn test_ratio_inversion() {
        for &v in &[0.1f32, 0.65, 1.3, 4.0] {
            let fwd = ratio_of_derivatives(v, false);
            let inv = ratio_of_derivatives(v, true);
            assert!((fwd * inv - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_compute_mask_guard() {
        // The divisor guard keeps the response finite near the offset
        // singularity.
        let near_singular = compute_mask(-MASK_OFFSET1);
        assert!(near_singular.is_finite());
        assert!(compute_mask(0.0).is_finite());
        assert!(compute_mask(DIFF_CUTOFF).is_finite());
    }

    #[test]
    fn test_intensity_ac_estimate_zero_for_flat() {
        let frame_dim = FrameDimensions::new(16, 16);
        let plane = ImageF::filled(16, 16, 0.42);
        let ac = intensity_ac_estimate(&plane, &frame_dim);
        for y in 0..16 {
            for x in 0..16 {
                assert!(ac.get(x, y).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_diff_precompute_bounded_by_cutoff() {
        let frame_dim = FrameDimensions::new(13, 11);
        let mut y_plane = ImageF::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                y_plane.set(x, y, if (x + y) % 2 == 0 { 0.0 } else { 1.0 });
            }
        }
        let diff = diff_precompute(&opsin_from_y(y_plane), &frame_dim, DIFF_CUTOFF);
        assert_eq!(diff.width(), 16);
        assert_eq!(diff.height(), 16);
        for y in 0..16 {
            for x in 0..16 {
                let v = diff.get(x, y);
                assert!(v >= 0.0 && v <= DIFF_CUTOFF, "at ({},{}): {}", x, y, v);
            }
        }
    }

    #[test]
    fn test_diff_precompute_padding_means() {
        let frame_dim = FrameDimensions::new(13, 8);
        let mut y_plane = ImageF::new(16, 8);
        for y in 0..8 {
            for x in 0..16 {
                y_plane.set(x, y, (x as f32 * 0.13 + y as f32 * 0.07).sin().abs());
            }
        }
        let diff = diff_precompute(&opsin_from_y(y_plane), &frame_dim, DIFF_CUTOFF);
        for y in 0..7 {
            let expected =
                (diff.get(12, y) + diff.get(11, y) + diff.get(10, y)) / 3.0;
            for x in 13..16 {
                assert!((diff.get(x, y) - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_hf_modulation_zero_for_flat() {
        let plane = ImageF::filled(8, 8, 0.3);
        assert_eq!(hf_modulation(0, 0, &plane), 0.0);
    }

    #[test]
    fn test_range_modulation_clamped() {
        let mut xp = ImageF::new(8, 8);
        let mut yp = ImageF::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                xp.set(x, y, if x % 2 == 0 { -100.0 } else { 100.0 });
                yp.set(x, y, if y % 2 == 0 { -100.0 } else { 100.0 });
            }
        }
        let m = range_modulation(0, 0, &xp, &yp);
        assert!((-7.0..=7.0).contains(&m));
        let zero = range_modulation(0, 0, &ImageF::new(8, 8), &ImageF::new(8, 8));
        assert_eq!(zero, 0.0);
    }

    #[test]
    fn test_hf_modulation_stronger_across_step() {
        // A step inside the block drives the high-frequency response; a
        // flat block stays at zero.
        let mut plane = ImageF::new(16, 8);
        for y in 0..8 {
            for x in 0..4 {
                plane.set(x, y, 0.0);
            }
            for x in 4..16 {
                plane.set(x, y, 1.0);
            }
        }
        let edge_block = hf_modulation(0, 0, &plane);
        let flat_block = hf_modulation(8, 0, &plane);
        assert_eq!(flat_block, 0.0);
        assert!(
            edge_block < flat_block,
            "edge block response {} should drop below flat {}",
            edge_block,
            flat_block
        );
    }

    #[test]
    fn test_dct_modulation_checkerboard_vs_uniform() {
        let mut dct_rescale = [0.0f32; DCT_BLOCK_SIZE];
        for (i, v) in dct_rescale.iter_mut().enumerate() {
            *v = DCT_SCALES_8[i / BLOCK_DIM] * DCT_SCALES_8[i % BLOCK_DIM];
        }
        let mut checker = ImageF::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                checker.set(x, y, ((x + y) % 2) as f32);
            }
        }
        let uniform = ImageF::filled(8, 8, 0.5);
        let mod_checker = dct_modulation(0, 0, &checker, &dct_rescale);
        let mod_uniform = dct_modulation(0, 0, &uniform, &dct_rescale);
        // A uniform tile has no weighted coefficient energy at all.
        assert!(mod_uniform.abs() < 1e-4, "uniform modulation {}", mod_uniform);
        assert!(mod_checker.is_finite());
        // The weighted-norm mix responds to the checkerboard by pulling
        // the exponent down, not up: the quartic-norm term dominates for
        // every weight in the table.
        assert!(
            mod_checker < -1e-4,
            "checkerboard modulation {} should be clearly negative",
            mod_checker
        );
    }

    #[test]
    fn test_initial_quant_dc_values() {
        assert!((initial_quant_dc(1.0) - DC_QUANT).abs() < 1e-5);
        for &t in &[0.1f32, 0.5, 1.0, 2.0, 4.0, 16.0] {
            assert!(initial_quant_dc(t) <= 50.0);
        }
        // Non-increasing in the target.
        let mut prev = initial_quant_dc(0.05);
        for i in 1..200 {
            let t = 0.05 + i as f32 * 0.1;
            let dc = initial_quant_dc(t);
            assert!(dc <= prev + 1e-6, "dc({}) = {} > {}", t, dc, prev);
            prev = dc;
        }
    }

    #[test]
    fn test_adjust_quant_field_broadcast() {
        let mut strategy = AcStrategyImage::all_dct8(2, 2);
        strategy.set(0, 0, TransformType::Dct16x16);
        let mut field = ImageF::new(2, 2);
        field.set(0, 0, 1.0);
        field.set(1, 0, 2.0);
        field.set(0, 1, 3.0);
        field.set(1, 1, 4.0);
        adjust_quant_field(&strategy, &mut field);
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(field.get(x, y), 4.0);
            }
        }
        // Idempotent.
        let snapshot = field.clone();
        adjust_quant_field(&strategy, &mut field);
        for y in 0..2 {
            assert_eq!(field.row(y), snapshot.row(y));
        }
    }
}
