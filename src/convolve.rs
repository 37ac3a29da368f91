//! Separable convolution and the 3x3 stencil used by the estimator.
//!
//! Boundary policy is clamp-to-edge. The separable Gaussian pass
//! renormalizes the kernel mass near borders; the 3x3 stencil applies all
//! nine taps against clamped coordinates, which keeps DC-preserving
//! weights DC-preserving at the edges too.

use crate::consts::div_ceil;
use crate::image::ImageF;
use rayon::prelude::*;

/// 3x3 stencil weights: center, edge-adjacent, corner.
#[derive(Debug, Clone, Copy)]
pub struct WeightsSymmetric3 {
    pub center: f32,
    pub edge: f32,
    pub corner: f32,
}

/// Builds a normalized 1D Gaussian kernel of `2 * radius + 1` taps.
#[must_use]
pub fn gaussian_kernel(radius: usize, sigma: f32) -> Vec<f32> {
    let scaler = -1.0 / (2.0 * sigma * sigma);
    let mut kernel = vec![0.0f32; 2 * radius + 1];
    let mut sum = 0.0f32;
    for i in 0..kernel.len() {
        let d = i as f32 - radius as f32;
        let w = (scaler * d * d).exp();
        kernel[i] = w;
        sum += w;
    }
    let inv_sum = 1.0 / sum;
    for k in &mut kernel {
        *k *= inv_sum;
    }
    kernel
}

fn convolve_at(samples: impl Fn(usize) -> f32, len: usize, center: usize, kernel: &[f32]) -> f32 {
    let half = kernel.len() / 2;
    let lo = center.saturating_sub(half);
    let hi = (center + half).min(len - 1);
    let mut sum = 0.0f32;
    let mut weight = 0.0f32;
    for j in lo..=hi {
        let k = kernel[j + half - center];
        weight += k;
        sum += samples(j) * k;
    }
    if weight > 0.0 {
        sum / weight
    } else {
        0.0
    }
}

/// Convolves with a 1D kernel along X then Y, evaluating only every
/// `stride`-th sample on both axes.
///
/// The output is `ceil(w / stride) x ceil(h / stride)`.
#[must_use]
pub fn convolve_and_sample(image: &ImageF, kernel: &[f32], stride: usize) -> ImageF {
    let width = image.width();
    let height = image.height();
    let out_w = div_ceil(width, stride);
    let out_h = div_ceil(height, stride);

    // Horizontal pass at sampled x positions, full vertical resolution.
    let mut tmp = ImageF::new(out_w, height);
    let tmp_stride = tmp.stride();
    tmp.data_mut()
        .par_chunks_mut(tmp_stride)
        .enumerate()
        .take(height)
        .for_each(|(y, out_row)| {
            let row = image.row(y);
            for xs in 0..out_w {
                out_row[xs] = convolve_at(|j| row[j], width, xs * stride, kernel);
            }
        });

    // Vertical pass at sampled y positions.
    let mut out = ImageF::new(out_w, out_h);
    let out_stride = out.stride();
    out.data_mut()
        .par_chunks_mut(out_stride)
        .enumerate()
        .take(out_h)
        .for_each(|(ys, out_row)| {
            for (xs, cell) in out_row.iter_mut().enumerate().take(out_w) {
                *cell = convolve_at(|j| tmp.get(xs, j), height, ys * stride, kernel);
            }
        });
    out
}

/// Applies a 3x3 center/edge/corner stencil with clamp-to-edge boundaries.
#[must_use]
pub fn symmetric3(image: &ImageF, weights: WeightsSymmetric3) -> ImageF {
    let width = image.width();
    let height = image.height();
    let mut out = ImageF::new(width, height);
    let out_stride = out.stride();
    out.data_mut()
        .par_chunks_mut(out_stride)
        .enumerate()
        .take(height)
        .for_each(|(y, out_row)| {
            let yt = y.saturating_sub(1);
            let yb = (y + 1).min(height - 1);
            let row = image.row(y);
            let row_t = image.row(yt);
            let row_b = image.row(yb);
            for x in 0..width {
                let xl = x.saturating_sub(1);
                let xr = (x + 1).min(width - 1);
                let center = row[x];
                let edges = row[xl] + row[xr] + row_t[x] + row_b[x];
                let corners = row_t[xl] + row_t[xr] + row_b[xl] + row_b[xr];
                out_row[x] =
                    weights.center * center + weights.edge * edges + weights.corner * corners;
            }
        });
    out
}
