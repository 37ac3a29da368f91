//! Forward 8x8 DCT in the transposed scaled convention.
//!
//! The quantization estimator probes DCT-space activity of 8x8 tiles.
//! The transform used here matches the encoder's convention: output is
//! transposed (index `u * 8 + v` holds horizontal frequency `u`, vertical
//! frequency `v`) and scaled so that the DC term equals the block mean.
//! Multiplying coefficient `(u, v)` by `DCT_SCALES_8[u] * DCT_SCALES_8[v]`
//! yields the orthonormal DCT coefficient divided by 64.

use crate::consts::{BLOCK_DIM, DCT_BLOCK_SIZE};
use std::sync::OnceLock;

/// Per-axis scale factors relating the scaled DCT to the orthonormal one.
///
/// Entry 0 is `1 / (2 * sqrt(2))`; entry k is `cos(k * pi / 16) / 2`.
pub const DCT_SCALES_8: [f32; 8] = [
    0.353_553_390_593_273_76,
    0.490_392_640_201_615_22,
    0.461_939_766_255_643_38,
    0.415_734_806_151_272_62,
    0.353_553_390_593_273_76,
    0.277_785_116_509_801_11,
    0.191_341_716_182_544_89,
    0.097_545_161_008_064_134,
];

/// Basis table, `basis[u][x] = cos((2x + 1) * u * pi / 16) * t(u)` with the
/// per-axis output scale folded in.
fn dct8_basis() -> &'static [[f32; 8]; 8] {
    static BASIS: OnceLock<[[f32; 8]; 8]> = OnceLock::new();
    BASIS.get_or_init(|| {
        let mut basis = [[0.0f32; 8]; 8];
        for (u, row) in basis.iter_mut().enumerate() {
            let t = if u == 0 {
                0.125f64
            } else {
                1.0 / (8.0 * (u as f64 * std::f64::consts::PI / 16.0).cos())
            };
            for (x, cell) in row.iter_mut().enumerate() {
                let angle = (2 * x + 1) as f64 * u as f64 * std::f64::consts::PI / 16.0;
                *cell = (angle.cos() * t) as f32;
            }
        }
        basis
    })
}

/// In-place 8x8 forward DCT, transposed scaled convention.
pub fn transposed_scaled_dct8(block: &mut [f32; DCT_BLOCK_SIZE]) {
    let basis = dct8_basis();
    let mut tmp = [0.0f32; DCT_BLOCK_SIZE];

    // Row pass: tmp[y][u] = sum_x block[y][x] * basis[u][x]
    for y in 0..BLOCK_DIM {
        let row = &block[y * BLOCK_DIM..y * BLOCK_DIM + BLOCK_DIM];
        for (u, bu) in basis.iter().enumerate() {
            let mut sum = 0.0f32;
            for x in 0..BLOCK_DIM {
                sum += row[x] * bu[x];
            }
            tmp[y * BLOCK_DIM + u] = sum;
        }
    }

    // Column pass, writing the transposed layout.
    for u in 0..BLOCK_DIM {
        for (v, bv) in basis.iter().enumerate() {
            let mut sum = 0.0f32;
            for y in 0..BLOCK_DIM {
                sum += tmp[y * BLOCK_DIM + u] * bv[y];
            }
            block[u * BLOCK_DIM + v] = sum;
        }
    }
}
