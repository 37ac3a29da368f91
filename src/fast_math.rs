//! Fast math approximations.
//!
//! The log2 approximation here is the 18-bit-mantissa variant used across
//! the perceptual pipeline: a (2,2) rational polynomial on a bit-level
//! range reduction. L1 error is about 3.9e-6, and the result is a finite
//! (possibly large negative) value for every finite input >= 0, never NaN.

/// Fast log2 with ~18 bits of mantissa accuracy.
///
/// Range-reduces the input to [2/3, 4/3) by exponent manipulation, then
/// evaluates a (2,2) rational polynomial on the reduced mantissa.
#[inline]
#[must_use]
pub fn fast_log2f_18bits(x: f32) -> f32 {
    const P0: f32 = -1.850_383_340_051_831e-6;
    const P1: f32 = 1.428_716_047_008_375_5;
    const P2: f32 = 0.742_458_733_278_205_66;

    const Q0: f32 = 0.990_328_142_775_907_19;
    const Q1: f32 = 1.009_671_857_224_114_8;
    const Q2: f32 = 0.174_093_430_033_668_53;

    let x_bits = x.to_bits() as i32;

    // Range reduction: subtract the bit pattern of 2/3 so the shifted
    // exponent becomes the integer part of log2.
    let exp_bits = x_bits.wrapping_sub(0x3f2a_aaab_u32 as i32);
    let exp_shifted = exp_bits >> 23;
    let mantissa = f32::from_bits(x_bits.wrapping_sub(exp_shifted << 23) as u32);
    let exp_val = exp_shifted as f32;

    let m = mantissa - 1.0;
    let yp = (P2 * m + P1) * m + P0;
    let yq = (Q2 * m + Q1) * m + Q0;
    yp / yq + exp_val
}
