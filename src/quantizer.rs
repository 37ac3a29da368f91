//! Quantizer facade: maps the float quantization field to raw integer
//! steps.
//!
//! The estimator never touches the raw field directly; it hands a float
//! field to `set_quant_field` and reads back the step granularity through
//! `inv_global_scale` / `scale` to detect rounding collisions during the
//! search. One raw step is chosen so the field maximum maps to the top of
//! the raw range; the search's `qf_higher / qf_lower < 253` invariant then
//! keeps every clamped value above raw zero.

use crate::image::{ImageF, ImageI};

const RAW_QUANT_MAX: i32 = 255;

/// Global-scale quantizer state.
#[derive(Debug, Clone)]
pub struct Quantizer {
    global_scale: f32,
    inv_global_scale: f32,
    quant_dc: f32,
}

impl Default for Quantizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Quantizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            global_scale: 1.0,
            inv_global_scale: 1.0,
            quant_dc: 1.0,
        }
    }

    /// Adopts a per-block quantization field, rewriting the raw field.
    ///
    /// # Panics
    /// Panics if `raw` and `field` dimensions differ or the field is not
    /// strictly positive.
    pub fn set_quant_field(&mut self, quant_dc: f32, field: &ImageF, raw: &mut ImageI) {
        assert!(field.same_size(raw));
        let (qf_min, qf_max) = field.min_max();
        assert!(qf_min > 0.0, "quant field must be strictly positive");
        self.inv_global_scale = RAW_QUANT_MAX as f32 / qf_max;
        self.global_scale = qf_max / RAW_QUANT_MAX as f32;
        self.quant_dc = quant_dc;
        for y in 0..field.height() {
            let row_q = field.row(y);
            let row_raw = raw.row_mut(y);
            for x in 0..row_q.len() {
                let val = (row_q[x] * self.inv_global_scale + 0.5) as i32;
                row_raw[x] = val.clamp(1, RAW_QUANT_MAX);
            }
        }
    }

    /// Adopts a uniform quantization, rewriting the raw field.
    pub fn set_quant(&mut self, quant_dc: f32, quant_ac: f32, raw: &mut ImageI) {
        assert!(quant_ac > 0.0, "uniform quant must be strictly positive");
        self.inv_global_scale = RAW_QUANT_MAX as f32 / quant_ac;
        self.global_scale = quant_ac / RAW_QUANT_MAX as f32;
        self.quant_dc = quant_dc;
        raw.fill(RAW_QUANT_MAX);
    }

    /// Field value represented by one raw step.
    #[inline]
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.global_scale
    }

    /// Inverse of `scale`.
    #[inline]
    #[must_use]
    pub fn inv_global_scale(&self) -> f32 {
        self.inv_global_scale
    }

    /// DC quantization value last adopted.
    #[inline]
    #[must_use]
    pub fn quant_dc(&self) -> f32 {
        self.quant_dc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_range() {
        let mut field = ImageF::filled(4, 4, 0.5);
        field.set(3, 3, 2.0);
        field.set(0, 0, 0.01);
        let mut raw = ImageI::new(4, 4);
        let mut quantizer = Quantizer::new();
        quantizer.set_quant_field(1.18, &field, &mut raw);
        assert_eq!(raw.get(3, 3), 255);
        assert_eq!(raw.get(0, 0), 1);
        let mid = raw.get(1, 1);
        assert!((63..=65).contains(&mid), "mid raw {}", mid);
    }

    #[test]
    fn test_scale_is_one_raw_step() {
        let field = ImageF::filled(2, 2, 1.7);
        let mut raw = ImageI::new(2, 2);
        let mut quantizer = Quantizer::new();
        quantizer.set_quant_field(1.0, &field, &mut raw);
        let step = quantizer.scale();
        assert!((step * quantizer.inv_global_scale() - 1.0).abs() < 1e-6);
        // Nudging a field value by one step moves its raw index by one.
        let q = 1.0f32;
        let r0 = (q * quantizer.inv_global_scale() + 0.5) as i32;
        let r1 = ((q + step) * quantizer.inv_global_scale() + 0.5) as i32;
        assert_eq!(r1, r0 + 1);
    }

    #[test]
    fn test_representable_across_search_ratio() {
        // A field spanning the maximal search ratio still maps onto
        // distinct nonzero raw values.
        let mut field = ImageF::filled(2, 1, 252.0);
        field.set(1, 0, 1.0);
        let mut raw = ImageI::new(2, 1);
        let mut quantizer = Quantizer::new();
        quantizer.set_quant_field(1.0, &field, &mut raw);
        assert_eq!(raw.get(0, 0), 255);
        assert!(raw.get(1, 0) >= 1);
    }

    #[test]
    fn test_uniform_quant() {
        let mut raw = ImageI::new(3, 3);
        let mut quantizer = Quantizer::new();
        quantizer.set_quant(2.0, 0.84, &mut raw);
        assert_eq!(raw.get(1, 1), 255);
        assert!((quantizer.quant_dc() - 2.0).abs() < 1e-6);
        assert!((quantizer.scale() * 255.0 - 0.84).abs() < 1e-5);
    }
}
