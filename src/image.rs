//! Image buffer types for the quantization pipeline.
//!
//! Dense row-major 2D buffers with row strides padded for alignment.
//! `ImageF` holds the float planes the estimator works on; `ImageI` is
//! the integer raw quantization field owned by the quantizer.

use imgref::{ImgRef, ImgVec};
use std::ops::{Index, IndexMut};

/// Single-channel row-major image.
///
/// Rows are padded so the stride is a multiple of 16 elements, which keeps
/// row starts 64-byte aligned for f32 data.
#[derive(Debug, Clone)]
pub struct Image<T> {
    data: Vec<T>,
    width: usize,
    height: usize,
    stride: usize,
}

/// Floating-point image plane.
pub type ImageF = Image<f32>;
/// Integer image plane (raw quantization field).
pub type ImageI = Image<i32>;

impl<T: Copy + Default> Image<T> {
    /// Creates a new image filled with the default value.
    #[must_use]
    pub fn new(width: usize, height: usize) -> Self {
        let stride = (width + 15) & !15;
        Self {
            data: vec![T::default(); stride * height],
            width,
            height,
            stride,
        }
    }

    /// Creates an image filled with a constant value.
    #[must_use]
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        let stride = (width + 15) & !15;
        Self {
            data: vec![value; stride * height],
            width,
            height,
            stride,
        }
    }

    /// Creates an image from unpadded row-major data.
    ///
    /// # Panics
    /// Panics if data length doesn't match width * height.
    #[must_use]
    pub fn from_vec(data: Vec<T>, width: usize, height: usize) -> Self {
        assert_eq!(data.len(), width * height);
        Self {
            data,
            width,
            height,
            stride: width,
        }
    }

    /// Image width in pixels.
    #[inline]
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Image height in pixels.
    #[inline]
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of elements per row including padding.
    #[inline]
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Returns a reference to a row.
    #[inline]
    #[must_use]
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// Returns a mutable reference to a row.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    /// Gets a pixel value.
    #[inline]
    #[must_use]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[y * self.stride + x]
    }

    /// Sets a pixel value.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.data[y * self.stride + x] = value;
    }

    /// Returns the backing storage including row padding.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns the mutable backing storage including row padding.
    ///
    /// Parallel row loops split this into exclusive per-row chunks of
    /// `stride()` elements.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Fills the image with a constant value.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Checks if two images have the same pixel dimensions.
    #[must_use]
    pub fn same_size<U>(&self, other: &Image<U>) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Copies pixel data from another image of the same size.
    ///
    /// # Panics
    /// Panics if dimensions don't match.
    pub fn copy_from(&mut self, other: &Self) {
        assert!(self.same_size(other));
        for y in 0..self.height {
            self.row_mut(y).copy_from_slice(other.row(y));
        }
    }
}

impl ImageF {
    /// Returns the (min, max) over all pixels.
    ///
    /// # Panics
    /// Panics if the image is empty.
    #[must_use]
    pub fn min_max(&self) -> (f32, f32) {
        assert!(self.width > 0 && self.height > 0);
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for y in 0..self.height {
            for &v in self.row(y) {
                if v < lo {
                    lo = v;
                }
                if v > hi {
                    hi = v;
                }
            }
        }
        (lo, hi)
    }

    /// Multiplies every pixel in place.
    pub fn scale(&mut self, factor: f32) {
        for y in 0..self.height {
            for v in self.row_mut(y) {
                *v *= factor;
            }
        }
    }

    /// Converts to an `ImgVec<f32>`, dropping row padding.
    #[must_use]
    pub fn into_imgvec(self) -> ImgVec<f32> {
        if self.stride == self.width {
            ImgVec::new(self.data, self.width, self.height)
        } else {
            let mut out = Vec::with_capacity(self.width * self.height);
            for y in 0..self.height {
                let start = y * self.stride;
                out.extend_from_slice(&self.data[start..start + self.width]);
            }
            ImgVec::new(out, self.width, self.height)
        }
    }

    /// Creates an image from an `ImgRef<f32>` view.
    #[must_use]
    pub fn from_img(img: ImgRef<'_, f32>) -> Self {
        let mut out = Self::new(img.width(), img.height());
        for (y, row) in img.rows().enumerate() {
            out.row_mut(y).copy_from_slice(row);
        }
        out
    }
}

impl<T: Copy + Default> Index<(usize, usize)> for Image<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.data[y * self.stride + x]
    }
}

impl<T: Copy + Default> IndexMut<(usize, usize)> for Image<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        &mut self.data[y * self.stride + x]
    }
}

/// Three-channel floating point image (opsin planes X, Y, B).
#[derive(Debug, Clone)]
pub struct Image3F {
    planes: [ImageF; 3],
}

impl Image3F {
    /// Creates a new 3-channel image.
    #[must_use]
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            planes: [
                ImageF::new(width, height),
                ImageF::new(width, height),
                ImageF::new(width, height),
            ],
        }
    }

    /// Creates from three separate planes of equal size.
    #[must_use]
    pub fn from_planes(plane0: ImageF, plane1: ImageF, plane2: ImageF) -> Self {
        assert!(plane0.same_size(&plane1));
        assert!(plane0.same_size(&plane2));
        Self {
            planes: [plane0, plane1, plane2],
        }
    }

    /// Image width.
    #[inline]
    #[must_use]
    pub fn width(&self) -> usize {
        self.planes[0].width()
    }

    /// Image height.
    #[inline]
    #[must_use]
    pub fn height(&self) -> usize {
        self.planes[0].height()
    }

    /// Returns a reference to a specific plane.
    #[inline]
    #[must_use]
    pub fn plane(&self, index: usize) -> &ImageF {
        &self.planes[index]
    }

    /// Returns a mutable reference to a specific plane.
    #[inline]
    pub fn plane_mut(&mut self, index: usize) -> &mut ImageF {
        &mut self.planes[index]
    }

    /// Returns a row from a specific plane.
    #[inline]
    #[must_use]
    pub fn plane_row(&self, plane: usize, y: usize) -> &[f32] {
        self.planes[plane].row(y)
    }

    /// Returns a mutable row from a specific plane.
    #[inline]
    pub fn plane_row_mut(&mut self, plane: usize, y: usize) -> &mut [f32] {
        self.planes[plane].row_mut(y)
    }

    /// Returns mutable references to all three planes at once.
    #[inline]
    pub fn planes_mut(&mut self) -> (&mut ImageF, &mut ImageF, &mut ImageF) {
        let [p0, p1, p2] = &mut self.planes;
        (p0, p1, p2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_creation() {
        let img = ImageF::new(100, 50);
        assert_eq!(img.width(), 100);
        assert_eq!(img.height(), 50);
        assert!(img.stride() >= 100);
        assert_eq!(img.stride() % 16, 0);
    }

    #[test]
    fn test_pixel_access() {
        let mut img = ImageF::new(10, 10);
        img.set(5, 3, 42.0);
        assert!((img.get(5, 3) - 42.0).abs() < 0.001);
        assert!((img[(5, 3)] - 42.0).abs() < 0.001);
    }

    #[test]
    fn test_integer_plane() {
        let mut raw = ImageI::new(4, 4);
        raw.set(1, 2, -7);
        assert_eq!(raw.get(1, 2), -7);
        assert_eq!(raw.get(0, 0), 0);
    }

    #[test]
    fn test_min_max_scale() {
        let mut img = ImageF::filled(4, 4, 2.0);
        img.set(3, 3, 8.0);
        img.set(0, 1, 0.5);
        assert_eq!(img.min_max(), (0.5, 8.0));
        img.scale(2.0);
        assert_eq!(img.min_max(), (1.0, 16.0));
    }

    #[test]
    fn test_imgvec_roundtrip() {
        let mut img = ImageF::new(5, 3);
        for y in 0..3 {
            for x in 0..5 {
                img.set(x, y, (y * 5 + x) as f32);
            }
        }
        let v = img.clone().into_imgvec();
        assert_eq!(v.width(), 5);
        let back = ImageF::from_img(v.as_ref());
        for y in 0..3 {
            assert_eq!(back.row(y), img.row(y));
        }
    }

    #[test]
    fn test_image3f_split_borrow() {
        let mut img = Image3F::new(8, 8);
        let (p0, p1, _p2) = img.planes_mut();
        p0.set(0, 0, 1.0);
        p1.set(0, 0, 2.0);
        assert_eq!(img.plane(0).get(0, 0), 1.0);
        assert_eq!(img.plane(1).get(0, 0), 2.0);
    }
}
