//! Floating-point intensity images.

use image::GrayImage;

/// Row-major single-channel image with intensities in [0, 255].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageF32 {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl ImageF32 {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, data: vec![0.0; width * height] }
    }

    pub fn from_fn<F: FnMut(usize, usize) -> f32>(width: usize, height: usize, mut f: F) -> Self {
        let mut image = Self::new(width, height);
        for y in 0..height {
            for x in 0..width {
                image.data[y * width + x] = f(x, y);
            }
        }
        image
    }

    pub fn from_gray(gray: &GrayImage) -> Self {
        let mut image = Self::new(gray.width() as usize, gray.height() as usize);
        image.fill_from_gray(gray);
        image
    }

    /// Copy `gray` into the existing buffer. Dimensions must match.
    pub fn fill_from_gray(&mut self, gray: &GrayImage) {
        debug_assert_eq!(gray.width() as usize, self.width);
        debug_assert_eq!(gray.height() as usize, self.height);
        for (dst, src) in self.data.iter_mut().zip(gray.as_raw().iter()) {
            *dst = *src as f32;
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    /// Bilinear interpolation. The caller guarantees `0 <= x < width - 1`
    /// and `0 <= y < height - 1`.
    #[inline]
    pub fn bilinear_unchecked(&self, x: f64, y: f64) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let ax = (x - x0) as f32;
        let ay = (y - y0) as f32;
        let idx = y0 as usize * self.width + x0 as usize;
        let i00 = self.data[idx];
        let i10 = self.data[idx + 1];
        let i01 = self.data[idx + self.width];
        let i11 = self.data[idx + self.width + 1];
        (1.0 - ay) * ((1.0 - ax) * i00 + ax * i10) + ay * ((1.0 - ax) * i01 + ax * i11)
    }

    /// Bilinear interpolation, `None` if any of the four neighbours is missing.
    pub fn bilinear(&self, x: f64, y: f64) -> Option<f32> {
        if !(x >= 0.0 && y >= 0.0) {
            return None;
        }
        if x.floor() as usize + 1 >= self.width || y.floor() as usize + 1 >= self.height {
            return None;
        }
        Some(self.bilinear_unchecked(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_gray_copies_pixels() {
        let gray = GrayImage::from_fn(4, 3, |x, y| image::Luma([(x + 10 * y) as u8]));
        let img = ImageF32::from_gray(&gray);
        assert_eq!(img.get(3, 2), 23.0);
    }

    #[test]
    fn test_bilinear_on_linear_ramp_is_exact() {
        let img = ImageF32::from_fn(10, 10, |x, y| 2.0 * x as f32 + 3.0 * y as f32);
        assert_relative_eq!(
            img.bilinear(2.25, 4.5).unwrap(),
            2.0 * 2.25 + 3.0 * 4.5,
            epsilon = 1e-5
        );
        assert!(img.bilinear(8.5, 1.0).is_some());
        assert!(img.bilinear(9.0, 1.0).is_none());
        assert!(img.bilinear(-0.1, 1.0).is_none());
    }
}
