//! Multi-resolution image pyramid.
//!
//! Level 0 is the input image; level `l+1` is the 2x2 box average of level
//! `l`. Pixel centres map between levels as
//!
//! ```text
//! x_l = (x_0 + 0.5) / 2^l - 0.5
//! ```

use image::GrayImage;
use nalgebra::Vector2;

use super::image::ImageF32;
use crate::error::{VioError, VioResult};

/// Pre-allocated pyramid; `build` reuses the buffers for every frame.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    levels: Vec<ImageF32>,
}

impl ImagePyramid {
    /// Allocate `n_levels` levels for images of `width` x `height`.
    pub fn new(width: usize, height: usize, n_levels: usize) -> Self {
        let levels = (0..n_levels.max(1))
            .map(|l| ImageF32::new((width >> l).max(1), (height >> l).max(1)))
            .collect();
        Self { levels }
    }

    pub fn from_gray(gray: &GrayImage, n_levels: usize) -> Self {
        let mut pyramid = Self::new(gray.width() as usize, gray.height() as usize, n_levels);
        pyramid.fill(gray);
        pyramid
    }

    /// Rebuild all levels from `gray`.
    pub fn build(&mut self, gray: &GrayImage) -> VioResult<()> {
        let (w, h) = (self.levels[0].width(), self.levels[0].height());
        if gray.width() as usize != w || gray.height() as usize != h {
            return Err(VioError::InvalidMeasurement(format!(
                "image is {}x{}, camera expects {}x{}",
                gray.width(),
                gray.height(),
                w,
                h
            )));
        }
        self.fill(gray);
        Ok(())
    }

    fn fill(&mut self, gray: &GrayImage) {
        self.levels[0].fill_from_gray(gray);
        for l in 1..self.levels.len() {
            let (finer, coarser) = self.levels.split_at_mut(l);
            downsample(&finer[l - 1], &mut coarser[0]);
        }
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, l: usize) -> &ImageF32 {
        &self.levels[l]
    }

    /// Convert a level-0 pixel coordinate to level `l`.
    #[inline]
    pub fn to_level(pixel: &Vector2<f64>, l: usize) -> Vector2<f64> {
        let s = (1u32 << l) as f64;
        pixel.map(|v| (v + 0.5) / s - 0.5)
    }

    /// Convert a level-`l` pixel coordinate back to level 0.
    #[inline]
    pub fn from_level(pixel: &Vector2<f64>, l: usize) -> Vector2<f64> {
        let s = (1u32 << l) as f64;
        pixel.map(|v| (v + 0.5) * s - 0.5)
    }
}

fn downsample(src: &ImageF32, dst: &mut ImageF32) {
    for y in 0..dst.height() {
        for x in 0..dst.width() {
            let (sx, sy) = (2 * x, 2 * y);
            let v = src.get(sx, sy)
                + src.get(sx + 1, sy)
                + src.get(sx, sy + 1)
                + src.get(sx + 1, sy + 1);
            dst.set(x, y, 0.25 * v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_level_sizes() {
        let pyramid = ImagePyramid::new(752, 480, 4);
        assert_eq!(pyramid.level(3).width(), 94);
        assert_eq!(pyramid.level(3).height(), 60);
    }

    #[test]
    fn test_downsample_preserves_linear_ramp() {
        // A ramp in x sampled at pixel centres stays consistent with the
        // level mapping after averaging.
        let gray = GrayImage::from_fn(64, 32, |x, _| image::Luma([(2 * x) as u8]));
        let pyramid = ImagePyramid::from_gray(&gray, 3);
        let p0 = Vector2::new(21.0, 10.0);
        let p2 = ImagePyramid::to_level(&p0, 2);
        let v = pyramid.level(2).bilinear(p2.x, p2.y).unwrap();
        assert_relative_eq!(v, 2.0 * 21.0, epsilon = 1e-4);
    }

    #[test]
    fn test_level_mapping_roundtrip() {
        let p = Vector2::new(100.25, 37.5);
        let back = ImagePyramid::from_level(&ImagePyramid::to_level(&p, 3), 3);
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_wrong_size_rejected() {
        let mut pyramid = ImagePyramid::new(64, 32, 2);
        let gray = GrayImage::new(32, 32);
        assert!(matches!(pyramid.build(&gray), Err(VioError::InvalidMeasurement(_))));
    }
}
