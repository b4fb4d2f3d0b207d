//! Square intensity patches with gradients, sampled by bilinear
//! interpolation around a sub-pixel centre.
//!
//! Sample `k` of an `n`-pixel side sits at `c + k - n/2 + 0.5`, so the patch
//! is centred on `c`. An `(n+2)²` grid is sampled so that gradients can be
//! taken by central differences without a second pass over the image.

use nalgebra::Vector2;

use super::image::ImageF32;
use crate::error::OutOfBoundsPatch;

#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    size: usize,
    /// Intensities, row-major `size * size`.
    pub intensity: Vec<f32>,
    /// ∂I/∂x in level pixels.
    pub grad_x: Vec<f32>,
    /// ∂I/∂y in level pixels.
    pub grad_y: Vec<f32>,
    extended: Vec<f32>,
}

impl Patch {
    /// Zero patch with pre-allocated buffers.
    pub fn new(size: usize) -> Self {
        let n = size * size;
        Self {
            size,
            intensity: vec![0.0; n],
            grad_x: vec![0.0; n],
            grad_y: vec![0.0; n],
            extended: vec![0.0; (size + 2) * (size + 2)],
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.size * self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Offset of sample `(i, j)` from the patch centre.
    #[inline]
    pub fn offset(&self, i: usize, j: usize) -> Vector2<f64> {
        let half = self.size as f64 / 2.0;
        Vector2::new(i as f64 - half + 0.5, j as f64 - half + 0.5)
    }

    /// True if a patch of `size` centred at `center` can be sampled from an
    /// image of `width` x `height`, including the gradient border.
    pub fn fits(width: usize, height: usize, center: &Vector2<f64>, size: usize) -> bool {
        let lo = size as f64 / 2.0 + 0.5;
        let hi_x = width as f64 - size as f64 / 2.0 - 1.5;
        let hi_y = height as f64 - size as f64 / 2.0 - 1.5;
        center.x >= lo && center.y >= lo && center.x < hi_x && center.y < hi_y
    }

    pub fn extract(
        image: &ImageF32,
        center: &Vector2<f64>,
        size: usize,
        level: usize,
    ) -> Result<Self, OutOfBoundsPatch> {
        let mut patch = Self::new(size);
        patch.extract_into(image, center, level)?;
        Ok(patch)
    }

    /// Re-sample this patch in place. On failure the contents are untouched.
    pub fn extract_into(
        &mut self,
        image: &ImageF32,
        center: &Vector2<f64>,
        level: usize,
    ) -> Result<(), OutOfBoundsPatch> {
        if !Self::fits(image.width(), image.height(), center, self.size) {
            return Err(OutOfBoundsPatch {
                x: center.x,
                y: center.y,
                level,
                width: image.width(),
                height: image.height(),
            });
        }

        let n = self.size;
        let ext = n + 2;
        let origin = center.map(|v| v - n as f64 / 2.0 - 0.5);
        for j in 0..ext {
            for i in 0..ext {
                self.extended[j * ext + i] =
                    image.bilinear_unchecked(origin.x + i as f64, origin.y + j as f64);
            }
        }

        for j in 0..n {
            for i in 0..n {
                let e = (j + 1) * ext + (i + 1);
                let k = j * n + i;
                self.intensity[k] = self.extended[e];
                self.grad_x[k] = 0.5 * (self.extended[e + 1] - self.extended[e - 1]);
                self.grad_y[k] = 0.5 * (self.extended[e + ext] - self.extended[e - ext]);
            }
        }
        Ok(())
    }

    pub fn mean_intensity(&self) -> f32 {
        if self.intensity.is_empty() {
            return 0.0;
        }
        self.intensity.iter().sum::<f32>() / self.intensity.len() as f32
    }

    pub fn mean_gradient(&self) -> Vector2<f32> {
        if self.intensity.is_empty() {
            return Vector2::zeros();
        }
        let n = self.len() as f32;
        Vector2::new(self.grad_x.iter().sum::<f32>() / n, self.grad_y.iter().sum::<f32>() / n)
    }

    pub fn clear(&mut self) {
        self.intensity.iter_mut().for_each(|v| *v = 0.0);
        self.grad_x.iter_mut().for_each(|v| *v = 0.0);
        self.grad_y.iter_mut().for_each(|v| *v = 0.0);
    }
}
