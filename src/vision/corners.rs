//! Shi-Tomasi corner candidates for feature initialization.

use nalgebra::Vector2;

use super::image::ImageF32;
use super::pyramid::ImagePyramid;

/// A candidate location, reported in level-0 pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CornerCandidate {
    pub pixel: Vector2<f64>,
    /// Smallest eigenvalue of the mean structure tensor in the window.
    pub score: f64,
}

/// Parameters for [`detect_corners`].
#[derive(Debug, Clone, Copy)]
pub struct CornerParams {
    /// Half-width of the summation window (level pixels).
    pub window_half: usize,
    /// Side of the non-maximum-suppression buckets (level pixels).
    pub bucket_size: usize,
    /// Candidates scoring below this are discarded.
    pub min_score: f64,
    /// Minimum distance to the image border (level pixels).
    pub border: usize,
}

/// Detect the best corner per bucket on pyramid level `level`, sorted by
/// descending score.
pub fn detect_corners(
    image: &ImageF32,
    level: usize,
    params: &CornerParams,
) -> Vec<CornerCandidate> {
    let (w, h) = (image.width(), image.height());
    let margin = params.border.max(params.window_half + 1);
    if w <= 2 * margin || h <= 2 * margin || params.bucket_size == 0 {
        return Vec::new();
    }

    // Integral images of gx², gx·gy, gy² with a zero first row/column.
    let stride = w + 1;
    let mut ixx = vec![0.0f64; stride * (h + 1)];
    let mut ixy = vec![0.0f64; stride * (h + 1)];
    let mut iyy = vec![0.0f64; stride * (h + 1)];
    for y in 0..h {
        let (mut rxx, mut rxy, mut ryy) = (0.0, 0.0, 0.0);
        for x in 0..w {
            let (gx, gy) = if x == 0 || y == 0 || x + 1 == w || y + 1 == h {
                (0.0, 0.0)
            } else {
                (
                    0.5 * (image.get(x + 1, y) - image.get(x - 1, y)) as f64,
                    0.5 * (image.get(x, y + 1) - image.get(x, y - 1)) as f64,
                )
            };
            rxx += gx * gx;
            rxy += gx * gy;
            ryy += gy * gy;
            let idx = (y + 1) * stride + x + 1;
            ixx[idx] = ixx[idx - stride] + rxx;
            ixy[idx] = ixy[idx - stride] + rxy;
            iyy[idx] = iyy[idx - stride] + ryy;
        }
    }

    let r = params.window_half;
    let area = ((2 * r + 1) * (2 * r + 1)) as f64;
    let window_sum = |table: &[f64], x: usize, y: usize| -> f64 {
        let (x0, y0, x1, y1) = (x - r, y - r, x + r + 1, y + r + 1);
        table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
            + table[y0 * stride + x0]
    };

    let bs = params.bucket_size;
    let buckets_x = w.div_ceil(bs);
    let buckets_y = h.div_ceil(bs);
    let mut best: Vec<Option<(usize, usize, f64)>> = vec![None; buckets_x * buckets_y];

    for y in margin..h - margin {
        for x in margin..w - margin {
            let a = window_sum(&ixx, x, y) / area;
            let b = window_sum(&ixy, x, y) / area;
            let c = window_sum(&iyy, x, y) / area;
            let half_trace = 0.5 * (a + c);
            let det_term = (0.25 * (a - c) * (a - c) + b * b).sqrt();
            let score = half_trace - det_term;
            if score < params.min_score {
                continue;
            }
            let bucket = (y / bs) * buckets_x + x / bs;
            if best[bucket].map_or(true, |(_, _, s)| score > s) {
                best[bucket] = Some((x, y, score));
            }
        }
    }

    let mut out: Vec<CornerCandidate> = best
        .into_iter()
        .flatten()
        .map(|(x, y, score)| CornerCandidate {
            pixel: ImagePyramid::from_level(&Vector2::new(x as f64, y as f64), level),
            score,
        })
        .collect();
    out.sort_by(|a, b| b.score.total_cmp(&a.score));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CornerParams {
        CornerParams { window_half: 2, bucket_size: 8, min_score: 1.0, border: 4 }
    }

    #[test]
    fn test_flat_image_has_no_corners() {
        let img = ImageF32::from_fn(64, 64, |_, _| 80.0);
        assert!(detect_corners(&img, 0, &params()).is_empty());
    }

    #[test]
    fn test_edge_is_not_a_corner() {
        let img = ImageF32::from_fn(64, 64, |x, _| if x < 32 { 20.0 } else { 200.0 });
        assert!(detect_corners(&img, 0, &params()).is_empty());
    }

    #[test]
    fn test_square_corner_is_found() {
        let img = ImageF32::from_fn(64, 64, |x, y| if x >= 30 && y >= 30 { 200.0 } else { 20.0 });
        let corners = detect_corners(&img, 0, &params());
        assert!(!corners.is_empty());
        let best = corners[0];
        assert!((best.pixel.x - 29.5).abs() <= 2.0, "x = {}", best.pixel.x);
        assert!((best.pixel.y - 29.5).abs() <= 2.0, "y = {}", best.pixel.y);
    }

    #[test]
    fn test_level_coordinates_are_scaled() {
        let img = ImageF32::from_fn(64, 64, |x, y| if x >= 30 && y >= 30 { 200.0 } else { 20.0 });
        let c0 = detect_corners(&img, 0, &params())[0];
        let c1 = detect_corners(&img, 1, &params())[0];
        assert!((c1.pixel.x - (2.0 * c0.pixel.x + 0.5)).abs() < 1e-9);
    }
}
