//! Bright-blob target detection on a preprocessed frame.
//!
//! The detector thresholds the image, labels 8-connected components, keeps
//! the largest one above `min_area_px` and converts its geometry into a
//! bearing (and, when the physical size is known, a range) through a pinhole
//! camera model.

use relume_types::{BoundingBox, TargetInfo};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::image::GrayImage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Pixels at or above this value belong to a candidate blob.
    pub threshold: u8,
    /// Components smaller than this are treated as noise.
    pub min_area_px: u32,
    pub horizontal_fov_deg: f32,
    /// Physical target diameter; enables range estimation.
    pub target_diameter_m: Option<f32>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 200,
            min_area_px: 20,
            horizontal_fov_deg: 62.2,
            target_diameter_m: Some(0.2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Blob {
    area: u32,
    sum_x: u64,
    sum_y: u64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

#[derive(Debug, Clone)]
pub struct TargetDetector {
    config: DetectionConfig,
}

impl TargetDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Focal length in pixels for an image `width` pixels wide.
    pub fn focal_length_px(&self, width: u32) -> f32 {
        let half_fov = self.config.horizontal_fov_deg.to_radians() * 0.5;
        (width as f32 * 0.5) / half_fov.tan()
    }

    /// Locate the largest bright blob, or `None` when the target is lost.
    pub fn detect(&self, img: &GrayImage) -> Option<TargetInfo> {
        let blob = self.largest_blob(img)?;
        let width = img.width();

        let centroid_x = blob.sum_x as f32 / blob.area as f32 + 0.5;
        let centroid_y = blob.sum_y as f32 / blob.area as f32 + 0.5;
        let bbox = BoundingBox {
            x: blob.min_x,
            y: blob.min_y,
            width: blob.max_x - blob.min_x + 1,
            height: blob.max_y - blob.min_y + 1,
        };

        let f = self.focal_length_px(width);
        let bearing_rad = ((centroid_x - width as f32 * 0.5) / f).atan();
        let range_m = self
            .config
            .target_diameter_m
            .map(|d| d * f / bbox.width as f32);
        let confidence = blob.area as f32 / (bbox.width * bbox.height) as f32;

        trace!(area = blob.area, bearing_rad, ?range_m, "target detected");
        Some(TargetInfo {
            centroid_x,
            centroid_y,
            bbox,
            area_px: blob.area,
            bearing_rad,
            range_m,
            confidence,
        })
    }

    fn largest_blob(&self, img: &GrayImage) -> Option<Blob> {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let pixels = img.pixels();
        let mut visited = vec![false; w * h];
        let mut stack = Vec::new();
        let mut best: Option<Blob> = None;

        for start in 0..w * h {
            if visited[start] || pixels[start] < self.config.threshold {
                continue;
            }
            visited[start] = true;
            stack.push(start);
            let (sx, sy) = ((start % w) as u32, (start / w) as u32);
            let mut blob = Blob {
                area: 0,
                sum_x: 0,
                sum_y: 0,
                min_x: sx,
                min_y: sy,
                max_x: sx,
                max_y: sy,
            };

            while let Some(i) = stack.pop() {
                let (x, y) = (i % w, i / w);
                blob.area += 1;
                blob.sum_x += x as u64;
                blob.sum_y += y as u64;
                blob.min_x = blob.min_x.min(x as u32);
                blob.min_y = blob.min_y.min(y as u32);
                blob.max_x = blob.max_x.max(x as u32);
                blob.max_y = blob.max_y.max(y as u32);

                for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                        let j = ny * w + nx;
                        if !visited[j] && pixels[j] >= self.config.threshold {
                            visited[j] = true;
                            stack.push(j);
                        }
                    }
                }
            }

            // Strictly larger wins, so the first blob in scan order breaks ties.
            if blob.area >= self.config.min_area_px && best.is_none_or(|b| blob.area > b.area) {
                best = Some(blob);
            }
        }
        best
    }
}

impl Default for TargetDetector {
    fn default() -> Self {
        Self::new(DetectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_rect(img: &mut GrayImage, x0: u32, y0: u32, w: u32, h: u32, v: u8) {
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.set(x, y, v);
            }
        }
    }

    #[test]
    fn empty_image_has_no_target() {
        let img = GrayImage::filled(64, 48, 40);
        assert!(TargetDetector::default().detect(&img).is_none());
    }

    #[test]
    fn small_blobs_are_noise() {
        let mut img = GrayImage::filled(64, 48, 0);
        with_rect(&mut img, 10, 10, 4, 4, 255);
        assert!(TargetDetector::default().detect(&img).is_none());
    }

    #[test]
    fn centred_square_has_zero_bearing() {
        let mut img = GrayImage::filled(64, 48, 0);
        with_rect(&mut img, 28, 20, 8, 8, 230);
        let t = TargetDetector::default().detect(&img).unwrap();
        assert_eq!(t.area_px, 64);
        assert_eq!(
            t.bbox,
            BoundingBox {
                x: 28,
                y: 20,
                width: 8,
                height: 8
            }
        );
        assert!((t.centroid_x - 32.0).abs() < 1e-4);
        assert!(t.bearing_rad.abs() < 1e-6);
        assert!((t.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bearing_is_positive_to_the_right() {
        let mut img = GrayImage::filled(64, 48, 0);
        with_rect(&mut img, 50, 20, 6, 6, 255);
        let t = TargetDetector::default().detect(&img).unwrap();
        assert!(t.bearing_rad > 0.0);
        // Half the field of view bounds any bearing.
        assert!(t.bearing_rad < 31.1f32.to_radians());
    }

    #[test]
    fn range_follows_pinhole_model() {
        let det = TargetDetector::default();
        let mut img = GrayImage::filled(640, 480, 0);
        with_rect(&mut img, 300, 220, 40, 40, 255);
        let t = det.detect(&img).unwrap();
        let f = det.focal_length_px(640);
        let expected = 0.2 * f / 40.0;
        assert!((t.range_m.unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn range_absent_without_diameter() {
        let det = TargetDetector::new(DetectionConfig {
            target_diameter_m: None,
            ..Default::default()
        });
        let mut img = GrayImage::filled(32, 32, 0);
        with_rect(&mut img, 4, 4, 6, 6, 255);
        assert!(det.detect(&img).unwrap().range_m.is_none());
    }

    #[test]
    fn largest_component_wins_and_diagonals_connect() {
        let mut img = GrayImage::filled(64, 48, 0);
        with_rect(&mut img, 2, 2, 5, 5, 255);
        // Diagonal staircase of 2x2 steps: one 8-connected component.
        for k in 0..10 {
            with_rect(&mut img, 20 + 2 * k, 10 + 2 * k, 2, 2, 255);
        }
        let t = TargetDetector::default().detect(&img).unwrap();
        assert_eq!(t.area_px, 40);
        assert_eq!(t.bbox.x, 20);
        assert!(t.confidence < 0.2);
    }
}
