// THEORY:
// A `Roi` is the smallest spatial unit the tracking core knows about: one tube,
// one animal. It is a polygon drawn on the full camera frame plus a stable
// integer `idx` that every downstream consumer (result tables, hardware
// channel maps, overlays) uses as its key.
//
// Key architectural principles:
// 1.  **Immutable Geometry**: Everything derived from the polygon (bounding
//     rectangle, longest axis, the rasterised mask) is computed once in the
//     constructor. A `Roi` never changes after it is built and is shared as an
//     `Arc<Roi>` between the session and its tracking unit.
// 2.  **Crop and Mask**: `apply` is the bridge between the full frame and the
//     per-animal tracker. It crops the frame to the bounding rectangle and
//     zeroes every pixel that lies outside the polygon, so the tracker only
//     ever sees its own tube.
// 3.  **Relative Coordinates**: Trackers work in ROI-relative pixel
//     coordinates. `offset` is the only thing needed to move back to frame
//     coordinates.

use crate::error::{ConfigError, TrackingError};
use image::{GrayImage, Luma};

/// A region of interest: one tube / animal slot of the arena.
#[derive(Debug, Clone)]
pub struct Roi {
    polygon: Vec<(i32, i32)>,
    idx: u32,
    value: Option<f64>,
    /// Bounding rectangle as (x, y, w, h), inclusive of the polygon's edge pixels.
    rectangle: (u32, u32, u32, u32),
    /// `w x h` mask, 255 inside the polygon and 0 outside.
    mask: GrayImage,
}

impl Roi {
    pub fn new(polygon: Vec<(i32, i32)>, idx: u32, value: Option<f64>) -> Result<Self, ConfigError> {
        if idx == 0 {
            return Err(ConfigError::InvalidRoi {
                idx,
                reason: "ROI index must be a positive integer".to_string(),
            });
        }
        if polygon.len() < 4 {
            return Err(ConfigError::InvalidRoi {
                idx,
                reason: format!("polygon needs at least 4 points, got {}", polygon.len()),
            });
        }

        let min_x = polygon.iter().map(|p| p.0).min().unwrap_or(0);
        let max_x = polygon.iter().map(|p| p.0).max().unwrap_or(0);
        let min_y = polygon.iter().map(|p| p.1).min().unwrap_or(0);
        let max_y = polygon.iter().map(|p| p.1).max().unwrap_or(0);

        if min_x < 0 || min_y < 0 {
            return Err(ConfigError::InvalidRoi {
                idx,
                reason: "polygon has negative coordinates".to_string(),
            });
        }
        if max_x == min_x || max_y == min_y {
            return Err(ConfigError::InvalidRoi {
                idx,
                reason: "polygon has a degenerate bounding box".to_string(),
            });
        }

        let w = (max_x - min_x + 1) as u32;
        let h = (max_y - min_y + 1) as u32;
        let local: Vec<(f64, f64)> = polygon
            .iter()
            .map(|&(x, y)| ((x - min_x) as f64, (y - min_y) as f64))
            .collect();

        let mask = GrayImage::from_fn(w, h, |x, y| {
            if point_in_polygon(&local, x as f64, y as f64) {
                Luma([255])
            } else {
                Luma([0])
            }
        });

        Ok(Self {
            polygon,
            idx,
            value,
            rectangle: (min_x as u32, min_y as u32, w, h),
            mask,
        })
    }

    /// Axis aligned rectangle with corners at (x, y) and (x + w - 1, y + h - 1).
    pub fn from_rectangle(x: u32, y: u32, w: u32, h: u32, idx: u32) -> Result<Self, ConfigError> {
        let (x0, y0) = (x as i32, y as i32);
        let (x1, y1) = ((x + w) as i32 - 1, (y + h) as i32 - 1);
        Self::new(vec![(x0, y0), (x0, y1), (x1, y1), (x1, y0)], idx, None)
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn polygon(&self) -> &[(i32, i32)] {
        &self.polygon
    }

    pub fn rectangle(&self) -> (u32, u32, u32, u32) {
        self.rectangle
    }

    /// Top left corner of the bounding rectangle in frame coordinates.
    pub fn offset(&self) -> (u32, u32) {
        (self.rectangle.0, self.rectangle.1)
    }

    pub fn longest_axis(&self) -> u32 {
        self.rectangle.2.max(self.rectangle.3)
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Crops `frame` to the bounding rectangle and zeroes pixels outside the polygon.
    pub fn apply(&self, frame: &GrayImage) -> Result<(GrayImage, &GrayImage), TrackingError> {
        let (x, y, w, h) = self.rectangle;
        if x + w > frame.width() || y + h > frame.height() {
            return Err(TrackingError::RoiOutsideFrame {
                idx: self.idx,
                width: frame.width(),
                height: frame.height(),
            });
        }

        let sub_image = GrayImage::from_fn(w, h, |sx, sy| {
            if self.mask.get_pixel(sx, sy)[0] > 0 {
                *frame.get_pixel(x + sx, y + sy)
            } else {
                Luma([0])
            }
        });

        Ok((sub_image, &self.mask))
    }
}

/// Even-odd rule, with points on an edge counted as inside.
fn point_in_polygon(polygon: &[(f64, f64)], px: f64, py: f64) -> bool {
    let n = polygon.len();
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];

        if on_segment((xi, yi), (xj, yj), (px, py)) {
            return true;
        }

        if (yi > py) != (yj > py) {
            let x_cross = (xj - xi) * (py - yi) / (yj - yi) + xi;
            if px < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    if cross.abs() > 1e-9 {
        return false;
    }
    p.0 >= a.0.min(b.0) && p.0 <= a.0.max(b.0) && p.1 >= a.1.min(b.1) && p.1 <= a.1.max(b.1)
}
