// THEORY:
// The blob detector is the spatial grouping step of the tracker. It takes the
// binarised foreground of one ROI (pixels that differ from the learned
// background) and groups them into spatially coherent components, one of
// which is hopefully the fly.
//
// Algorithm steps:
// 1.  **Seeding**: every foreground pixel not yet visited starts a new blob.
// 2.  **Region Growing**: a breadth-first search adds the 4-connected
//     neighbours that are also foreground.
// 3.  **Data Aggregation**: once a blob is fully grown its area, bounding box,
//     centroid and second order central moments are computed. The moments give
//     the ellipse with the same inertia as the blob, which is how the animal's
//     length, width and orientation are reported.
// 4.  **Stateless Utility**: nothing is remembered between frames; all
//     temporal reasoning lives in the locator.

use image::{GrayImage, Luma};
use std::collections::VecDeque;

/// A 2D pixel coordinate inside the ROI image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// The ellipse with the same second order moments as a blob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    pub center: (f64, f64),
    /// Full length of the major axis in pixels.
    pub major: f64,
    /// Full length of the minor axis in pixels.
    pub minor: f64,
    /// Orientation of the major axis in degrees, in [0, 180).
    pub angle: f64,
}

/// A connected component of the foreground.
#[derive(Debug, Clone)]
pub struct Blob {
    pub pixels: Vec<Point>,
    /// Top-left and bottom-right corners, inclusive.
    pub bounding_box: (Point, Point),
    pub centroid: (f64, f64),
}

impl Blob {
    pub fn area(&self) -> usize {
        self.pixels.len()
    }

    pub fn ellipse(&self) -> Ellipse {
        let n = self.pixels.len().max(1) as f64;
        let (cx, cy) = self.centroid;
        let (mut mu20, mut mu02, mut mu11) = (0.0, 0.0, 0.0);
        for p in &self.pixels {
            let dx = p.x as f64 - cx;
            let dy = p.y as f64 - cy;
            mu20 += dx * dx;
            mu02 += dy * dy;
            mu11 += dx * dy;
        }
        mu20 /= n;
        mu02 /= n;
        mu11 /= n;

        // A single pixel row still has a thickness of one pixel.
        let pixel_var = 1.0 / 12.0;
        let common = ((mu20 - mu02).powi(2) + 4.0 * mu11 * mu11).sqrt();
        let lambda1 = (mu20 + mu02 + common) / 2.0 + pixel_var;
        let lambda2 = ((mu20 + mu02 - common) / 2.0).max(0.0) + pixel_var;

        let mut angle = (0.5 * (2.0 * mu11).atan2(mu20 - mu02)).to_degrees();
        if angle < 0.0 {
            angle += 180.0;
        }
        if angle >= 180.0 {
            angle -= 180.0;
        }

        Ellipse {
            center: self.centroid,
            major: 4.0 * lambda1.sqrt(),
            minor: 4.0 * lambda2.sqrt(),
            angle,
        }
    }
}

pub mod blob_detector {
    use super::*;

    /// Finds all 4-connected components of non-zero pixels.
    pub fn find_blobs(foreground: &GrayImage) -> Vec<Blob> {
        let (width, height) = foreground.dimensions();
        let mut visited = vec![false; (width * height) as usize];
        let mut blobs = Vec::new();

        for y in 0..height {
            for x in 0..width {
                let index = (y * width + x) as usize;
                if visited[index] || foreground.get_pixel(x, y)[0] == 0 {
                    continue;
                }
                blobs.push(grow_blob(foreground, &mut visited, Point { x, y }));
            }
        }
        blobs
    }

    fn grow_blob(foreground: &GrayImage, visited: &mut [bool], seed: Point) -> Blob {
        let (width, height) = foreground.dimensions();
        let mut pixels = Vec::new();
        let mut queue = VecDeque::from([seed]);
        visited[(seed.y * width + seed.x) as usize] = true;

        while let Some(current) = queue.pop_front() {
            pixels.push(current);

            for (dx, dy) in [(0i64, 1i64), (0, -1), (1, 0), (-1, 0)] {
                let nx = current.x as i64 + dx;
                let ny = current.y as i64 + dy;
                if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                    continue;
                }
                let (nx, ny) = (nx as u32, ny as u32);
                let index = (ny * width + nx) as usize;
                if !visited[index] && foreground.get_pixel(nx, ny)[0] > 0 {
                    visited[index] = true;
                    queue.push_back(Point { x: nx, y: ny });
                }
            }
        }

        let mut min = Point { x: u32::MAX, y: u32::MAX };
        let mut max = Point { x: 0, y: 0 };
        let (mut sum_x, mut sum_y) = (0.0, 0.0);
        for p in &pixels {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            sum_x += p.x as f64;
            sum_y += p.y as f64;
        }
        let n = pixels.len() as f64;

        Blob {
            bounding_box: (min, max),
            centroid: (sum_x / n, sum_y / n),
            pixels,
        }
    }

    /// Rasterises a filled ellipse into a `width x height` mask (255 inside).
    pub fn ellipse_mask(width: u32, height: u32, ellipse: &Ellipse) -> GrayImage {
        let a = (ellipse.major / 2.0).max(0.5);
        let b = (ellipse.minor / 2.0).max(0.5);
        let (sin, cos) = ellipse.angle.to_radians().sin_cos();
        let (cx, cy) = ellipse.center;

        GrayImage::from_fn(width, height, |x, y| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let u = dx * cos + dy * sin;
            let v = -dx * sin + dy * cos;
            if (u / a).powi(2) + (v / b).powi(2) <= 1.0 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::blob_detector::*;
    use super::*;

    fn draw_rect(img: &mut GrayImage, x0: u32, y0: u32, w: u32, h: u32) {
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.put_pixel(x, y, Luma([255]));
            }
        }
    }

    #[test]
    fn separates_disconnected_components() {
        let mut img = GrayImage::new(30, 10);
        draw_rect(&mut img, 1, 1, 3, 3);
        draw_rect(&mut img, 20, 2, 4, 2);
        let blobs = find_blobs(&img);
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].area(), 9);
        assert_eq!(blobs[1].area(), 8);
        assert_eq!(blobs[1].bounding_box.0, Point { x: 20, y: 2 });
    }

    #[test]
    fn diagonal_pixels_are_not_connected() {
        let mut img = GrayImage::new(4, 4);
        img.put_pixel(0, 0, Luma([255]));
        img.put_pixel(1, 1, Luma([255]));
        assert_eq!(find_blobs(&img).len(), 2);
    }

    #[test]
    fn horizontal_bar_has_horizontal_major_axis() {
        let mut img = GrayImage::new(40, 20);
        draw_rect(&mut img, 10, 8, 20, 4);
        let blobs = find_blobs(&img);
        let e = blobs[0].ellipse();
        assert!((e.center.0 - 19.5).abs() < 1e-9);
        assert!((e.center.1 - 9.5).abs() < 1e-9);
        assert!(e.major > e.minor);
        assert!(e.angle < 1e-6 || (180.0 - e.angle) < 1e-6);
        // A w x h rectangle has the inertia of an ellipse of axes w*2/sqrt(3), h*2/sqrt(3).
        assert!((e.major - 20.0 * 2.0 / 3f64.sqrt()).abs() < 0.5);
    }

    #[test]
    fn vertical_bar_is_at_ninety_degrees() {
        let mut img = GrayImage::new(20, 40);
        draw_rect(&mut img, 8, 5, 3, 25);
        let e = find_blobs(&img)[0].ellipse();
        assert!((e.angle - 90.0).abs() < 1e-6);
    }

    #[test]
    fn ellipse_mask_covers_its_center_only() {
        let e = Ellipse {
            center: (10.0, 10.0),
            major: 10.0,
            minor: 4.0,
            angle: 0.0,
        };
        let mask = ellipse_mask(20, 20, &e);
        assert_eq!(mask.get_pixel(10, 10)[0], 255);
        assert_eq!(mask.get_pixel(14, 10)[0], 255);
        assert_eq!(mask.get_pixel(10, 14)[0], 0);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
    }
}
