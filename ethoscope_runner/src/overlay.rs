//! Annotated snapshots of the tracking: ROI outlines and animal positions
//! drawn over the greyscale frame, saved as PNG every few frames.

use ethoscope::{DataPoint, Drawer, Frame, Roi, VariableKind};
use image::{ImageEncoder, Rgb, RgbImage};
use log::warn;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

const ROI_COLOUR: Rgb<u8> = Rgb([255, 0, 0]);
const FOUND_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);
const INFERRED_COLOUR: Rgb<u8> = Rgb([255, 255, 0]);

pub struct OverlayDrawer {
    dir: PathBuf,
    every: u64,
}

impl OverlayDrawer {
    pub fn new<P: Into<PathBuf>>(dir: P, every: u64) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            every: every.max(1),
        })
    }

    fn save(&self, name: String, image: &RgbImage) -> Result<(), image::ImageError> {
        let output = std::fs::File::create(self.dir.join(name))?;
        let encoder = image::codecs::png::PngEncoder::new(output);
        encoder.write_image(image.as_raw(), image.width(), image.height(), image::ExtendedColorType::Rgb8)?;
        Ok(())
    }
}

/// Paints the frame, ROI outlines and a marker at every position.
pub fn render(frame: &Frame, rois: &[Arc<Roi>], positions: &BTreeMap<u32, Vec<DataPoint>>) -> RgbImage {
    let mut out = RgbImage::from_fn(frame.image.width(), frame.image.height(), |x, y| {
        let v = frame.image.get_pixel(x, y)[0];
        Rgb([v, v, v])
    });

    for roi in rois {
        let (x, y, w, h) = roi.rectangle();
        outline(&mut out, x, y, w, h, ROI_COLOUR);
    }

    for point in positions.values().flatten() {
        let (Some(x), Some(y)) = (point.get(VariableKind::X), point.get(VariableKind::Y)) else {
            continue;
        };
        let colour = if point.is_inferred() {
            INFERRED_COLOUR
        } else {
            FOUND_COLOUR
        };
        cross(&mut out, x.as_i64(), y.as_i64(), 3, colour);
    }
    out
}

fn outline(img: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, colour: Rgb<u8>) {
    let (x1, y1) = ((x + w).saturating_sub(1), (y + h).saturating_sub(1));
    for px in x..=x1 {
        put(img, px as i64, y as i64, colour);
        put(img, px as i64, y1 as i64, colour);
    }
    for py in y..=y1 {
        put(img, x as i64, py as i64, colour);
        put(img, x1 as i64, py as i64, colour);
    }
}

fn cross(img: &mut RgbImage, cx: i64, cy: i64, arm: i64, colour: Rgb<u8>) {
    for d in -arm..=arm {
        put(img, cx + d, cy, colour);
        put(img, cx, cy + d, colour);
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, colour: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, colour);
    }
}

impl Drawer for OverlayDrawer {
    fn draw(&mut self, frame: &Frame, rois: &[Arc<Roi>], positions: &BTreeMap<u32, Vec<DataPoint>>) {
        if frame.idx % self.every != 0 {
            return;
        }
        let image = render(frame, rois, positions);
        let name = format!("frame_{:06}.png", frame.idx);
        if let Err(e) = self.save(name, &image) {
            warn!("could not save overlay for frame {}: {}", frame.idx, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethoscope::core_modules::variables::Variable;
    use image::GrayImage;

    #[test]
    fn draws_rois_and_positions() {
        let frame = Frame {
            idx: 0,
            t_ms: 0,
            image: GrayImage::new(40, 20),
        };
        let rois = vec![Arc::new(Roi::from_rectangle(0, 0, 20, 20, 1).unwrap())];
        let mut positions = BTreeMap::new();
        positions.insert(
            1,
            vec![DataPoint::new(vec![
                Variable::int(VariableKind::X, 10),
                Variable::int(VariableKind::Y, 10),
                Variable::boolean(VariableKind::IsInferred, false),
            ])],
        );

        let out = render(&frame, &rois, &positions);
        assert_eq!(*out.get_pixel(0, 5), ROI_COLOUR);
        assert_eq!(*out.get_pixel(19, 5), ROI_COLOUR);
        assert_eq!(*out.get_pixel(10, 10), FOUND_COLOUR);
        assert_eq!(*out.get_pixel(13, 10), FOUND_COLOUR);
        assert_eq!(*out.get_pixel(30, 10), Rgb([0, 0, 0]));
    }
}
