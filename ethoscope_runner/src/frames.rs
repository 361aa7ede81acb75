//! A directory of still images played back as a camera.

use ethoscope::error::CaptureError;
use ethoscope::{Frame, FrameSource};
use image::GrayImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];

/// Frames are the image files of a directory in file name order, spaced by `1000 / fps` ms.
#[derive(Debug)]
pub struct ImageDirSource {
    paths: VecDeque<PathBuf>,
    interval_ms: f64,
    next_idx: u64,
}

impl ImageDirSource {
    pub fn new<P: AsRef<Path>>(dir: P, fps: f64) -> Result<Self, CaptureError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        Ok(Self {
            paths: paths.into(),
            interval_ms: 1000.0 / fps.max(f64::MIN_POSITIVE),
            next_idx: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The first frame, without consuming it. ROIs are built against it.
    pub fn reference(&self) -> Result<Option<GrayImage>, CaptureError> {
        self.paths.front().map(|p| load(p)).transpose()
    }
}

fn load(path: &Path) -> Result<GrayImage, CaptureError> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|source| CaptureError::Frame {
            path: path.display().to_string(),
            source,
        })
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(path) = self.paths.pop_front() else {
            return Ok(None);
        };
        let idx = self.next_idx;
        self.next_idx += 1;
        Ok(Some(Frame {
            idx,
            t_ms: (idx as f64 * self.interval_ms).round() as i64,
            image: load(&path)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ethoscope_runner_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn plays_images_in_name_order() {
        let dir = scratch_dir("order");
        for (name, level) in [("b.png", 20u8), ("a.png", 10), ("c.png", 30)] {
            GrayImage::from_pixel(4, 3, Luma([level])).save(dir.join(name)).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "not a frame").unwrap();

        let mut source = ImageDirSource::new(&dir, 25.0).unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(source.reference().unwrap().unwrap().get_pixel(0, 0)[0], 10);

        let mut seen = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            seen.push((frame.idx, frame.t_ms, frame.image.get_pixel(0, 0)[0]));
        }
        assert_eq!(seen, vec![(0, 0, 10), (1, 40, 20), (2, 80, 30)]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unreadable_frames_are_capture_errors() {
        let dir = scratch_dir("broken");
        std::fs::write(dir.join("0.png"), b"definitely not a png").unwrap();
        let mut source = ImageDirSource::new(&dir, 10.0).unwrap();
        assert!(matches!(source.next_frame(), Err(CaptureError::Frame { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
