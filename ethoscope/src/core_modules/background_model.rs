// THEORY:
// The `BackgroundModel` is the adaptive memory of what an ROI looks like
// without the animal in it. It is a per-pixel exponential moving average whose
// speed is expressed as a half-life in milliseconds, so that the amount of
// learning per update depends on the real time elapsed and not on the frame
// rate (frames can be dropped or subsampled).
//
// The learning rate is itself adaptive:
// - when the animal is found, the half-life grows (slower learning) so the
//   animal does not bleed into the background;
// - when it is lost, the half-life shrinks (faster learning) so a drifting
//   scene (light change, camera gain) is re-learned quickly.
//
// Pixels covered by the animal are excluded from each update.

use crate::error::TrackingError;
use image::{GrayImage, Luma};

#[derive(Debug, Clone)]
pub struct BackgroundModel {
    max_half_life_ms: f64,
    min_half_life_ms: f64,
    increment: f64,
    current_half_life_ms: f64,
    last_t: Option<i64>,
    width: u32,
    height: u32,
    mean: Option<Vec<f32>>,
}

impl BackgroundModel {
    pub fn new(min_half_life_ms: f64, max_half_life_ms: f64, increment: f64) -> Self {
        Self {
            max_half_life_ms,
            min_half_life_ms,
            increment,
            current_half_life_ms: min_half_life_ms,
            last_t: None,
            width: 0,
            height: 0,
            mean: None,
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.mean.is_some()
    }

    pub fn half_life_ms(&self) -> f64 {
        self.current_half_life_ms
    }

    /// Animal lost: learn faster.
    pub fn increase_learning_rate(&mut self) {
        self.current_half_life_ms = (self.current_half_life_ms / self.increment).max(self.min_half_life_ms);
    }

    /// Animal found: learn slower.
    pub fn decrease_learning_rate(&mut self) {
        self.current_half_life_ms = (self.current_half_life_ms * self.increment).min(self.max_half_life_ms);
    }

    /// Background rounded to 8 bits, `None` before the first update.
    pub fn background(&self) -> Option<GrayImage> {
        let mean = self.mean.as_ref()?;
        Some(GrayImage::from_fn(self.width, self.height, |x, y| {
            let v = mean[(y * self.width + x) as usize];
            Luma([v.round().clamp(0.0, 255.0) as u8])
        }))
    }

    /// Blends `image` into the background. Pixels where `exclude` is non-zero keep their value.
    pub fn update(&mut self, image: &GrayImage, t: i64, exclude: Option<&GrayImage>) -> Result<(), TrackingError> {
        if let Some(last) = self.last_t {
            if t < last {
                return Err(TrackingError::TimeReversal {
                    previous: last,
                    current: t,
                });
            }
        }

        let reseed = match &self.mean {
            None => true,
            Some(_) => self.width != image.width() || self.height != image.height(),
        };
        if reseed {
            self.width = image.width();
            self.height = image.height();
            self.mean = Some(image.pixels().map(|p| p[0] as f32).collect());
            self.last_t = Some(t);
            return Ok(());
        }

        if let Some(ex) = exclude {
            if ex.dimensions() != image.dimensions() {
                return Err(TrackingError::DimensionMismatch {
                    expected: image.dimensions(),
                    actual: ex.dimensions(),
                });
            }
        }

        let dt = (t - self.last_t.unwrap_or(t)) as f64;
        let alpha = (1.0 - (-std::f64::consts::LN_2 * dt / self.current_half_life_ms).exp()) as f32;
        self.last_t = Some(t);

        if let Some(mean) = self.mean.as_mut() {
            for (i, p) in image.pixels().enumerate() {
                if let Some(ex) = exclude {
                    if ex.as_raw()[i] > 0 {
                        continue;
                    }
                }
                mean[i] += alpha * (p[0] as f32 - mean[i]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_update_seeds_the_background() {
        let mut model = BackgroundModel::new(1_000.0, 100_000.0, 1.2);
        assert!(!model.is_initialised());
        model.update(&GrayImage::from_pixel(4, 4, Luma([80])), 0, None).unwrap();
        assert_eq!(model.background().unwrap().get_pixel(1, 1)[0], 80);
    }

    #[test]
    fn one_half_life_moves_half_way() {
        let mut model = BackgroundModel::new(1_000.0, 100_000.0, 1.2);
        model.update(&GrayImage::from_pixel(2, 2, Luma([100])), 0, None).unwrap();
        model.update(&GrayImage::from_pixel(2, 2, Luma([200])), 1_000, None).unwrap();
        assert_eq!(model.background().unwrap().get_pixel(0, 0)[0], 150);
    }

    #[test]
    fn excluded_pixels_are_not_learned() {
        let mut model = BackgroundModel::new(1_000.0, 100_000.0, 1.2);
        model.update(&GrayImage::from_pixel(2, 1, Luma([100])), 0, None).unwrap();
        let mut exclude = GrayImage::new(2, 1);
        exclude.put_pixel(0, 0, Luma([255]));
        model
            .update(&GrayImage::from_pixel(2, 1, Luma([0])), 10_000, Some(&exclude))
            .unwrap();
        let bg = model.background().unwrap();
        assert_eq!(bg.get_pixel(0, 0)[0], 100);
        assert!(bg.get_pixel(1, 0)[0] < 5);
    }

    #[test]
    fn learning_rate_is_clamped() {
        let mut model = BackgroundModel::new(1_000.0, 2_000.0, 1.5);
        for _ in 0..10 {
            model.decrease_learning_rate();
        }
        assert_eq!(model.half_life_ms(), 2_000.0);
        for _ in 0..10 {
            model.increase_learning_rate();
        }
        assert_eq!(model.half_life_ms(), 1_000.0);
    }

    #[test]
    fn rejects_time_going_backwards() {
        let mut model = BackgroundModel::new(1_000.0, 2_000.0, 1.5);
        let img = GrayImage::new(2, 2);
        model.update(&img, 500, None).unwrap();
        assert!(model.update(&img, 100, None).is_err());
    }
}
