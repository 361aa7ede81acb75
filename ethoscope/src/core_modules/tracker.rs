// THEORY:
// The tracker is the heart of the per-ROI analysis. Given the masked image of
// one tube and a timestamp, it either reports where the animal is, or says
// that it could not find it. Not finding the animal is an expected outcome
// (the fly hides under the food, or two specks of dust look alike) and is
// reported as `Ok(None)`; only genuinely unexpected conditions are errors.
//
// Key architectural principles:
// 1.  **Explicit State**: The locator itself is immutable configuration. All
//     memory (background model, last centroid, last foreground) lives in a
//     `LocatorState` value owned by the tracking unit and passed in on every
//     call. This keeps the algorithm testable frame by frame.
// 2.  **Adaptive Background Subtraction**: The animal is darker than the
//     arena. Foreground is `background - frame`, thresholded to zero below a
//     fixed contrast. The background learns continuously, faster when the
//     animal is lost, slower when it is found, and never under the animal.
// 3.  **Unambiguous or Nothing**: Exactly one animal-sized component must
//     remain after filtering. Zero or several components are treated as "not
//     found" and the tracking unit falls back to inference.
// 4.  **Log Distance Convention**: Displacement is reported as
//     `round(log10(1/W + d/W) * 1000)` with `W` the longest side of the ROI
//     image, so that "did not move" maps to the constant
//     `round(log10(1/W) * 1000)`. Downstream analysis compares against this
//     constant, so the formula must not change.

use crate::core_modules::background_model::BackgroundModel;
use crate::core_modules::blob_detector::{blob_detector, Blob, Ellipse};
use crate::core_modules::variables::{DataPoint, Variable, VariableKind};
use crate::error::TrackingError;
use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

/// The "did not move" value of `xy_dist_log10x1000` for an ROI image of longest side `width`.
pub fn null_distance(width: u32) -> i64 {
    ((1.0 / width as f64).log10() * 1000.0).round() as i64
}

/// Log-scaled displacement of `distance` pixels in an ROI image of longest side `width`.
pub fn log_distance(distance: f64, width: u32) -> i64 {
    let w = width as f64;
    ((1.0 / w + distance / w).log10() * 1000.0).round() as i64
}

/// Tunables of the adaptive background model tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveBgParams {
    /// Minimum darkening, in grey levels, for a pixel to count as foreground.
    pub foreground_threshold: u8,
    /// Smallest accepted animal, as a fraction of the ROI area.
    pub min_area_ratio: f64,
    /// Largest accepted animal, as a fraction of the ROI area.
    pub max_area_ratio: f64,
    pub min_half_life_ms: f64,
    pub max_half_life_ms: f64,
    pub learning_rate_increment: f64,
    /// Gaussian smoothing applied to both the frame and the learned background
    /// before subtraction. Off by default: the foreground threshold is tuned
    /// for raw grey levels, and blurring spreads the animal into a halo.
    pub blur_sigma: f32,
}

impl Default for AdaptiveBgParams {
    fn default() -> Self {
        Self {
            foreground_threshold: 20,
            min_area_ratio: 0.002,
            max_area_ratio: 0.2,
            min_half_life_ms: 1_000.0,
            max_half_life_ms: 100_000.0,
            learning_rate_increment: 1.2,
            blur_sigma: 0.0,
        }
    }
}

/// Tracker kinds, selected by name in the experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TrackerConfig {
    #[serde(rename = "AdaptiveBGModel")]
    AdaptiveBg {
        #[serde(flatten)]
        params: AdaptiveBgParams,
    },
    /// Adds a `body_movement` variable measuring pixel changes within the animal's ellipse.
    #[serde(rename = "RichAdaptiveBGModel")]
    RichAdaptiveBg {
        #[serde(flatten)]
        params: AdaptiveBgParams,
        #[serde(default = "default_minimum_change")]
        minimum_change: u8,
    },
}

fn default_minimum_change() -> u8 {
    10
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig::AdaptiveBg {
            params: AdaptiveBgParams::default(),
        }
    }
}

impl TrackerConfig {
    pub fn build(&self) -> Locator {
        match self {
            TrackerConfig::AdaptiveBg { params } => Locator::new(params.clone()),
            TrackerConfig::RichAdaptiveBg { params, minimum_change } => {
                Locator::with_body_movement(params.clone(), *minimum_change)
            }
        }
    }
}

/// Everything a locator remembers about one ROI between frames.
#[derive(Debug, Clone)]
pub struct LocatorState {
    background: BackgroundModel,
    last_centroid: Option<(f64, f64)>,
    /// Foreground of the last detection, masked by its ellipse.
    last_body: Option<GrayImage>,
}

impl LocatorState {
    pub fn has_background(&self) -> bool {
        self.background.is_initialised()
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }
}

/// A localisation strategy. The strategy is immutable; everything it learns
/// between frames lives in its `State`, owned by the caller.
pub trait Locate: Send + Sync + std::fmt::Debug {
    type State: Send + std::fmt::Debug;

    fn initial_state(&self) -> Self::State;

    /// Locates the animal in `image` (already cropped to the ROI and masked by `mask`).
    ///
    /// Returns `Ok(None)` when no animal could be found on this frame, which
    /// lets the tracking unit fall back to the last known position. `Ok(Some)`
    /// with an empty list states that there is nothing to track and is
    /// recorded as such, without inference.
    fn locate(
        &self,
        state: &mut Self::State,
        image: &GrayImage,
        mask: &GrayImage,
        t: i64,
    ) -> Result<Option<Vec<DataPoint>>, TrackingError>;
}

/// Adaptive background subtraction locator for one animal per ROI.
#[derive(Debug, Clone, PartialEq)]
pub struct Locator {
    params: AdaptiveBgParams,
    /// `Some(minimum_change)` when body movement is computed.
    body_movement: Option<u8>,
}

impl Locator {
    pub fn new(params: AdaptiveBgParams) -> Self {
        Self {
            params,
            body_movement: None,
        }
    }

    pub fn with_body_movement(params: AdaptiveBgParams, minimum_change: u8) -> Self {
        Self {
            params,
            body_movement: Some(minimum_change),
        }
    }
}

impl Locate for Locator {
    type State = LocatorState;

    fn initial_state(&self) -> LocatorState {
        LocatorState {
            background: BackgroundModel::new(
                self.params.min_half_life_ms,
                self.params.max_half_life_ms,
                self.params.learning_rate_increment,
            ),
            last_centroid: None,
            last_body: None,
        }
    }

    /// Zero or several animal-sized components both count as not found.
    fn locate(
        &self,
        state: &mut LocatorState,
        image: &GrayImage,
        mask: &GrayImage,
        t: i64,
    ) -> Result<Option<Vec<DataPoint>>, TrackingError> {
        if image.dimensions() != mask.dimensions() {
            return Err(TrackingError::DimensionMismatch {
                expected: mask.dimensions(),
                actual: image.dimensions(),
            });
        }

        let grey = self.preprocess(image, mask);

        let background = match state.background.background() {
            Some(bg) if bg.dimensions() == grey.dimensions() => bg,
            _ => {
                state.background.update(&grey, t, None)?;
                return Ok(None);
            }
        };

        let foreground = self.foreground(&grey, &background, mask);
        let roi_area = mask.pixels().filter(|p| p[0] > 0).count() as f64;
        let min_area = self.params.min_area_ratio * roi_area;
        let max_area = self.params.max_area_ratio * roi_area;

        let mut candidates: Vec<Blob> = blob_detector::find_blobs(&foreground)
            .into_iter()
            .filter(|b| {
                let area = b.area() as f64;
                area >= min_area && area <= max_area
            })
            .collect();

        if candidates.is_empty() {
            state.background.increase_learning_rate();
            state.background.update(&grey, t, None)?;
            return Ok(None);
        }
        if candidates.len() > 1 {
            state.background.update(&grey, t, Some(&foreground))?;
            return Ok(None);
        }

        let blob = candidates.remove(0);
        let ellipse = blob.ellipse();
        let w_im = grey.width().max(grey.height());

        let distance = match state.last_centroid {
            Some((x, y)) => ((blob.centroid.0 - x).powi(2) + (blob.centroid.1 - y).powi(2)).sqrt(),
            None => 0.0,
        };
        state.last_centroid = Some(blob.centroid);

        let mut point = DataPoint::new(vec![
            Variable::int(VariableKind::X, blob.centroid.0.round() as i64),
            Variable::int(VariableKind::Y, blob.centroid.1.round() as i64),
            Variable::int(VariableKind::Width, ellipse.major.round() as i64),
            Variable::int(VariableKind::Height, ellipse.minor.round() as i64),
            Variable::int(VariableKind::Phi, (ellipse.angle.round() as i64) % 180),
            Variable::int(VariableKind::XyDistLog10x1000, log_distance(distance, w_im)),
        ]);

        if let Some(minimum_change) = self.body_movement {
            let movement = self.body_movement(state, &grey, &ellipse, minimum_change, w_im);
            point.append(Variable::int(VariableKind::BodyMovement, movement));
        }

        state.background.decrease_learning_rate();
        state.background.update(&grey, t, Some(&foreground))?;

        Ok(Some(vec![point]))
    }
}

impl Locator {
    fn preprocess(&self, image: &GrayImage, mask: &GrayImage) -> GrayImage {
        let masked = GrayImage::from_fn(image.width(), image.height(), |x, y| {
            if mask.get_pixel(x, y)[0] > 0 {
                *image.get_pixel(x, y)
            } else {
                Luma([0])
            }
        });
        if self.params.blur_sigma > 0.0 {
            image::imageops::blur(&masked, self.params.blur_sigma)
        } else {
            masked
        }
    }

    fn foreground(&self, grey: &GrayImage, background: &GrayImage, mask: &GrayImage) -> GrayImage {
        let threshold = self.params.foreground_threshold;
        GrayImage::from_fn(grey.width(), grey.height(), |x, y| {
            if mask.get_pixel(x, y)[0] == 0 {
                return Luma([0]);
            }
            let diff = background.get_pixel(x, y)[0].saturating_sub(grey.get_pixel(x, y)[0]);
            if diff < threshold {
                Luma([0])
            } else {
                Luma([diff])
            }
        })
    }

    /// Grey pixels inside the animal's ellipse that changed by more than
    /// `minimum_change` since the previous detection.
    fn body_movement(
        &self,
        state: &mut LocatorState,
        grey: &GrayImage,
        ellipse: &Ellipse,
        minimum_change: u8,
        w_im: u32,
    ) -> i64 {
        let (width, height) = grey.dimensions();
        let new_ellipse = blob_detector::ellipse_mask(width, height, ellipse);
        let new_body = masked_and(grey, &new_ellipse);

        let movement = match &state.last_body {
            Some(old_body) if old_body.dimensions() == new_body.dimensions() => old_body
                .pixels()
                .zip(new_body.pixels())
                .filter(|(a, b)| a[0].abs_diff(b[0]) > minimum_change)
                .count() as i64,
            _ => null_distance(w_im),
        };

        state.last_body = Some(new_body);
        movement
    }
}

fn masked_and(image: &GrayImage, mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if mask.get_pixel(x, y)[0] > 0 {
            *image.get_pixel(x, y)
        } else {
            Luma([0])
        }
    })
}
