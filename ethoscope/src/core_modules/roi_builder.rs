//! Producing the list of ROIs for an experiment.
//!
//! Automatic arena detection lives outside the core; the builders here either
//! cover the whole frame or take explicit polygons from the configuration.
//! Whatever produced them, ROIs come out sorted: by `value` when every ROI has
//! one, otherwise left to right then top to bottom, so that the `idx` a user
//! sees matches the physical layout of the arena.

use crate::core_modules::roi::Roi;
use crate::error::ConfigError;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub trait RoiBuilder: Send + Sync {
    fn build(&self, reference: &GrayImage) -> Result<Vec<Roi>, ConfigError>;
}

/// A single ROI spanning the whole reference frame, with idx 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRoiBuilder;

impl RoiBuilder for DefaultRoiBuilder {
    fn build(&self, reference: &GrayImage) -> Result<Vec<Roi>, ConfigError> {
        Ok(vec![Roi::from_rectangle(0, 0, reference.width(), reference.height(), 1)?])
    }
}

/// One ROI as written in an experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiSpec {
    pub idx: u32,
    pub polygon: Vec<(i32, i32)>,
    #[serde(default)]
    pub value: Option<f64>,
}

/// ROIs given explicitly as polygons.
#[derive(Debug, Clone, Default)]
pub struct ManualRoiBuilder {
    specs: Vec<RoiSpec>,
}

impl ManualRoiBuilder {
    pub fn new(specs: Vec<RoiSpec>) -> Self {
        Self { specs }
    }
}

impl RoiBuilder for ManualRoiBuilder {
    fn build(&self, reference: &GrayImage) -> Result<Vec<Roi>, ConfigError> {
        let mut rois = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            if rois.iter().any(|r: &Roi| r.idx() == spec.idx) {
                return Err(ConfigError::InvalidRoi {
                    idx: spec.idx,
                    reason: "duplicate ROI index".to_string(),
                });
            }
            let roi = Roi::new(spec.polygon.clone(), spec.idx, spec.value)?;
            let (x, y, w, h) = roi.rectangle();
            if x + w > reference.width() || y + h > reference.height() {
                return Err(ConfigError::InvalidRoi {
                    idx: spec.idx,
                    reason: format!(
                        "does not fit in the {}x{} frame",
                        reference.width(),
                        reference.height()
                    ),
                });
            }
            rois.push(roi);
        }
        sort_rois(&mut rois);
        Ok(rois)
    }
}

/// Sorts by `value` if every ROI has one, else by bounding box position.
pub fn sort_rois(rois: &mut [Roi]) {
    if !rois.is_empty() && rois.iter().all(|r| r.value().is_some()) {
        rois.sort_by(|a, b| {
            a.value()
                .partial_cmp(&b.value())
                .unwrap_or(Ordering::Equal)
        });
    } else {
        rois.sort_by_key(|r| {
            let (x, y, _, _) = r.rectangle();
            (x, y)
        });
    }
}
