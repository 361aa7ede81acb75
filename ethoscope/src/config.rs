//! Experiment configuration.
//!
//! One JSON document describes a whole session: the tracker, an optional
//! stimulator applied to every ROI, explicit ROIs (or none for the whole
//! frame), the inference and history windows, and a few runtime switches.
//! Kinds are resolved by name when the document is parsed, and everything
//! that could fail later (date ranges, programs, parameter ranges) is checked
//! by `validate` so that a bad configuration is rejected before the first
//! frame.
//!
//! ```json
//! {
//!   "tracker": { "kind": "AdaptiveBGModel" },
//!   "stimulator": {
//!     "kind": "RobustSleepDepriver",
//!     "date_range": "2024-05-01 09:00:00 > 2024-05-03 09:00:00",
//!     "min_inactive_time": 20
//!   },
//!   "rois": [ { "idx": 1, "polygon": [[0, 0], [0, 40], [200, 40], [200, 0]] } ],
//!   "max_inference_ms": 30000,
//!   "parallel_rois": true
//! }
//! ```

use crate::core_modules::hardware::HardwareHandle;
use crate::core_modules::roi::Roi;
use crate::core_modules::roi_builder::{DefaultRoiBuilder, ManualRoiBuilder, RoiBuilder, RoiSpec};
use crate::core_modules::stimulators::kinds::StimulatorConfig;
use crate::core_modules::tracker::TrackerConfig;
use crate::core_modules::tracking_unit::{TrackingLimits, TrackingUnit};
use crate::error::ConfigError;
use crate::monitor;
use image::GrayImage;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub tracker: TrackerConfig,
    pub stimulator: Option<StimulatorConfig>,
    /// Explicit ROIs. Empty means a single ROI covering the whole frame.
    pub rois: Vec<RoiSpec>,
    #[serde(flatten)]
    pub limits: TrackingLimits,
    /// Track ROIs on a thread pool instead of one after the other.
    pub parallel_rois: bool,
    /// Period of the DAM-style activity summary, disabled when absent.
    pub dam_period_ms: Option<i64>,
}

impl ExperimentConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let document: Value = serde_json::from_str(json)?;
        let config: Self = serde_json::from_value(document.clone())?;

        // flattened sections swallow unknown keys, so compare against what was understood
        let mut unknown = Vec::new();
        unknown_keys(&document, &serde_json::to_value(&config)?, "", &mut unknown);
        if let Some(key) = unknown.into_iter().next() {
            return Err(ConfigError::parameter(key, "unknown parameter"));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        info!("Loading experiment configuration from {}", path.as_ref().display());
        Self::from_json_str(&text)
    }

    /// Checks everything that can be checked without a reference frame.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_inference_ms < 0 {
            return Err(ConfigError::parameter("max_inference_ms", "must not be negative"));
        }
        if self.limits.max_history_ms <= 0 {
            return Err(ConfigError::parameter("max_history_ms", "must be positive"));
        }
        if matches!(self.dam_period_ms, Some(p) if p <= 0) {
            return Err(ConfigError::parameter("dam_period_ms", "must be positive"));
        }
        if let Some(stimulator) = &self.stimulator {
            // a throwaway build surfaces date range, program and parameter errors now
            stimulator.build(None)?;
        }
        Ok(())
    }

    pub fn roi_builder(&self) -> Box<dyn RoiBuilder> {
        if self.rois.is_empty() {
            Box::new(DefaultRoiBuilder)
        } else {
            Box::new(ManualRoiBuilder::new(self.rois.clone()))
        }
    }

    /// Builds the sorted ROIs for frames shaped like `reference`.
    pub fn build_rois(&self, reference: &GrayImage) -> Result<Vec<Arc<Roi>>, ConfigError> {
        let rois = self.roi_builder().build(reference)?;
        info!("Built {} ROIs", rois.len());
        Ok(rois.into_iter().map(Arc::new).collect())
    }

    /// One tracking unit per ROI, each with its own stimulator when one is configured.
    pub fn build_tracking_units(
        &self,
        rois: Vec<Arc<Roi>>,
        hardware: Option<HardwareHandle>,
    ) -> Result<Vec<TrackingUnit>, ConfigError> {
        let stimulators = match &self.stimulator {
            Some(cfg) => Some(
                rois.iter()
                    .map(|_| cfg.build(hardware.clone()))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };
        monitor::tracking_units(rois, &self.tracker, stimulators, self.limits)
    }
}

/// Collects the dotted paths of keys in `document` that `understood` does not have.
fn unknown_keys(document: &Value, understood: &Value, path: &str, out: &mut Vec<String>) {
    match (document, understood) {
        (Value::Object(given), Value::Object(known)) => {
            for (key, value) in given {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match known.get(key) {
                    Some(known_value) => unknown_keys(value, known_value, &child, out),
                    None => out.push(child),
                }
            }
        }
        (Value::Array(given), Value::Array(known)) => {
            for (i, (value, known_value)) in given.iter().zip(known).enumerate() {
                unknown_keys(value, known_value, &format!("{path}[{i}]"), out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::stimulators::kinds::StimulatorKind;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = ExperimentConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.tracker, TrackerConfig::default());
        assert!(cfg.stimulator.is_none());
        assert_eq!(cfg.limits, TrackingLimits::default());
        assert!(!cfg.parallel_rois);

        let rois = cfg.build_rois(&GrayImage::new(32, 16)).unwrap();
        assert_eq!(rois.len(), 1);
        assert_eq!(rois[0].rectangle(), (0, 0, 32, 16));
    }

    #[test]
    fn full_document() {
        let cfg = ExperimentConfig::from_json_str(
            r#"{
                "tracker": {"kind": "RichAdaptiveBGModel", "minimum_change": 5},
                "stimulator": {"kind": "RobustSleepDepriver", "min_inactive_time": 20, "window_policy": "KeepTimers"},
                "rois": [
                    {"idx": 2, "polygon": [[20, 0], [20, 9], [39, 9], [39, 0]]},
                    {"idx": 1, "polygon": [[0, 0], [0, 9], [19, 9], [19, 0]]}
                ],
                "max_inference_ms": 5000,
                "parallel_rois": true,
                "dam_period_ms": 60000
            }"#,
        )
        .unwrap();
        assert!(matches!(cfg.tracker, TrackerConfig::RichAdaptiveBg { minimum_change: 5, .. }));
        assert_eq!(cfg.limits.max_inference_ms, 5000);
        assert_eq!(cfg.limits.max_history_ms, TrackingLimits::default().max_history_ms);
        assert_eq!(cfg.stimulator.as_ref().map(|s| s.kind), Some(StimulatorKind::RobustSleepDepriver));

        let rois = cfg.build_rois(&GrayImage::new(40, 10)).unwrap();
        assert_eq!(rois.iter().map(|r| r.idx()).collect::<Vec<_>>(), vec![1, 2]);
        let units = cfg.build_tracking_units(rois, None).unwrap();
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        assert!(matches!(
            ExperimentConfig::from_json_str(r#"{"tracker": {"kind": "MagicTracker"}}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn bad_schedules_fail_at_load_time() {
        let err = ExperimentConfig::from_json_str(
            r#"{"stimulator": {"kind": "RobustSleepDepriver", "date_range": "2024-01-02 00:00:00 > 2024-01-01 00:00:00"}}"#,
        );
        assert!(matches!(err, Err(ConfigError::Schedule(_))));
    }

    #[test]
    fn misspelled_keys_are_rejected() {
        let err = ExperimentConfig::from_json_str(
            r#"{"stimulator": {"kind": "RobustSleepDepriver", "min_inactive_tim": 20}}"#,
        )
        .unwrap_err();
        match err {
            ConfigError::InvalidParameter { name, .. } => assert_eq!(name, "stimulator.min_inactive_tim"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(ExperimentConfig::from_json_str(r#"{"parralel_rois": true}"#).is_err());
        assert!(ExperimentConfig::from_json_str(r#"{"max_inferense_ms": 10}"#).is_err());
        assert!(ExperimentConfig::from_json_str(r#"{"tracker": {"kind": "AdaptiveBGModel", "treshold": 3}}"#).is_err());
        assert!(ExperimentConfig::from_json_str(
            r#"{"rois": [{"idx": 1, "polygon": [[0, 0], [0, 9], [9, 9], [9, 0]], "valeu": 2}]}"#
        )
        .is_err());
    }

    #[test]
    fn bad_limits_fail_at_load_time() {
        assert!(ExperimentConfig::from_json_str(r#"{"max_history_ms": 0}"#).is_err());
        assert!(ExperimentConfig::from_json_str(r#"{"dam_period_ms": -5}"#).is_err());
    }
}
