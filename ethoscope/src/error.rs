//! Error types for the ethoscope tracking core.
//!
//! Failures are split by where they surface: configuration and schedule
//! errors are fatal at startup, tracking and stimulator errors are isolated
//! to one ROI for one frame, hardware and sink errors belong to the
//! collaborators the core hands work to.

use thiserror::Error;

/// Result type alias for the ethoscope core.
pub type Result<T> = std::result::Result<T, EthoscopeError>;

/// Malformed date-range or segmented program strings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("invalid date range '{range}': {reason}")]
    DateRange { range: String, reason: String },

    #[error("invalid program '{program}': {reason}")]
    Program { program: String, reason: String },
}

impl ScheduleError {
    pub fn date_range<S: Into<String>, R: Into<String>>(range: S, reason: R) -> Self {
        Self::DateRange {
            range: range.into(),
            reason: reason.into(),
        }
    }

    pub fn program<S: Into<String>, R: Into<String>>(program: S, reason: R) -> Self {
        Self::Program {
            program: program.into(),
            reason: reason.into(),
        }
    }
}

/// Invalid experiment configuration detected while building the session.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid ROI {idx}: {reason}")]
    InvalidRoi { idx: u32, reason: String },

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("expected one stimulator per ROI, got {stimulators} stimulators for {rois} ROIs")]
    StimulatorCount { rois: usize, stimulators: usize },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn parameter<S: Into<String>, R: Into<String>>(name: S, reason: R) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Unexpected failures while locating an animal. "No animal found" is not an
/// error; locators report it as `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    #[error("sub image is {actual:?} but the ROI mask is {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("ROI {idx} lies outside the {width}x{height} frame")]
    RoiOutsideFrame { idx: u32, width: u32, height: u32 },

    #[error("timestamps must not go backwards: {previous} ms then {current} ms")]
    TimeReversal { previous: i64, current: i64 },
}

/// Failures while deciding whether to stimulate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StimulatorError {
    #[error("this stimulator can only work with a single animal per ROI, found {0}")]
    MultipleAnimals(usize),

    #[error("data point is missing variable '{0}'")]
    MissingVariable(&'static str),
}

/// Failures while turning a stimulus into a hardware instruction.
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("instruction for {interface} needs parameter '{param}'")]
    MissingParameter {
        interface: &'static str,
        param: &'static str,
    },

    #[error("hardware connection is closed")]
    Disconnected,
}

/// Failures of the frame source collaborator.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("could not read frame {path}: {source}")]
    Frame {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the result sink collaborator.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("result writer is closed")]
    Closed,

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top level error of the crate.
#[derive(Error, Debug)]
pub enum EthoscopeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error(transparent)]
    Stimulator(#[from] StimulatorError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}
