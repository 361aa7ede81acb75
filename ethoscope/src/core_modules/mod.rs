// Building blocks of the tracking core, roughly in data-flow order: frames
// come in, are cut into ROIs, located, accumulated per animal, acted upon and
// written out.

pub mod frame_source;
pub mod roi;
pub mod roi_builder;
pub mod background_model;
pub mod blob_detector;
pub mod tracker;
pub mod variables;
pub mod tracking_unit;
pub mod scheduler;
pub mod stimulators;
pub mod hardware;
pub mod result_writer;
