// THEORY:
// This file is the entry point of the `ethoscope` library crate: the real-time
// tracking core of an ethoscope device. It follows the standard Rust
// convention of using `lib.rs` to define the public API exposed to binaries
// such as `ethoscope_runner`.
//
// The high-level interface is the `Monitor` fed by a frame stream, built from
// an `ExperimentConfig`. The building blocks (ROIs, the adaptive background
// tracker, tracking units, stimulators, schedulers, the hardware instruction
// queue and the result writers) live in `core_modules` and are public so that
// embedders can assemble a session by hand when a JSON document is not
// convenient.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod monitor;

pub use config::ExperimentConfig;
pub use core_modules::frame_source::{spawn_capture, CaptureHandle, Frame, FrameSource, VecSource};
pub use core_modules::result_writer::{MemorySink, ResultSink, ResultWriter};
pub use core_modules::roi::Roi;
pub use core_modules::variables::{DataPoint, VariableKind};
pub use error::{EthoscopeError, Result};
pub use monitor::{Drawer, Monitor, MonitorStatus, RunOutcome, StopHandle};
