mod frames;
mod overlay;

use anyhow::{bail, Context};
use docopt::Docopt;
use ethoscope::core_modules::hardware::HardwareConnection;
use ethoscope::{spawn_capture, Drawer, ExperimentConfig, Monitor, ResultWriter};
use frames::ImageDirSource;
use log::info;
use overlay::OverlayDrawer;
use serde::Deserialize;
use std::fs::File;
use std::io::Write;

const USAGE: &str = "
Tracks a directory of frames with the ethoscope core.

Usage:
  ethoscope_runner <config> <frames> [options]
  ethoscope_runner (--version | -v)
  ethoscope_runner (--help | -h)

Options:
    -o, --output FILE         Write JSON-lines results to FILE instead of stdout.
    --fps FPS                 Frame rate of the image sequence [default: 10].
    --overlay-dir DIR         Save annotated frames to DIR.
    --overlay-every N         Annotate one frame out of N [default: 50].
    --hardware-log FILE       Write stimulator instructions to FILE.
    --version, -v             Show tool version.
    --help, -h                Show this screen.
";

#[derive(Debug, Deserialize)]
struct Args {
    arg_config: String,
    arg_frames: String,
    flag_output: Option<String>,
    flag_fps: f64,
    flag_overlay_dir: Option<String>,
    flag_overlay_every: u64,
    flag_hardware_log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_NAME").to_string() + ", version: " + env!("CARGO_PKG_VERSION");
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .map(|d| d.help(true))
        .map(|d| d.version(Some(version)))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    // --- 1. Configuration ---
    let config = ExperimentConfig::from_path(&args.arg_config)
        .with_context(|| format!("loading experiment configuration {}", args.arg_config))?;

    // --- 2. Frame Source & ROIs ---
    let source = ImageDirSource::new(&args.arg_frames, args.flag_fps)
        .with_context(|| format!("listing frames in {}", args.arg_frames))?;
    let Some(reference) = source.reference()? else {
        bail!("no frames found in {}", args.arg_frames);
    };
    info!("{} frames of {}x{}", source.len(), reference.width(), reference.height());
    let rois = config.build_rois(&reference)?;

    // --- 3. Hardware ---
    let mut connection = match &config.stimulator {
        Some(stimulator) => {
            let port: Box<dyn Write + Send> = match &args.flag_hardware_log {
                Some(path) => Box::new(File::create(path).with_context(|| format!("creating {}", path))?),
                None => Box::new(std::io::sink()),
            };
            Some(HardwareConnection::new(stimulator.hardware_interface(), port))
        }
        None => None,
    };

    // --- 4. Monitor & Outputs ---
    let units = config.build_tracking_units(rois, connection.as_ref().map(|c| c.handle()))?;
    let mut monitor = Monitor::new(units, config.parallel_rois)?;

    let out: Box<dyn Write + Send> = match &args.flag_output {
        Some(path) => Box::new(File::create(path).with_context(|| format!("creating {}", path))?),
        None => Box::new(std::io::stdout()),
    };
    let mut writer = ResultWriter::new(out, config.dam_period_ms);

    let mut overlay = match &args.flag_overlay_dir {
        Some(dir) => Some(OverlayDrawer::new(dir, args.flag_overlay_every)?),
        None => None,
    };

    let stop = monitor.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping after the current frame");
            stop.stop();
        }
    });

    // --- 5. Run ---
    let (frames, capture) = spawn_capture(source);
    let outcome = monitor
        .run(frames, &mut writer, overlay.as_mut().map(|o| o as &mut dyn Drawer))
        .await;
    capture.stop();
    if let Some(connection) = connection.as_mut() {
        connection.stop();
    }

    let outcome = outcome?;
    info!(
        "Run ended ({:?}) at frame {}, {:.1} s into the experiment",
        outcome,
        monitor.last_frame_idx(),
        monitor.last_time_stamp()
    );
    Ok(())
}
