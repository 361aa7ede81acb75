// THEORY:
// The `Monitor` is the conductor of a tracking session. It pulls frames from
// the capture stream one at a time, hands the same frame to every tracking
// unit, and forwards what they produce to the result sink and, optionally, a
// drawer.
//
// Key architectural principles:
// 1.  **One Frame at a Time**: a frame is fully processed (every ROI tracked,
//     every row written, the sink flushed) before the next one is pulled. The
//     capture side blocks on its single slot in the meantime, so there is
//     never a backlog to catch up with.
// 2.  **Per-ROI Isolation**: an unexpected failure in one ROI is logged with
//     the ROI index and timestamp and that ROI is skipped for the frame. The
//     other animals are unaffected. Only capture and sink failures end a run.
// 3.  **Optional Data Parallelism**: units share nothing mutable, so with
//     `parallel_rois` they are tracked on a rayon pool sized to the machine.
//     Results are collected back in ROI order before anything is written.
// 4.  **Cooperative Stop**: `StopHandle::stop` raises a `watch` flag that
//     the loop observes between frames, including while it is waiting for
//     the next one.

use crate::core_modules::frame_source::Frame;
use crate::core_modules::result_writer::ResultSink;
use crate::core_modules::roi::Roi;
use crate::core_modules::stimulators::Stimulator;
use crate::core_modules::tracker::TrackerConfig;
use crate::core_modules::tracking_unit::{TrackingLimits, TrackingUnit};
use crate::core_modules::variables::{DataPoint, Variable, VariableKind};
use crate::error::{CaptureError, ConfigError, EthoscopeError, TrackingError};
use futures::{Stream, StreamExt};
use log::{debug, error, info};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Receives every processed frame along with the latest absolute positions.
pub trait Drawer: Send {
    fn draw(&mut self, frame: &Frame, rois: &[Arc<Roi>], positions: &BTreeMap<u32, Vec<DataPoint>>);
}

/// Point-in-time view of a running monitor, published after every frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorStatus {
    pub is_running: bool,
    pub last_frame_idx: u64,
    /// Seconds since the start of the experiment.
    pub last_time_stamp: f64,
    /// Absolute positions by ROI idx; empty when the ROI produced nothing.
    pub last_positions: BTreeMap<u32, Vec<DataPoint>>,
}

/// Asks a monitor to stop before its next frame.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The capture stream ran out of frames.
    Exhausted,
    /// `StopHandle::stop` was called.
    Stopped,
}

/// Builds one unit per ROI. `stimulators` must be `None` or hold exactly one per ROI.
pub fn tracking_units(
    rois: Vec<Arc<Roi>>,
    tracker: &TrackerConfig,
    stimulators: Option<Vec<Stimulator>>,
    limits: TrackingLimits,
) -> Result<Vec<TrackingUnit>, ConfigError> {
    match stimulators {
        None => Ok(rois
            .into_iter()
            .map(|roi| TrackingUnit::new(roi, tracker.build(), None, limits))
            .collect()),
        Some(stimulators) if stimulators.len() == rois.len() => Ok(rois
            .into_iter()
            .zip(stimulators)
            .map(|(roi, stimulator)| TrackingUnit::new(roi, tracker.build(), Some(stimulator), limits))
            .collect()),
        Some(stimulators) => Err(ConfigError::StimulatorCount {
            rois: rois.len(),
            stimulators: stimulators.len(),
        }),
    }
}

pub struct Monitor {
    units: Vec<TrackingUnit>,
    rois: Vec<Arc<Roi>>,
    pool: Option<rayon::ThreadPool>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<MonitorStatus>,
    status: MonitorStatus,
}

impl Monitor {
    /// A monitor over `units`. With `parallel_rois`, ROIs are tracked on a pool of `num_cpus` threads.
    pub fn new(units: Vec<TrackingUnit>, parallel_rois: bool) -> Result<Self, ConfigError> {
        let pool = if parallel_rois {
            let threads = num_cpus::get().min(units.len().max(1));
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("ethoscope-roi-{i}"))
                .build()
                .map_err(|e| ConfigError::parameter("parallel_rois", e.to_string()))?;
            info!("Tracking {} ROIs on {} threads", units.len(), threads);
            Some(pool)
        } else {
            None
        };

        let rois = units.iter().map(|u| Arc::clone(u.roi())).collect();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, _) = watch::channel(MonitorStatus::default());

        Ok(Self {
            units,
            rois,
            pool,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            status_tx,
            status: MonitorStatus::default(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_tx))
    }

    /// Subscribes to the status published after every frame.
    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status_tx.subscribe()
    }

    pub fn units(&self) -> &[TrackingUnit] {
        &self.units
    }

    pub fn rois(&self) -> &[Arc<Roi>] {
        &self.rois
    }

    pub fn last_positions(&self) -> &BTreeMap<u32, Vec<DataPoint>> {
        &self.status.last_positions
    }

    pub fn last_frame_idx(&self) -> u64 {
        self.status.last_frame_idx
    }

    /// Seconds since the start of the experiment, 0 before the first frame.
    pub fn last_time_stamp(&self) -> f64 {
        self.status.last_time_stamp
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running
    }

    /// Runs until the stream ends or a stop is requested. The sink is closed either way.
    pub async fn run<S>(
        &mut self,
        mut frames: S,
        sink: &mut dyn ResultSink,
        mut drawer: Option<&mut dyn Drawer>,
    ) -> Result<RunOutcome, EthoscopeError>
    where
        S: Stream<Item = Result<Frame, CaptureError>> + Unpin,
    {
        info!("Monitor starting a run over {} ROIs", self.units.len());
        self.status.is_running = true;
        self.publish();

        let outcome = self.run_loop(&mut frames, sink, &mut drawer).await;

        self.status.is_running = false;
        self.publish();
        let closed = sink.close();

        match &outcome {
            Ok(o) => info!("Monitor closing ({:?}) after frame {}", o, self.status.last_frame_idx),
            Err(e) => error!("Monitor closing with an error: {}", e),
        }
        let outcome = outcome?;
        closed?;
        Ok(outcome)
    }

    async fn run_loop<S>(
        &mut self,
        frames: &mut S,
        sink: &mut dyn ResultSink,
        drawer: &mut Option<&mut dyn Drawer>,
    ) -> Result<RunOutcome, EthoscopeError>
    where
        S: Stream<Item = Result<Frame, CaptureError>> + Unpin,
    {
        let mut stop_rx = self.stop_rx.clone();
        loop {
            if *stop_rx.borrow() {
                info!("Monitor object stopped from external request");
                return Ok(RunOutcome::Stopped);
            }

            let next = tokio::select! {
                next = frames.next() => next,
                _ = stop_rx.changed() => continue,
            };
            let Some(frame) = next else {
                return Ok(RunOutcome::Exhausted);
            };

            let frame = frame?;
            let wall_clock_s = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
            self.process_frame(&frame, wall_clock_s, sink)?;

            if let Some(drawer) = drawer.as_deref_mut() {
                drawer.draw(&frame, &self.rois, &self.status.last_positions);
            }
            self.publish();
        }
    }

    /// Tracks every ROI on `frame` and hands the rows to `sink`.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        wall_clock_s: f64,
        sink: &mut dyn ResultSink,
    ) -> Result<(), EthoscopeError> {
        let t = frame.t_ms;
        self.status.last_frame_idx = frame.idx;
        self.status.last_time_stamp = t as f64 / 1000.0;

        let track = |unit: &mut TrackingUnit| -> Result<Vec<DataPoint>, TrackingError> {
            unit.track_at(t, &frame.image, wall_clock_s)
        };
        let results: Vec<Result<Vec<DataPoint>, TrackingError>> = match &self.pool {
            Some(pool) => pool.install(|| self.units.par_iter_mut().map(track).collect()),
            None => self.units.iter_mut().map(track).collect(),
        };

        for (unit, result) in self.units.iter().zip(results) {
            let idx = unit.roi().idx();
            let mut rows = match result {
                Ok(rows) => rows,
                Err(e) => {
                    error!("ROI {} at {} ms: {}", idx, t, e);
                    continue;
                }
            };
            if rows.is_empty() {
                self.status.last_positions.insert(idx, Vec::new());
                continue;
            }

            self.status.last_positions.insert(idx, unit.get_last_positions(true));
            if let Some(first) = rows.first_mut() {
                first.append(Variable::int(VariableKind::FrameCount, frame.idx as i64));
            }
            sink.write(t, unit.roi(), &rows)?;
        }

        sink.flush(t, &frame.image, frame.idx)?;
        debug!("frame {} at {} ms processed", frame.idx, t);
        Ok(())
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("units", &self.units.len())
            .field("parallel", &self.pool.is_some())
            .field("last_frame_idx", &self.status.last_frame_idx)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame_source::{spawn_capture, VecSource};
    use crate::core_modules::result_writer::MemorySink;
    use crate::core_modules::stimulators::kinds::{StimulatorConfig, StimulatorKind};
    use crate::core_modules::tracker::tests::arena;
    use futures::stream;
    use image::GrayImage;

    /// Two ROIs side by side on a 80x20 frame: idx 1 on the left half, idx 2 on the right.
    fn rois() -> Vec<Arc<Roi>> {
        vec![
            Arc::new(Roi::from_rectangle(0, 0, 40, 20, 1).unwrap()),
            Arc::new(Roi::from_rectangle(40, 0, 40, 20, 2).unwrap()),
        ]
    }

    /// Background frame with a fly at `(x, y)` in the left ROI.
    fn frame(fly: Option<(u32, u32)>) -> GrayImage {
        arena(80, 20, fly)
    }

    fn monitor(parallel: bool) -> Monitor {
        let units = tracking_units(rois(), &TrackerConfig::default(), None, TrackingLimits::default()).unwrap();
        Monitor::new(units, parallel).unwrap()
    }

    fn frames(images: Vec<GrayImage>) -> impl Stream<Item = Result<Frame, CaptureError>> + Unpin {
        let frames: Vec<_> = images
            .into_iter()
            .enumerate()
            .map(|(i, image)| {
                Ok(Frame {
                    idx: i as u64,
                    t_ms: i as i64 * 100,
                    image,
                })
            })
            .collect();
        stream::iter(frames)
    }

    #[test]
    fn one_stimulator_per_roi_or_none() {
        let cfg = StimulatorConfig::new(StimulatorKind::RobustSleepDepriver);
        let one = vec![cfg.build(None).unwrap()];
        let err = tracking_units(rois(), &TrackerConfig::default(), Some(one), TrackingLimits::default());
        assert!(matches!(
            err,
            Err(ConfigError::StimulatorCount {
                rois: 2,
                stimulators: 1
            })
        ));

        let two = vec![cfg.build(None).unwrap(), cfg.build(None).unwrap()];
        let units = tracking_units(rois(), &TrackerConfig::default(), Some(two), TrackingLimits::default()).unwrap();
        assert_eq!(units.len(), 2);
    }

    #[tokio::test]
    async fn tracks_writes_and_flushes_every_frame() {
        let mut monitor = monitor(false);
        let mut sink = MemorySink::default();
        let images = vec![frame(None), frame(Some((10, 8))), frame(Some((14, 8)))];

        let outcome = monitor.run(frames(images), &mut sink, None).await.unwrap();
        assert_eq!(outcome, RunOutcome::Exhausted);
        assert!(sink.closed);
        assert_eq!(sink.flushes, vec![(0, 0), (100, 1), (200, 2)]);

        // the empty right ROI never produces rows; the left one does once the fly appears
        assert!(sink.rows.iter().all(|(_, idx, _)| *idx == 1));
        assert_eq!(sink.rows.len(), 2);
        let (t, _, rows) = &sink.rows[1];
        assert_eq!(*t, 200);
        assert_eq!(rows[0].get(VariableKind::FrameCount).map(|v| v.as_i64()), Some(2));

        assert_eq!(monitor.last_frame_idx(), 2);
        assert_eq!(monitor.last_time_stamp(), 0.2);
        assert!(!monitor.is_running());
        assert_eq!(monitor.last_positions().get(&2), Some(&Vec::new()));
        assert_eq!(monitor.last_positions().get(&1).map(|p| p.len()), Some(1));
    }

    #[tokio::test]
    async fn positions_are_absolute() {
        let units = tracking_units(rois(), &TrackerConfig::default(), None, TrackingLimits::default()).unwrap();
        let mut monitor = Monitor::new(units, false).unwrap();
        let mut sink = MemorySink::default();
        // fly in the right ROI, 50 px from the left edge of the frame
        let images = vec![frame(None), frame(Some((50, 8)))];
        monitor.run(frames(images), &mut sink, None).await.unwrap();

        let (_, idx, rows) = &sink.rows[0];
        assert_eq!(*idx, 2);
        let relative_x = rows[0].get(VariableKind::X).map(|v| v.as_i64());
        let absolute_x = monitor.last_positions()[&2][0].get(VariableKind::X).map(|v| v.as_i64());
        assert_eq!(absolute_x, relative_x.map(|x| x + 40));
    }

    #[tokio::test]
    async fn parallel_and_sequential_agree() {
        let images = || vec![frame(None), frame(Some((10, 8))), frame(Some((60, 4))), frame(None)];

        let mut sequential = MemorySink::default();
        monitor(false).run(frames(images()), &mut sequential, None).await.unwrap();
        let mut parallel = MemorySink::default();
        monitor(true).run(frames(images()), &mut parallel, None).await.unwrap();

        assert_eq!(sequential.rows, parallel.rows);
        assert_eq!(sequential.flushes, parallel.flushes);
    }

    #[tokio::test]
    async fn a_failing_roi_does_not_stop_the_others() {
        // ROI 2 lies partly outside a 60 px wide frame
        let mut monitor = monitor(false);
        let mut sink = MemorySink::default();
        let images = vec![arena(60, 20, None), arena(60, 20, Some((10, 8)))];
        let outcome = monitor.run(frames(images), &mut sink, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Exhausted);
        assert_eq!(sink.flushes.len(), 2);
        assert_eq!(sink.rows.len(), 1);
        assert_eq!(sink.rows[0].1, 1);
        assert!(!monitor.last_positions().contains_key(&2));
    }

    #[tokio::test]
    async fn capture_errors_end_the_run() {
        let mut monitor = monitor(false);
        let mut sink = MemorySink::default();
        let items = vec![
            Ok(Frame {
                idx: 0,
                t_ms: 0,
                image: frame(None),
            }),
            Err(CaptureError::Io(std::io::Error::new(std::io::ErrorKind::Other, "camera unplugged"))),
        ];
        let result = monitor.run(stream::iter(items), &mut sink, None).await;
        assert!(matches!(result, Err(EthoscopeError::Capture(CaptureError::Io(_)))));
        assert_eq!(sink.flushes.len(), 1);
        assert!(sink.closed);
    }

    #[tokio::test]
    async fn stop_handle_interrupts_a_pending_wait() {
        let mut monitor = monitor(false);
        let stop = monitor.stop_handle();
        let mut sink = MemorySink::default();
        let frames = stream::iter(vec![Ok(Frame {
            idx: 0,
            t_ms: 0,
            image: frame(None),
        })])
        .chain(stream::pending());

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stop.stop();
        });
        let outcome = monitor.run(frames, &mut sink, None).await.unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(sink.flushes.len(), 1);
    }

    struct Counting(Vec<(u64, usize)>);

    impl Drawer for Counting {
        fn draw(&mut self, frame: &Frame, _rois: &[Arc<Roi>], positions: &BTreeMap<u32, Vec<DataPoint>>) {
            self.0.push((frame.idx, positions.values().map(|p| p.len()).sum()));
        }
    }

    #[tokio::test]
    async fn end_to_end_from_a_capture_thread() {
        let images = vec![frame(None), frame(Some((10, 8))), frame(Some((12, 8))), frame(None)];
        let (stream, _capture) = spawn_capture(VecSource::from_images(images, 100));
        let mut monitor = monitor(false);
        let status = monitor.subscribe();
        let mut sink = MemorySink::default();
        let mut drawer = Counting(Vec::new());

        monitor.run(stream, &mut sink, Some(&mut drawer)).await.unwrap();

        assert_eq!(drawer.0.iter().map(|d| d.0).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        // last frame: the fly is gone but its position is still inferred
        assert_eq!(drawer.0[3].1, 1);
        let inferred = &sink.rows.last().unwrap().2[0];
        assert!(inferred.is_inferred());
        assert_eq!(status.borrow().last_frame_idx, 3);
        assert!(!status.borrow().is_running);
    }
}
