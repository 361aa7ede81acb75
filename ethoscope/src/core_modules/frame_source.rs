// THEORY:
// Cameras and video files are blocking producers; the monitor is an async
// consumer that must never hold more than the frame it is working on. The
// hand-off between the two is a single slot channel.
//
// Key architectural principles:
// 1.  **Dedicated Producer Thread**: `spawn_capture` moves the blocking
//     `FrameSource` onto its own OS thread. The thread pushes frames with
//     `blocking_send`, so when the consumer lags the producer simply waits;
//     frames are never queued up behind a slow tracker.
// 2.  **Cooperative Stop**: a `watch` flag is checked by the producer before
//     each capture. Stopping never interrupts a capture midway; the producer
//     finishes the frame it is on, sees the flag and closes the channel.
// 3.  **Stream Facing**: the consumer sees a plain `futures::Stream` of
//     `Result<Frame, CaptureError>`. The end of the stream is the end of the
//     experiment, whatever the reason.

use crate::error::CaptureError;
use futures::stream::{self, BoxStream, StreamExt};
use image::GrayImage;
use log::{debug, warn};
use std::collections::VecDeque;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, watch};

/// One greyscale frame with its index and capture time.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Zero based position in the capture sequence.
    pub idx: u64,
    /// Capture time in ms since the start of the experiment.
    pub t_ms: i64,
    pub image: GrayImage,
}

/// A blocking producer of frames. `Ok(None)` means the source is exhausted.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// In-memory source, mostly for tests and replays.
#[derive(Debug, Default)]
pub struct VecSource {
    frames: VecDeque<Frame>,
}

impl VecSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    /// Frames spaced `interval_ms` apart, starting at t = 0.
    pub fn from_images(images: Vec<GrayImage>, interval_ms: i64) -> Self {
        let frames = images
            .into_iter()
            .enumerate()
            .map(|(i, image)| Frame {
                idx: i as u64,
                t_ms: i as i64 * interval_ms,
                image,
            })
            .collect();
        Self { frames }
    }
}

impl FrameSource for VecSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        Ok(self.frames.pop_front())
    }
}

pub type FrameStream = BoxStream<'static, Result<Frame, CaptureError>>;

/// Stops the producer thread of a `spawn_capture` call.
#[derive(Debug)]
pub struct CaptureHandle {
    stop: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Asks the producer to stop before its next capture.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

/// Runs `source` on its own thread and returns the frames as a stream.
pub fn spawn_capture<S: FrameSource + 'static>(mut source: S) -> (FrameStream, CaptureHandle) {
    let (tx, rx) = mpsc::channel::<Result<Frame, CaptureError>>(1);
    let (stop_tx, stop_rx) = watch::channel(false);

    let thread = std::thread::spawn(move || {
        let mut captured = 0u64;
        loop {
            if *stop_rx.borrow() {
                debug!("capture stopped after {} frames", captured);
                break;
            }
            match source.next_frame() {
                Ok(Some(frame)) => {
                    captured += 1;
                    if tx.blocking_send(Ok(frame)).is_err() {
                        debug!("frame consumer went away after {} frames", captured);
                        break;
                    }
                }
                Ok(None) => {
                    debug!("frame source exhausted after {} frames", captured);
                    break;
                }
                Err(e) => {
                    warn!("frame source failed: {}", e);
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    let frames = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed();

    (
        frames,
        CaptureHandle {
            stop: stop_tx,
            thread: Some(thread),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Never runs out of frames.
    struct Endless {
        next: u64,
    }

    impl FrameSource for Endless {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            let idx = self.next;
            self.next += 1;
            Ok(Some(Frame {
                idx,
                t_ms: idx as i64 * 40,
                image: GrayImage::new(4, 4),
            }))
        }
    }

    struct Broken;

    impl FrameSource for Broken {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            Err(CaptureError::Io(std::io::Error::new(std::io::ErrorKind::Other, "camera unplugged")))
        }
    }

    #[tokio::test]
    async fn frames_arrive_in_order_then_stream_ends() {
        let images = (0..5).map(|_| GrayImage::new(8, 8)).collect();
        let (frames, _handle) = spawn_capture(VecSource::from_images(images, 100));
        let got: Vec<_> = frames.map(|f| f.unwrap()).collect().await;
        assert_eq!(got.iter().map(|f| f.idx).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(got.iter().map(|f| f.t_ms).collect::<Vec<_>>(), vec![0, 100, 200, 300, 400]);
    }

    #[tokio::test]
    async fn stop_ends_an_endless_source() {
        let (mut frames, handle) = spawn_capture(Endless { next: 0 });
        for expected in 0..3 {
            let frame = frames.next().await.unwrap().unwrap();
            assert_eq!(frame.idx, expected);
        }
        handle.stop();
        // at most the buffered frame and the one being sent when the flag was raised
        let rest = frames.count().await;
        assert!(rest <= 2, "got {} frames after stop", rest);
    }

    #[tokio::test]
    async fn source_errors_are_forwarded_once() {
        let (frames, _handle) = spawn_capture(Broken);
        let items: Vec<_> = frames.collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(CaptureError::Io(_))));
    }
}
