//! Frame capture.
//!
//! A single thread owns the camera for the whole process and publishes the
//! latest JPEG frame on a watch channel. Viewers only ever read that channel,
//! so any number of them can share one device.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

mod encode;
mod pattern;
#[cfg(target_os = "linux")]
mod v4l;

pub use encode::{encode_jpeg, yuyv_to_rgb};
pub use pattern::TestPattern;

const RETRY_MINIMUM_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_MAXIMUM_INTERVAL: Duration = Duration::from_secs(5);

/// Latest JPEG frame, `None` until the first capture succeeds.
pub type FrameReceiver = watch::Receiver<Option<Bytes>>;

/// Something that produces JPEG encoded frames, one per call.
///
/// `capture` may block until the next frame is ready.
pub trait FrameSource {
    fn capture(&mut self) -> Result<Bytes, CameraError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<Bytes, CameraError> {
        (**self).capture()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Video4Linux device
    V4l,
    /// Synthetic frames, no hardware needed
    TestPattern,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub source: SourceKind,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("failed to open camera {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: std::io::Error,
    },
    #[error("camera cannot deliver {width}x{height} frames: {reason}")]
    Format {
        width: u32,
        height: u32,
        reason: String,
    },
    #[error("failed to capture frame: {0}")]
    Capture(#[source] std::io::Error),
    #[error("short frame: expected {expected} bytes, got {got}")]
    ShortFrame { expected: usize, got: usize },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("capture thread failed: {0}")]
    Thread(#[source] std::io::Error),
    #[cfg(not(target_os = "linux"))]
    #[error("camera source `{0}` is not available on this platform")]
    Unsupported(&'static str),
}

/// Open the source selected by `settings`. Must run on the capture thread.
pub fn open_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>, CameraError> {
    match settings.source {
        SourceKind::TestPattern => Ok(Box::new(TestPattern::new(
            settings.width,
            settings.height,
            settings.jpeg_quality,
        ))),
        #[cfg(target_os = "linux")]
        SourceKind::V4l => Ok(Box::new(v4l::V4lCamera::open(
            &settings.device,
            settings.width,
            settings.height,
            settings.jpeg_quality,
        )?)),
        #[cfg(not(target_os = "linux"))]
        SourceKind::V4l => Err(CameraError::Unsupported("v4l")),
    }
}

/// Owner of the capture thread.
#[derive(Debug)]
pub struct CaptureHandle {
    frames: FrameReceiver,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn frames(&self) -> FrameReceiver {
        self.frames.clone()
    }

    /// Ask the capture thread to exit and wait for it to finish its current
    /// frame, giving up after `timeout`.
    pub async fn stop(mut self, timeout: Duration) {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return;
        };

        let join = tokio::task::spawn_blocking(move || thread.join());
        match tokio::time::timeout(timeout, join).await {
            Ok(Ok(Ok(()))) => debug!("capture thread stopped"),
            Ok(Ok(Err(_))) => warn!("capture thread panicked"),
            Ok(Err(e)) => warn!("failed to join capture thread: {e}"),
            Err(_) => warn!("capture thread did not stop within {timeout:?}"),
        }
    }
}

/// Start the capture thread.
///
/// `open` runs on the new thread, so the source itself never has to be
/// `Send`. An error from `open` is returned here and no thread is left
/// running.
pub async fn spawn_capture<S, F>(open: F) -> Result<CaptureHandle, CameraError>
where
    S: FrameSource,
    F: FnOnce() -> Result<S, CameraError> + Send + 'static,
{
    let (frames_tx, frames_rx) = watch::channel(None);
    let (ready_tx, ready_rx) = oneshot::channel();
    let stop = Arc::new(AtomicBool::new(false));

    let thread = std::thread::Builder::new()
        .name("camera-capture".to_owned())
        .spawn({
            let stop = stop.clone();
            move || {
                let source = match open() {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                capture_loop(source, frames_tx, &stop);
            }
        })
        .map_err(CameraError::Thread)?;

    match ready_rx.await {
        Ok(Ok(())) => {
            info!("camera opened");
            Ok(CaptureHandle {
                frames: frames_rx,
                stop,
                thread: Some(thread),
            })
        }
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => Err(CameraError::Thread(std::io::Error::other(
            "capture thread exited before opening the camera",
        ))),
    }
}

fn capture_loop<S: FrameSource>(
    mut source: S,
    frames: watch::Sender<Option<Bytes>>,
    stop: &AtomicBool,
) {
    let _exit = ExitGuard { stop };
    let mut backoff = RetryBackoff::new(RETRY_MINIMUM_INTERVAL, RETRY_MAXIMUM_INTERVAL);

    while !stop.load(Ordering::Acquire) {
        match source.capture() {
            Ok(frame) => {
                backoff.reset();
                frames.send_replace(Some(frame));
            }
            Err(e) => {
                warn!(
                    "capture failed, retrying in {}ms: {e}",
                    backoff.interval().as_millis()
                );
                backoff.wait();
            }
        }
    }
}

/// Reports a capture thread that ends without being stopped, which leaves
/// every open video feed without frames.
struct ExitGuard<'a> {
    stop: &'a AtomicBool,
}

impl ExitGuard<'_> {
    fn unexpected(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if self.unexpected() {
            error!(
                panicked = std::thread::panicking(),
                "capture thread exited unexpectedly, video feeds have ended"
            );
        }
    }
}

/// Exponential backoff between failed captures.
struct RetryBackoff {
    minimal_interval: Duration,
    maximal_interval: Duration,
    curr_interval: Duration,
}

impl RetryBackoff {
    fn new(minimal_interval: Duration, maximal_interval: Duration) -> Self {
        debug_assert!(minimal_interval <= maximal_interval);

        Self {
            minimal_interval,
            maximal_interval,
            curr_interval: minimal_interval,
        }
    }

    fn wait(&mut self) {
        std::thread::sleep(self.curr_interval);
        self.curr_interval = (self.curr_interval * 2).min(self.maximal_interval);
    }

    fn reset(&mut self) {
        self.curr_interval = self.minimal_interval;
    }

    fn interval(&self) -> Duration {
        self.curr_interval
    }
}
