//! Continuous capture on a dedicated thread with a single latest-frame slot.
//!
//! The capture thread exclusively owns the device. Consumers hold a
//! [`LatestFrames`] handle and see only the most recent frame; frames that
//! arrive between two reads are overwritten, never queued.

use crate::camera::{Camera, CameraError};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Frames discarded after the device opens while exposure settles.
pub const DEFAULT_WARMUP_FRAMES: usize = 4;
/// How long [`LatestFrames::next_frame`] waits for a new frame.
pub const DEFAULT_FRAME_WAIT: Duration = Duration::from_millis(500);

const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Anything that can be asked for the next frame.
pub trait FrameSource: Send {
    /// The next frame, or `None` if none is available right now.
    fn next_frame(&mut self) -> Option<RgbImage>;
}

/// Blocking frame producer driven by the capture thread.
pub trait FrameGrabber: Send + 'static {
    fn grab(&mut self) -> Result<RgbImage, CameraError>;
}

#[derive(Default)]
struct Slot {
    frame: Option<RgbImage>,
    sequence: u64,
    finished: bool,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    updated: Condvar,
    stop: AtomicBool,
}

impl Shared {
    // A panic while holding the lock leaves only a stale frame behind.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self) {
        self.lock().finished = true;
        self.updated.notify_all();
    }
}

/// Owns the capture thread. Dropping it stops the thread.
pub struct CaptureLoop {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureLoop {
    /// Open `device_path` and start capturing.
    pub fn spawn(device_path: &str, warmup: usize) -> Result<Self, CameraError> {
        let camera = Camera::open(device_path)?;
        Self::spawn_with(camera, warmup)
    }

    /// Start capturing from an already opened grabber.
    pub fn spawn_with<G: FrameGrabber>(grabber: G, warmup: usize) -> Result<Self, CameraError> {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);

        let handle = std::thread::Builder::new()
            .name("facegate-capture".into())
            .spawn(move || capture_thread(grabber, warmup, &thread_shared))
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// A consumer handle that yields each new frame at most once.
    pub fn frames(&self) -> LatestFrames {
        self.frames_with_wait(DEFAULT_FRAME_WAIT)
    }

    pub fn frames_with_wait(&self, wait: Duration) -> LatestFrames {
        LatestFrames {
            shared: Arc::clone(&self.shared),
            last_seen: 0,
            wait,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shared.lock().finished
    }

    /// Stop the capture thread and release the device.
    pub fn close(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("capture thread panicked");
            }
            self.shared.finish();
            tracing::info!("capture loop closed");
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_thread<G: FrameGrabber>(mut grabber: G, warmup: usize, shared: &Shared) {
    tracing::info!(warmup, "capture thread started");
    let mut discarded = 0usize;
    let mut errors = 0u32;

    while !shared.stop.load(Ordering::SeqCst) {
        match grabber.grab() {
            Ok(frame) => {
                errors = 0;
                if discarded < warmup {
                    discarded += 1;
                    tracing::trace!(discarded, "discarding warm-up frame");
                    continue;
                }
                let mut slot = shared.lock();
                slot.frame = Some(frame);
                slot.sequence += 1;
                drop(slot);
                shared.updated.notify_all();
            }
            Err(e) => {
                errors += 1;
                tracing::warn!(error = %e, consecutive = errors, "frame capture failed");
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!("too many consecutive capture failures; stopping capture");
                    break;
                }
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    // Dropping the grabber closes the device.
    drop(grabber);
    shared.finish();
    tracing::info!("capture thread stopped");
}

/// Reader side of a [`CaptureLoop`].
pub struct LatestFrames {
    shared: Arc<Shared>,
    last_seen: u64,
    wait: Duration,
}

impl FrameSource for LatestFrames {
    /// Wait up to the configured duration for a frame newer than the last one
    /// returned.
    fn next_frame(&mut self) -> Option<RgbImage> {
        let deadline = Instant::now() + self.wait;
        let mut slot = self.shared.lock();

        loop {
            if slot.sequence > self.last_seen {
                if let Some(frame) = slot.frame.as_ref() {
                    self.last_seen = slot.sequence;
                    return Some(frame.clone());
                }
            }
            if slot.finished {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = match self.shared.updated.wait_timeout(slot, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
