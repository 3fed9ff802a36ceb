//! facegate-hw: Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access with conversion to RGB frames and a
//! background capture loop that keeps only the latest frame.

pub mod camera;
pub mod capture;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use capture::{CaptureLoop, FrameGrabber, FrameSource, LatestFrames, DEFAULT_WARMUP_FRAMES};
