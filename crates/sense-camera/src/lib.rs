// sense-camera/src/lib.rs
// ============================================================
// Permission-gated camera capture crate for the sense pipeline
// Owns the capture session on a dedicated thread and hands each
// raw frame to a sink *by reference* so driver buffers can be
// recycled as soon as the callback returns.
// ------------------------------------------------------------
// Public API:
//   * PermissionGate          – query / request camera access
//   * FrameSource::configure  – one-time session setup
//   * FrameSource::start/stop – idempotent capture lifecycle
//   * CaptureDevice           – driver seam (synthetic, gstreamer)
// ------------------------------------------------------------
// Build notes
//   * `--features gstreamer` enables the libcamera / v4l2 backend.
// ============================================================

//! sense – camera capture layer
//!
//! A [`FrameSource`] drives a [`CaptureDevice`] on its own thread and
//! delivers every frame to a [`FrameSink`] as a borrowed [`RawFrame`].
//! The borrow is the ownership contract: a sink can read the pixels for
//! the duration of one callback and can never keep them, because the
//! device reuses the buffer for the next capture.
//!
//! Access to the device is gated by a [`PermissionGate`]; the capture
//! layer itself never asks for permission, the pipeline controller does.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod permission;
pub mod source;
pub mod synthetic;

#[cfg(feature = "gstreamer")]
pub mod gst_camera;

pub use permission::{
    DevicePermissionGate, PermissionCallback, PermissionGate, PermissionState,
    ScriptedPermissionGate,
};
pub use source::{FrameSource, SourceState};
pub use synthetic::{SyntheticCamera, TestPattern};

#[cfg(feature = "gstreamer")]
pub use gst_camera::GstCamera;

/// Errors that take away the ability to capture at all.
///
/// Anything in here ends the current session; per-frame problems are the
/// extractor's business and never surface as a `CaptureSessionError`.
#[derive(Error, Debug)]
pub enum CaptureSessionError {
    #[error("capture device {0} is in use by another process")]
    DeviceBusy(String),
    #[error("capture device {0} is unavailable")]
    Unavailable(String),
    #[error("frame source has not been configured")]
    NotConfigured,
    #[error("invalid camera configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("capture backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CaptureSessionError>;

/// Pixel layouts understood by the capture and preprocess stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 4:2:0 luma plane followed by an interleaved UV plane.
    Nv12,
    Rgb24,
    Bgra32,
}

impl PixelFormat {
    /// Smallest legal row stride (bytes) of the first plane.
    pub fn min_stride(self, width: u32) -> usize {
        let w = width as usize;
        match self {
            // interleaved UV pairs cover ceil(w/2) chroma columns
            PixelFormat::Nv12 => w + (w & 1),
            PixelFormat::Rgb24 => w * 3,
            PixelFormat::Bgra32 => w * 4,
        }
    }

    /// Bytes needed to hold a full frame with the given stride.
    pub fn frame_len(self, height: u32, stride: usize) -> usize {
        let h = height as usize;
        match self {
            // chroma plane has half the rows, same stride
            PixelFormat::Nv12 => stride * h + stride * h.div_ceil(2),
            PixelFormat::Rgb24 | PixelFormat::Bgra32 => stride * h,
        }
    }
}

/// Which way the lens points relative to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    #[default]
    Back,
    Front,
}

/// Clockwise rotation from the sensor's native orientation to upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn quarter_turns(self) -> u8 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 1,
            Rotation::Deg180 => 2,
            Rotation::Deg270 => 3,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(degrees: u16) -> std::result::Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(format!("rotation must be a multiple of 90 below 360, got {other}")),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> u16 {
        rotation.quarter_turns() as u16 * 90
    }
}

/// Capture session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device node or backend-specific identifier.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate the driver is asked for.
    pub fps: u32,
    pub format: PixelFormat,
    pub facing: CameraFacing,
    pub sensor_rotation: Rotation,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Nv12,
            facing: CameraFacing::Back,
            sensor_rotation: Rotation::Deg0,
        }
    }
}

impl CameraConfig {
    /// Time between two frames at the nominal rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureSessionError::InvalidConfig(format!(
                "frame size {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(CaptureSessionError::InvalidConfig("fps must be > 0".into()));
        }
        if self.format == PixelFormat::Nv12 && (self.width % 2 != 0 || self.height % 2 != 0) {
            return Err(CaptureSessionError::InvalidConfig(format!(
                "NV12 needs even dimensions, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// One captured frame, borrowed from the device for a single callback.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane.
    pub stride: usize,
    /// Capture time relative to the device's first open.
    pub timestamp: Duration,
    pub sequence: u64,
}

/// Driver seam. Implementations own their frame buffers.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    /// Apply session settings. Called once, before the first `open`.
    fn configure(&mut self, config: &CameraConfig) -> Result<()>;

    /// Acquire the hardware. Fails with `DeviceBusy` when another process holds it.
    fn open(&mut self) -> Result<()>;

    /// Block for at most `timeout` waiting for the next frame.
    ///
    /// `Ok(None)` means nothing arrived in time; the capture loop uses it to
    /// poll its stop flag. An `Err` ends the session.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame<'_>>>;

    /// Release the hardware. Must be safe to call on a closed device.
    fn close(&mut self);
}

/// Receiver of raw frames, invoked on the capture thread.
pub trait FrameSink: Send {
    fn on_frame(&mut self, frame: &RawFrame<'_>);

    /// The session died underneath us (unplugged, stolen, EOS).
    fn on_capture_failed(&mut self, error: CaptureSessionError) {
        log::error!("capture session failed: {error}");
    }
}

impl<F> FrameSink for F
where
    F: FnMut(&RawFrame<'_>) + Send,
{
    fn on_frame(&mut self, frame: &RawFrame<'_>) {
        self(frame)
    }
}
