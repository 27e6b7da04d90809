//! sense‑preprocess – center-crop, resize and convert raw frames for the model.
//!
//! Runs on the capture thread, once per accepted frame. The raw frame is
//! only borrowed; everything the model needs is copied into an
//! [`ExtractedFrame`] whose pixel buffer comes from a small recycle pool,
//! so in steady state extraction does not allocate.

use log::warn;
use ndarray::Array4;
use resize::{Pixel, Type};
use rgb::FromSlice;
use sense_camera::{CameraFacing, PixelFormat, RawFrame, Rotation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod convert;
pub mod transform;

pub use convert::{center_crop, CropRect};
pub use transform::{orientation_transform, AffineTransform};

// enough for one frame in flight plus one being filled
const POOL_LIMIT: usize = 2;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("frame has zero width or height")]
    EmptyFrame,
    #[error("row stride {stride} is below the minimum of {min} bytes")]
    StrideTooSmall { stride: usize, min: usize },
    #[error("frame buffer holds {actual} bytes, layout needs {expected}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("model input format {0:?} is not supported")]
    UnsupportedTarget(PixelFormat),
    #[error("resize failed: {0}")]
    Resize(String),
}

pub type Result<T> = std::result::Result<T, ConversionError>;

/// Fixed input geometry and layout of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelInput {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Default for ModelInput {
    fn default() -> Self {
        Self {
            width: 224,
            height: 224,
            format: PixelFormat::Rgb24,
        }
    }
}

/// Model-ready pixels plus the transform for showing the frame upright.
#[derive(Debug)]
pub struct ExtractedFrame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub transform: AffineTransform,
    pub timestamp: Duration,
    pub sequence: u64,
}

impl ExtractedFrame {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// An owned copy for the consumer; the original goes back to the pool.
    pub fn debug_copy(&self) -> DebugFrame {
        DebugFrame {
            pixels: self.pixels.clone(),
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }

    /// Hand the buffer back for [`FrameExtractor::recycle`].
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// NCHW `f32` tensor in RGB channel order, normalised to 0‑1.
    pub fn to_tensor(&self) -> Array4<f32> {
        let (w, h) = (self.width as usize, self.height as usize);
        let (bpp, channel_offset) = match self.format {
            PixelFormat::Bgra32 => (4, [2usize, 1, 0]),
            _ => (3, [0usize, 1, 2]),
        };
        Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            self.pixels[(y * w + x) * bpp + channel_offset[c]] as f32 / 255.0
        })
    }
}

/// Owned copy of an extracted frame for on-screen debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl DebugFrame {
    /// Convert to an `image` buffer (for saving or blitting).
    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        let rgb = match self.format {
            PixelFormat::Rgb24 => self.pixels.clone(),
            PixelFormat::Bgra32 => self
                .pixels
                .chunks_exact(4)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
            PixelFormat::Nv12 => return None,
        };
        image::RgbImage::from_raw(self.width, self.height, rgb)
    }
}

/// Raw frame → model input. One per pipeline, lives on the capture thread.
pub struct FrameExtractor {
    target: ModelInput,
    transform: AffineTransform,
    cropped: Vec<u8>,
    resized: Vec<u8>,
    pool: Vec<Vec<u8>>,
    dropped: u64,
}

impl FrameExtractor {
    pub fn new(target: ModelInput, rotation: Rotation, facing: CameraFacing) -> Result<Self> {
        if target.format == PixelFormat::Nv12 {
            return Err(ConversionError::UnsupportedTarget(target.format));
        }
        if target.width == 0 || target.height == 0 {
            return Err(ConversionError::EmptyFrame);
        }
        Ok(Self {
            target,
            transform: orientation_transform(rotation, facing),
            cropped: Vec::new(),
            resized: Vec::new(),
            pool: Vec::with_capacity(POOL_LIMIT),
            dropped: 0,
        })
    }

    pub fn target(&self) -> ModelInput {
        self.target
    }

    /// Frames rejected as malformed so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Return an output buffer so the next extraction can reuse it.
    pub fn recycle(&mut self, pixels: Vec<u8>) {
        if self.pool.len() < POOL_LIMIT {
            self.pool.push(pixels);
        }
    }

    pub fn extract(&mut self, raw: &RawFrame<'_>) -> Result<ExtractedFrame> {
        let (tw, th) = (self.target.width, self.target.height);
        convert::validate(raw)?;
        let crop = center_crop(raw.width, raw.height, tw, th);
        convert::crop_to_rgb(raw, crop, &mut self.cropped)?;

        let rgb_len = (tw * th * 3) as usize;
        let mut out = self.pool.pop().unwrap_or_default();

        // resize straight into the output when no swizzle follows
        let rgb_dst = if self.target.format == PixelFormat::Rgb24 {
            &mut out
        } else {
            &mut self.resized
        };
        rgb_dst.clear();
        rgb_dst.resize(rgb_len, 0);

        if crop.width == tw as usize && crop.height == th as usize {
            rgb_dst.copy_from_slice(&self.cropped);
        } else {
            let mut resizer = resize::new(
                crop.width,
                crop.height,
                tw as usize,
                th as usize,
                Pixel::RGB8,
                Type::Triangle,
            )
            .map_err(|e| ConversionError::Resize(e.to_string()))?;
            resizer
                .resize(self.cropped.as_rgb(), rgb_dst.as_rgb_mut())
                .map_err(|e| ConversionError::Resize(e.to_string()))?;
        }

        if self.target.format == PixelFormat::Bgra32 {
            convert::rgb_to_bgra(&self.resized, &mut out);
        }

        Ok(ExtractedFrame {
            pixels: out,
            width: tw,
            height: th,
            format: self.target.format,
            transform: self.transform,
            timestamp: raw.timestamp,
            sequence: raw.sequence,
        })
    }

    /// Like [`extract`](Self::extract) but never fails: a bad frame is
    /// counted, logged and dropped so capture keeps going.
    pub fn extract_or_drop(&mut self, raw: &RawFrame<'_>) -> Option<ExtractedFrame> {
        match self.extract(raw) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.dropped += 1;
                warn!("dropping frame #{}: {e} ({} dropped so far)", raw.sequence, self.dropped);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_frame(data: &[u8], w: u32, h: u32) -> RawFrame<'_> {
        RawFrame {
            data,
            format: PixelFormat::Rgb24,
            width: w,
            height: h,
            stride: w as usize * 3,
            timestamp: Duration::from_millis(7),
            sequence: 3,
        }
    }

    #[test]
    fn nv12_target_is_refused() {
        let target = ModelInput { format: PixelFormat::Nv12, ..Default::default() };
        assert!(matches!(
            FrameExtractor::new(target, Rotation::Deg0, CameraFacing::Back),
            Err(ConversionError::UnsupportedTarget(PixelFormat::Nv12))
        ));
    }

    #[test]
    fn same_size_is_a_plain_copy() {
        let target = ModelInput { width: 2, height: 1, format: PixelFormat::Rgb24 };
        let mut ex = FrameExtractor::new(target, Rotation::Deg0, CameraFacing::Back).unwrap();
        let data = [1, 2, 3, 4, 5, 6];
        let out = ex.extract(&rgb_frame(&data, 2, 1)).unwrap();
        assert_eq!(out.pixels(), &data);
        assert_eq!(out.sequence, 3);
        assert_eq!(out.timestamp, Duration::from_millis(7));
    }

    #[test]
    fn tensor_is_nchw_rgb() {
        let target = ModelInput { width: 2, height: 1, format: PixelFormat::Bgra32 };
        let mut ex = FrameExtractor::new(target, Rotation::Deg0, CameraFacing::Back).unwrap();
        let data = [255, 0, 0, 0, 255, 0];
        let out = ex.extract(&rgb_frame(&data, 2, 1)).unwrap();
        assert_eq!(out.pixels(), &[0, 0, 255, 255, 0, 255, 0, 255]);
        let t = out.to_tensor();
        assert_eq!(t.shape(), &[1, 3, 1, 2]);
        assert_eq!(t[[0, 0, 0, 0]], 1.0);
        assert_eq!(t[[0, 1, 0, 1]], 1.0);
        assert_eq!(t[[0, 2, 0, 0]], 0.0);
    }

    #[test]
    fn malformed_frame_is_counted_not_propagated() {
        let mut ex =
            FrameExtractor::new(ModelInput::default(), Rotation::Deg0, CameraFacing::Back).unwrap();
        let data = [0u8; 5];
        assert!(ex.extract_or_drop(&rgb_frame(&data, 4, 4)).is_none());
        assert_eq!(ex.dropped_frames(), 1);
    }

    #[test]
    fn odd_width_nv12_is_dropped_instead_of_panicking() {
        let mut ex =
            FrameExtractor::new(ModelInput::default(), Rotation::Deg0, CameraFacing::Back).unwrap();
        let data = [128u8; 9];
        let raw = RawFrame {
            data: &data,
            format: PixelFormat::Nv12,
            width: 3,
            height: 2,
            stride: 3,
            timestamp: Duration::ZERO,
            sequence: 1,
        };
        assert!(ex.extract_or_drop(&raw).is_none());
        assert_eq!(ex.dropped_frames(), 1);
    }

    #[test]
    fn recycled_buffer_is_reused() {
        let target = ModelInput { width: 2, height: 1, format: PixelFormat::Rgb24 };
        let mut ex = FrameExtractor::new(target, Rotation::Deg0, CameraFacing::Back).unwrap();
        let data = [9u8; 6];
        let first = ex.extract(&rgb_frame(&data, 2, 1)).unwrap();
        let ptr = first.pixels().as_ptr();
        ex.recycle(first.into_pixels());
        let second = ex.extract(&rgb_frame(&data, 2, 1)).unwrap();
        assert_eq!(second.pixels().as_ptr(), ptr);
    }

    #[test]
    fn debug_copy_converts_to_image() {
        let target = ModelInput { width: 2, height: 1, format: PixelFormat::Bgra32 };
        let mut ex = FrameExtractor::new(target, Rotation::Deg0, CameraFacing::Front).unwrap();
        let data = [10, 20, 30, 40, 50, 60];
        let frame = ex.extract(&rgb_frame(&data, 2, 1)).unwrap();
        assert_eq!(frame.transform, AffineTransform::mirrored());
        let img = frame.debug_copy().to_rgb_image().unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [40, 50, 60]);
    }
}
