// sense-camera/src/gst_camera.rs
//! GStreamer capture backend: `libcamerasrc` (Pi) or `v4l2src` (PC webcam)
//! → `videoconvert` → `appsink`.
//!
//! Every sample is mapped and copied once into a buffer owned by the device,
//! so the `RawFrame` handed to the sink never outlives the gst sample.

use crate::{CameraConfig, CaptureDevice, CaptureSessionError, PixelFormat, RawFrame, Result};
use gst::prelude::*;
use log::{debug, info};
use std::time::Duration;

pub struct GstCamera {
    config: Option<CameraConfig>,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    scratch: Vec<u8>,
    sequence: u64,
}

impl Default for GstCamera {
    fn default() -> Self {
        Self::new()
    }
}

fn backend<E: std::error::Error + Send + Sync + 'static>(e: E) -> CaptureSessionError {
    CaptureSessionError::Backend(anyhow::Error::new(e))
}

impl GstCamera {
    pub fn new() -> Self {
        Self {
            config: None,
            pipeline: None,
            appsink: None,
            scratch: Vec::new(),
            sequence: 0,
        }
    }

    fn pipeline_description(config: &CameraConfig) -> String {
        let src = if gst::ElementFactory::find("libcamerasrc").is_some() {
            // Pi (libcamera) stack
            "libcamerasrc".to_string()
        } else {
            // PC webcam
            format!("v4l2src device={}", config.device)
        };
        let caps_format = match config.format {
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Rgb24 => "RGB",
            PixelFormat::Bgra32 => "BGRA",
        };
        // leaky queue: the driver keeps its pace even if we stall
        format!(
            "{src} ! videoconvert ! video/x-raw,format={fmt},width={w},height={h},framerate={f}/1 \
            ! queue leaky=2 max-size-buffers=2 ! appsink name=sink sync=false max-buffers=1 drop=true",
            src = src,
            fmt = caps_format,
            w = config.width,
            h = config.height,
            f = config.fps
        )
    }
}

impl CaptureDevice for GstCamera {
    fn name(&self) -> &str {
        self.config.as_ref().map_or("gstreamer", |c| c.device.as_str())
    }

    fn configure(&mut self, config: &CameraConfig) -> Result<()> {
        gst::init().map_err(backend)?;
        config.validate()?;
        self.config = Some(config.clone());
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        let config = self.config.as_ref().ok_or(CaptureSessionError::NotConfigured)?;
        let description = Self::pipeline_description(config);
        debug!("gst pipeline: {description}");

        let pipeline = gst::parse::launch(&description)
            .map_err(backend)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureSessionError::Backend(anyhow::anyhow!("not a gst::Pipeline")))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureSessionError::Backend(anyhow::anyhow!("appsink not found")))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CaptureSessionError::Backend(anyhow::anyhow!("appsink downcast failed")))?;

        if pipeline.set_state(gst::State::Playing).is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            // libcamera/v4l2 refuse Playing when another process holds the device
            return Err(CaptureSessionError::DeviceBusy(config.device.clone()));
        }

        info!("gst capture playing on {}", config.device);
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame<'_>>> {
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| CaptureSessionError::Unavailable("gst pipeline not open".into()))?;
        let format = self
            .config
            .as_ref()
            .map(|c| c.format)
            .ok_or(CaptureSessionError::NotConfigured)?;

        let Some(sample) = appsink.try_pull_sample(gst::ClockTime::from_nseconds(timeout.as_nanos() as u64))
        else {
            if appsink.is_eos() {
                return Err(CaptureSessionError::Unavailable("gst stream reached EOS".into()));
            }
            return Ok(None);
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureSessionError::Backend(anyhow::anyhow!("sample has no buffer")))?;
        let caps = sample
            .caps()
            .ok_or_else(|| CaptureSessionError::Backend(anyhow::anyhow!("sample has no caps")))?;
        let info = gst_video::VideoInfo::from_caps(caps).map_err(backend)?;
        let timestamp = buffer
            .pts()
            .map(|t| Duration::from_nanos(t.nseconds()))
            .unwrap_or(Duration::ZERO);

        // map + copy into our own buffer (one memcpy), then unmap
        let map = buffer.map_readable().map_err(backend)?;
        let stride = copy_planes(map.as_slice(), &info, format, &mut self.scratch)?;
        drop(map);

        self.sequence += 1;
        Ok(Some(RawFrame {
            data: &self.scratch,
            format,
            width: info.width(),
            height: info.height(),
            stride,
            timestamp,
            sequence: self.sequence,
        }))
    }

    fn close(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

fn out_of_bounds(what: &str) -> CaptureSessionError {
    CaptureSessionError::Backend(anyhow::anyhow!("gst buffer shorter than its caps: {what}"))
}

/// Copy a mapped sample into `out` in the single-stride layout `RawFrame`
/// describes, and return that stride.
///
/// videoconvert pads rows (RGB to 4 bytes) and may place the NV12 chroma
/// plane at its own offset and stride, so the layout comes from the caps.
fn copy_planes(
    data: &[u8],
    info: &gst_video::VideoInfo,
    format: PixelFormat,
    out: &mut Vec<u8>,
) -> Result<usize> {
    let strides = info.stride();
    let offsets = info.offset();
    let (Some(&stride), Some(&offset)) = (strides.first(), offsets.first()) else {
        return Err(out_of_bounds("no planes"));
    };
    let stride = stride as usize;
    let height = info.height() as usize;
    out.clear();

    let contiguous = match format {
        PixelFormat::Nv12 => {
            strides.get(1).map(|&s| s as usize) == Some(stride)
                && offsets.get(1) == Some(&(offset + stride * height))
        }
        PixelFormat::Rgb24 | PixelFormat::Bgra32 => true,
    };
    if contiguous {
        let len = format.frame_len(info.height(), stride);
        let frame = data.get(offset..offset + len).ok_or_else(|| out_of_bounds("frame"))?;
        out.extend_from_slice(frame);
        return Ok(stride);
    }

    // chroma plane lives elsewhere: repack both planes tightly
    let packed = format.min_stride(info.width());
    copy_rows(data, offset, stride, packed, height, out)?;
    let (&uv_stride, &uv_offset) = strides
        .get(1)
        .zip(offsets.get(1))
        .ok_or_else(|| out_of_bounds("chroma plane"))?;
    copy_rows(data, uv_offset, uv_stride as usize, packed, height.div_ceil(2), out)?;
    Ok(packed)
}

fn copy_rows(
    data: &[u8],
    offset: usize,
    stride: usize,
    row_bytes: usize,
    rows: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    for row in 0..rows {
        let start = offset + row * stride;
        let src = data.get(start..start + row_bytes).ok_or_else(|| out_of_bounds("row"))?;
        out.extend_from_slice(src);
    }
    Ok(())
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        self.close();
    }
}
