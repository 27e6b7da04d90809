// sense-preprocess/src/convert.rs
//! Crop-then-convert kernels. Only the pixels inside the crop window are
//! ever decoded.

use crate::{ConversionError, Result};
use sense_camera::{PixelFormat, RawFrame};

/// Region of the source frame fed to the resizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// Largest centred window of `src` with the aspect ratio of `dst`.
pub fn center_crop(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> CropRect {
    let (sw, sh) = (src_w as u64, src_h as u64);
    let (dw, dh) = (dst_w.max(1) as u64, dst_h.max(1) as u64);

    let (cw, ch) = if sw * dh > sh * dw {
        // source is wider: trim left and right
        ((sh * dw / dh).max(1), sh)
    } else {
        (sw, (sw * dh / dw).max(1))
    };

    CropRect {
        x: ((sw - cw) / 2) as usize,
        y: ((sh - ch) / 2) as usize,
        width: cw as usize,
        height: ch as usize,
    }
}

/// Reject buffers the driver handed us half-filled or with a bogus layout.
pub fn validate(frame: &RawFrame<'_>) -> Result<()> {
    if frame.width == 0 || frame.height == 0 {
        return Err(ConversionError::EmptyFrame);
    }
    let min_stride = frame.format.min_stride(frame.width);
    if frame.stride < min_stride {
        return Err(ConversionError::StrideTooSmall {
            stride: frame.stride,
            min: min_stride,
        });
    }
    let expected = frame.format.frame_len(frame.height, frame.stride);
    if frame.data.len() < expected {
        return Err(ConversionError::BufferTooSmall {
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

/// Decode the `crop` window of `frame` into packed RGB24 (`out` is resized).
pub fn crop_to_rgb(frame: &RawFrame<'_>, crop: CropRect, out: &mut Vec<u8>) -> Result<()> {
    validate(frame)?;
    out.clear();
    out.resize(crop.width * crop.height * 3, 0);

    match frame.format {
        PixelFormat::Rgb24 => {
            let row_bytes = crop.width * 3;
            for (j, dst) in out.chunks_exact_mut(row_bytes).enumerate() {
                let start = (crop.y + j) * frame.stride + crop.x * 3;
                dst.copy_from_slice(&frame.data[start..start + row_bytes]);
            }
        }
        PixelFormat::Bgra32 => {
            for (j, dst) in out.chunks_exact_mut(crop.width * 3).enumerate() {
                let start = (crop.y + j) * frame.stride + crop.x * 4;
                let src = &frame.data[start..start + crop.width * 4];
                for (px, bgra) in dst.chunks_exact_mut(3).zip(src.chunks_exact(4)) {
                    px[0] = bgra[2];
                    px[1] = bgra[1];
                    px[2] = bgra[0];
                }
            }
        }
        PixelFormat::Nv12 => {
            let (y_plane, uv_plane) = frame.data.split_at(frame.stride * frame.height as usize);
            nv12_window_to_rgb(y_plane, uv_plane, frame.stride, crop, out);
        }
    }
    Ok(())
}

/// NV12 4:2:0 → RGB24 over a window (BT.601, full range).
fn nv12_window_to_rgb(y: &[u8], uv: &[u8], stride: usize, crop: CropRect, out: &mut [u8]) {
    for j in 0..crop.height {
        let sy = crop.y + j;
        for i in 0..crop.width {
            let sx = crop.x + i;
            let y_val = y[sy * stride + sx] as f32;
            let uv_idx = (sy / 2) * stride + (sx & !1);
            let u = uv[uv_idx] as f32 - 128.0;
            let v = uv[uv_idx + 1] as f32 - 128.0;

            let r = (y_val + 1.402 * v).clamp(0.0, 255.0);
            let g = (y_val - 0.344_13 * u - 0.714_14 * v).clamp(0.0, 255.0);
            let b = (y_val + 1.772 * u).clamp(0.0, 255.0);

            let base = (j * crop.width + i) * 3;
            out[base] = r as u8;
            out[base + 1] = g as u8;
            out[base + 2] = b as u8;
        }
    }
}

/// Packed RGB24 → BGRA32 with opaque alpha.
pub fn rgb_to_bgra(rgb: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(rgb.len() / 3 * 4);
    for px in rgb.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0], 255]);
    }
}
