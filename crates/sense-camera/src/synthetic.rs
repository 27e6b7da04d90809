// sense-camera/src/synthetic.rs
//! Paced test-pattern camera.
//!
//! Behaves like a driver from the pipeline's point of view: it delivers at
//! the configured nominal rate regardless of how long the sink takes, owns
//! one frame buffer that it overwrites on every capture, and can be told to
//! misbehave (busy on open, truncated buffers) to exercise error paths.

use crate::{CameraConfig, CaptureDevice, CaptureSessionError, PixelFormat, RawFrame, Result};
use std::thread;
use std::time::{Duration, Instant};

/// What the synthetic sensor "sees".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Diagonal gradient that scrolls one step per frame.
    Gradient,
    /// Uniform colour, given as RGB.
    Solid([u8; 3]),
}

pub struct SyntheticCamera {
    name: String,
    pattern: TestPattern,
    config: Option<CameraConfig>,
    buffer: Vec<u8>,
    stride: usize,
    open: bool,
    fail_open: bool,
    malformed_every: Option<u64>,
    sequence: u64,
    epoch: Instant,
    next_deadline: Instant,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticCamera {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            name: "synthetic0".to_string(),
            pattern: TestPattern::Gradient,
            config: None,
            buffer: Vec::new(),
            stride: 0,
            open: false,
            fail_open: false,
            malformed_every: None,
            sequence: 0,
            epoch: now,
            next_deadline: now,
        }
    }

    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Every `n`th frame is delivered with a truncated buffer.
    pub fn with_malformed_every(mut self, n: u64) -> Self {
        self.malformed_every = Some(n.max(1));
        self
    }

    /// Simulate another process holding the camera.
    pub fn failing_to_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    fn fill(&mut self, format: PixelFormat, width: u32, height: u32) {
        let (w, h) = (width as usize, height as usize);
        let shift = (self.sequence % 256) as usize;
        let stride = self.stride;
        let pattern = self.pattern;
        let buf = &mut self.buffer;

        let rgb_at = |x: usize, y: usize| -> [u8; 3] {
            match pattern {
                TestPattern::Solid(rgb) => rgb,
                TestPattern::Gradient => [
                    ((x * 255) / w.max(1)) as u8,
                    ((y * 255) / h.max(1)) as u8,
                    ((x + y + shift) % 256) as u8,
                ],
            }
        };

        match format {
            PixelFormat::Rgb24 | PixelFormat::Bgra32 => {
                let bgra = format == PixelFormat::Bgra32;
                let bpp = if bgra { 4 } else { 3 };
                for y in 0..h {
                    for x in 0..w {
                        let [r, g, b] = rgb_at(x, y);
                        let o = y * stride + x * bpp;
                        if bgra {
                            buf[o..o + 4].copy_from_slice(&[b, g, r, 255]);
                        } else {
                            buf[o..o + 3].copy_from_slice(&[r, g, b]);
                        }
                    }
                }
            }
            PixelFormat::Nv12 => {
                // BT.601 full range, chroma from the top-left pixel of each 2x2 block
                for y in 0..h {
                    for x in 0..w {
                        let [r, g, b] = rgb_at(x, y);
                        let (r, g, b) = (r as f32, g as f32, b as f32);
                        buf[y * stride + x] = (0.299 * r + 0.587 * g + 0.114 * b) as u8;
                        if y % 2 == 0 && x % 2 == 0 {
                            let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
                            let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
                            let o = h * stride + (y / 2) * stride + x;
                            buf[o] = u.clamp(0.0, 255.0) as u8;
                            buf[o + 1] = v.clamp(0.0, 255.0) as u8;
                        }
                    }
                }
            }
        }
    }
}

impl CaptureDevice for SyntheticCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, config: &CameraConfig) -> Result<()> {
        config.validate()?;
        self.stride = config.format.min_stride(config.width);
        self.buffer = vec![0u8; config.format.frame_len(config.height, self.stride)];
        self.config = Some(config.clone());
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(CaptureSessionError::DeviceBusy(self.name.clone()));
        }
        if self.config.is_none() {
            return Err(CaptureSessionError::NotConfigured);
        }
        self.open = true;
        self.next_deadline = Instant::now();
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame<'_>>> {
        if !self.open {
            return Err(CaptureSessionError::Unavailable(self.name.clone()));
        }
        let (format, width, height, interval) = match &self.config {
            Some(c) => (c.format, c.width, c.height, c.frame_interval()),
            None => return Err(CaptureSessionError::NotConfigured),
        };

        let now = Instant::now();
        if self.next_deadline > now + timeout {
            thread::sleep(timeout);
            return Ok(None);
        }
        if self.next_deadline > now {
            thread::sleep(self.next_deadline - now);
        }

        // a real sensor does not catch up on missed frames either
        self.next_deadline += interval;
        let after = Instant::now();
        if self.next_deadline < after {
            self.next_deadline = after + interval;
        }

        self.fill(format, width, height);
        self.sequence += 1;

        let truncated = self
            .malformed_every
            .is_some_and(|n| self.sequence % n == 0);
        let len = if truncated { self.buffer.len() / 2 } else { self.buffer.len() };

        Ok(Some(RawFrame {
            data: &self.buffer[..len],
            format,
            width,
            height,
            stride: self.stride,
            timestamp: self.epoch.elapsed(),
            sequence: self.sequence,
        }))
    }

    fn close(&mut self) {
        self.open = false;
    }
}
