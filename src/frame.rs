//! Frame types and the per-camera frame history.
//!
//! - `RawFrame`: decoded pixels exactly as a source produced them.
//! - `GrayFrame`: normalized single-channel frame at the camera's configured size.
//! - `FrameBuffer`: bounded history of normalized frames plus the baseline frame.
//!
//! `FrameBuffer` stores frames behind `Arc`, so readers only clone a pointer
//! while holding the lock. A reader observes the buffer either before or after
//! a `push`, never a partially written frame.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Hard cap on per-camera history length.
/// At 10 fps this is 30 seconds of normalized frames.
pub const MAX_HISTORY_FRAMES: usize = 300;

// ----------------------------------------------------------------------------
// RawFrame: source output
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Bgr24,
    Nv12,
}

impl PixelFormat {
    /// Byte length of a tightly packed frame in this format, `None` on overflow.
    pub fn expected_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Gray8 => Some(pixels),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels.checked_mul(3),
            PixelFormat::Nv12 => pixels.checked_add(pixels / 2),
        }
    }
}

/// Decoded frame handed over by a `FrameSource`.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Capture time, milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
}

impl RawFrame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
        captured_at_ms: u64,
    ) -> Self {
        Self {
            width,
            height,
            format,
            data,
            captured_at_ms,
        }
    }
}

// ----------------------------------------------------------------------------
// GrayFrame: normalized intensity frame
// ----------------------------------------------------------------------------

/// Normalized single-channel frame. Pixel storage is row-major, one byte per sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayFrame {
    camera_id: String,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    timestamp_ms: u64,
}

impl GrayFrame {
    pub fn new(
        camera_id: impl Into<String>,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        timestamp_ms: u64,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "gray frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            camera_id: camera_id.into(),
            width,
            height,
            pixels,
            timestamp_ms,
        })
    }

    /// Uniform frame, used for warm-up scenes and tests.
    pub fn filled(
        camera_id: impl Into<String>,
        width: u32,
        height: u32,
        value: u8,
        timestamp_ms: u64,
    ) -> Result<Self> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        Self::new(camera_id, width, height, vec![value; len], timestamp_ms)
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Sample at (x, y). Callers stay within `width` x `height`.
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.width as usize;
        &self.pixels[start..start + self.width as usize]
    }

    pub fn same_shape(&self, other: &GrayFrame) -> bool {
        self.width == other.width && self.height == other.height
    }

    pub fn to_image(&self) -> Result<image::GrayImage> {
        image::GrayImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("gray frame does not fit image buffer"))
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded history + baseline
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct FrameHistory {
    frames: VecDeque<Arc<GrayFrame>>,
    baseline: Option<Arc<GrayFrame>>,
    accepted: u64,
    baseline_set_at: u64,
}

/// Per-camera history of the most recent `capacity` normalized frames.
///
/// The baseline is set from the first pushed frame and afterwards only moves
/// through `maybe_refresh_baseline`.
#[derive(Debug)]
pub struct FrameBuffer {
    capacity: usize,
    inner: Mutex<FrameHistory>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("frame buffer capacity must be > 0"));
        }
        if capacity > MAX_HISTORY_FRAMES {
            return Err(anyhow!(
                "frame buffer capacity {} exceeds maximum {}",
                capacity,
                MAX_HISTORY_FRAMES
            ));
        }
        Ok(Self {
            capacity,
            inner: Mutex::new(FrameHistory {
                frames: VecDeque::with_capacity(capacity),
                baseline: None,
                accepted: 0,
                baseline_set_at: 0,
            }),
        })
    }

    // History state stays consistent across a panicking holder: every
    // mutation below completes before the guard is released.
    fn lock(&self) -> MutexGuard<'_, FrameHistory> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a normalized frame, evicting the oldest at capacity.
    /// Returns the number of frames accepted so far.
    pub fn push(&self, frame: GrayFrame) -> u64 {
        let frame = Arc::new(frame);
        let mut history = self.lock();
        while history.frames.len() >= self.capacity {
            history.frames.pop_front();
        }
        history.frames.push_back(Arc::clone(&frame));
        history.accepted += 1;
        if history.baseline.is_none() {
            history.baseline = Some(frame);
            history.baseline_set_at = history.accepted;
        }
        history.accepted
    }

    /// Most recently pushed frame.
    pub fn current(&self) -> Option<Arc<GrayFrame>> {
        self.lock().frames.back().cloned()
    }

    pub fn baseline(&self) -> Option<Arc<GrayFrame>> {
        self.lock().baseline.clone()
    }

    /// Current and baseline frames taken under one lock.
    pub fn pair(&self) -> Option<(Arc<GrayFrame>, Arc<GrayFrame>)> {
        let history = self.lock();
        let current = history.frames.back().cloned()?;
        let baseline = history.baseline.clone()?;
        Some((current, baseline))
    }

    /// Replace the baseline with the current frame when no detection is in
    /// progress and at least `interval` frames were accepted since the last
    /// refresh. An interval of zero disables periodic refresh.
    pub fn maybe_refresh_baseline(&self, detection_active: bool, interval: u64) -> bool {
        if detection_active || interval == 0 {
            return false;
        }
        let mut history = self.lock();
        if history.accepted.saturating_sub(history.baseline_set_at) < interval {
            return false;
        }
        let Some(current) = history.frames.back().cloned() else {
            return false;
        };
        history.baseline = Some(current);
        history.baseline_set_at = history.accepted;
        true
    }

    /// Snapshot of the buffered frames, oldest first.
    pub fn frames(&self) -> Vec<Arc<GrayFrame>> {
        self.lock().frames.iter().cloned().collect()
    }

    pub fn accepted(&self) -> u64 {
        self.lock().accepted
    }

    pub fn frames_since_baseline(&self) -> u64 {
        let history = self.lock();
        history.accepted.saturating_sub(history.baseline_set_at)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(value: u8, ts: u64) -> GrayFrame {
        GrayFrame::filled("cam-1", 8, 4, value, ts).unwrap()
    }

    #[test]
    fn gray_frame_rejects_length_mismatch() {
        assert!(GrayFrame::new("cam-1", 4, 4, vec![0; 15], 0).is_err());
        assert!(GrayFrame::new("cam-1", 0, 4, vec![], 0).is_err());
        assert!(GrayFrame::new("cam-1", 4, 4, vec![0; 16], 0).is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(FrameBuffer::new(0).is_err());
        assert!(FrameBuffer::new(MAX_HISTORY_FRAMES + 1).is_err());
    }

    #[test]
    fn frame_buffer_holds_most_recent_frames() {
        let buf = FrameBuffer::new(3).unwrap();
        for i in 0..7u8 {
            buf.push(frame(i, i as u64));
            assert!(buf.len() <= 3);
            assert_eq!(buf.len(), (i as usize + 1).min(3));
        }
        let stamps: Vec<u64> = buf.frames().iter().map(|f| f.timestamp_ms()).collect();
        assert_eq!(stamps, vec![4, 5, 6]);
        assert_eq!(buf.current().unwrap().timestamp_ms(), 6);
        assert_eq!(buf.accepted(), 7);
    }

    #[test]
    fn baseline_comes_from_first_frame() {
        let buf = FrameBuffer::new(2).unwrap();
        assert!(buf.baseline().is_none());
        assert!(buf.pair().is_none());
        buf.push(frame(10, 1));
        buf.push(frame(20, 2));
        buf.push(frame(30, 3));
        assert_eq!(buf.baseline().unwrap().timestamp_ms(), 1);
        let (current, baseline) = buf.pair().unwrap();
        assert_eq!(current.timestamp_ms(), 3);
        assert_eq!(baseline.timestamp_ms(), 1);
    }

    #[test]
    fn baseline_refresh_waits_for_interval() {
        let buf = FrameBuffer::new(4).unwrap();
        buf.push(frame(10, 1));
        buf.push(frame(11, 2));
        assert!(!buf.maybe_refresh_baseline(false, 3));
        buf.push(frame(12, 3));
        buf.push(frame(13, 4));
        assert!(buf.maybe_refresh_baseline(false, 3));
        assert_eq!(buf.baseline().unwrap().timestamp_ms(), 4);
        assert_eq!(buf.frames_since_baseline(), 0);
    }

    #[test]
    fn baseline_refresh_suspended_while_detecting() {
        let buf = FrameBuffer::new(4).unwrap();
        for i in 0..10u8 {
            buf.push(frame(i, i as u64));
        }
        assert!(!buf.maybe_refresh_baseline(true, 1));
        assert!(!buf.maybe_refresh_baseline(false, 0));
        assert_eq!(buf.baseline().unwrap().timestamp_ms(), 0);
    }

    #[test]
    fn concurrent_readers_see_whole_frames() {
        let buf = Arc::new(FrameBuffer::new(5).unwrap());
        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for i in 0..500u64 {
                    buf.push(frame((i % 250) as u8, i));
                }
            })
        };
        for _ in 0..500 {
            if let Some(current) = buf.current() {
                let first = current.pixels()[0];
                assert!(current.pixels().iter().all(|p| *p == first));
            }
            assert!(buf.len() <= 5);
        }
        writer.join().unwrap();
        assert_eq!(buf.accepted(), 500);
    }
}
