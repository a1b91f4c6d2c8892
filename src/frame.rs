//! Frame ownership and the acquisition → inference handoff.
//!
//! - `Frame`: one decoded RGB image plus its capture sequence number and timestamp.
//! - `FrameChannel`: small bounded buffer between the producer and inference workers.
//!   Pushing never blocks; when full the oldest frame is evicted so inference always
//!   sees the freshest frame.
//!
//! Frames move by value through the channel. Once a frame reaches the result cell
//! it is immutable and shared behind an `Arc`, so no stage can observe another
//! stage mutating pixels.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use crate::detect::BoundingBox;

/// Default channel capacity. Inference is the bottleneck, so backlog is useless.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured video frame (RGB8).
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Monotonic sequence number assigned by the source.
    pub seq: u64,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            captured_at: SystemTime::now(),
        }
    }

    /// Build a frame from packed RGB24 bytes.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))?;
        Ok(Self::new(image, seq))
    }

    /// Solid-colour frame, mostly useful for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], seq: u64) -> Self {
        Self::new(RgbImage::from_pixel(width, height, image::Rgb(rgb)), seq)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Replace the pixel data, keeping sequence number and capture time.
    pub fn with_image(self, image: RgbImage) -> Self {
        Self {
            image,
            seq: self.seq,
            captured_at: self.captured_at,
        }
    }

    /// Whole-frame rectangle in pixel space.
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(0.0, 0.0, self.width() as f32, self.height() as f32)
    }

    /// Copy out a region. The region is clamped to the frame; `None` when nothing
    /// of it remains.
    pub fn crop(&self, region: &BoundingBox) -> Option<RgbImage> {
        let clamped = region.clamp_to(self.width() as f32, self.height() as f32);
        let x = clamped.x1.floor().max(0.0) as u32;
        let y = clamped.y1.floor().max(0.0) as u32;
        let x2 = (clamped.x2.ceil() as u32).min(self.width());
        let y2 = (clamped.y2.ceil() as u32).min(self.height());
        if x2 <= x || y2 <= y {
            return None;
        }
        Some(image::imageops::crop_imm(&self.image, x, y, x2 - x, y2 - y).to_image())
    }
}

/// Encode an RGB image as JPEG at the given quality (1..=100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode_image(image)
        .context("jpeg encode failed")?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// FrameChannel: bounded, drop-oldest
// ----------------------------------------------------------------------------

/// Bounded frame buffer with drop-oldest backpressure.
///
/// `push` never blocks the producer. `pop` blocks the consumer up to a timeout.
pub struct FrameChannel {
    queue: Mutex<VecDeque<Frame>>,
    ready: Condvar,
    capacity: usize,
    evicted: AtomicU64,
}

impl FrameChannel {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a frame, evicting the oldest buffered frames if at capacity.
    /// Returns how many frames were evicted.
    pub fn push(&self, frame: Frame) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let mut evicted = 0;
        while queue.len() >= self.capacity {
            queue.pop_front();
            evicted += 1;
        }
        queue.push_back(frame);
        drop(queue);

        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    /// Take the oldest buffered frame, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<Frame> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut queue, _) = self
            .ready
            .wait_timeout_while(queue, timeout, |q| q.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        queue.pop_front()
    }

    /// Discard everything buffered. Returns the number of frames dropped.
    pub fn drain(&self) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let n = queue.len();
        queue.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames evicted by backpressure since creation.
    pub fn evicted_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for FrameChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
