//! Frame-skip and downscale in front of any `FrameSource`.

use anyhow::Result;
use image::imageops::{self, FilterType};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Keep one frame out of every `frame_skip` (0 and 1 keep everything).
    pub frame_skip: u32,
    /// Downscale frames wider than this, preserving aspect ratio. `None` keeps
    /// the native resolution.
    pub max_width: Option<u32>,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            max_width: Some(640),
        }
    }
}

pub struct SourceAdapter {
    inner: Box<dyn FrameSource>,
    settings: AdapterSettings,
    read: u64,
    skipped: u64,
}

impl SourceAdapter {
    pub fn new(inner: Box<dyn FrameSource>, settings: AdapterSettings) -> Self {
        Self {
            inner,
            settings,
            read: 0,
            skipped: 0,
        }
    }

    /// Frames read from the inner source and discarded by frame-skip.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn keep(&mut self) -> bool {
        let every = u64::from(self.settings.frame_skip.max(1));
        self.read += 1;
        (self.read - 1) % every == 0
    }

    fn downscale(&self, frame: Frame) -> Frame {
        let Some(max_width) = self.settings.max_width else {
            return frame;
        };
        if max_width == 0 || frame.width() <= max_width {
            return frame;
        }
        let scale = max_width as f32 / frame.width() as f32;
        let height = ((frame.height() as f32 * scale).round() as u32).max(1);
        let resized = imageops::resize(frame.image(), max_width, height, FilterType::Triangle);
        frame.with_image(resized)
    }
}

impl FrameSource for SourceAdapter {
    fn connect(&mut self) -> Result<()> {
        self.inner.connect()
    }

    /// Reads through skipped frames; an error or end of stream from the inner
    /// source is returned immediately.
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some(frame) = self.inner.next_frame()? else {
                return Ok(None);
            };
            if self.keep() {
                return Ok(Some(self.downscale(frame)));
            }
            self.skipped += 1;
        }
    }

    fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }

    fn stats(&self) -> SourceStats {
        self.inner.stats()
    }

    fn release(&mut self) {
        self.inner.release()
    }
}
