//! Synthetic frame source (`stub://`).
//!
//! Generates solid frames with a slowly changing tint so consecutive frames
//! differ. Optionally ends after a fixed number of frames.

use anyhow::Result;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    /// End of stream after this many frames (`None` = endless).
    pub max_frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            uri: "stub://camera".to_string(),
            width: 640,
            height: 480,
            max_frames: None,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            connected: false,
        }
    }
}

impl FrameSource for SyntheticSource {
    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.uri);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(max) = self.config.max_frames {
            if self.frame_count >= max {
                return Ok(None);
            }
        }
        self.frame_count += 1;
        let shade = (self.frame_count % 256) as u8;
        Ok(Some(Frame::filled(
            self.config.width,
            self.config.height,
            [shade, 128, 255 - shade],
            self.frame_count,
        )))
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: self.config.uri.clone(),
        }
    }

    fn release(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_ends_after_max_frames() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig {
            max_frames: Some(2),
            ..SyntheticConfig::default()
        });
        source.connect()?;
        assert_eq!(source.next_frame()?.map(|f| f.seq), Some(1));
        assert_eq!(source.next_frame()?.map(|f| f.seq), Some(2));
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }
}
