//! Frame ingestion sources.
//!
//! This module provides different sources for frames:
//! - Synthetic frames (`stub://name`, tests and demos)
//! - Directories of still images (`dir:///path` or a plain local path)
//! - RTSP streams (feature: rtsp-gstreamer)
//!
//! All sources produce `Frame` values that the producer worker hands to the
//! frame channel. `SourceAdapter` sits in front of any source and applies
//! frame-skip and downscaling before the handoff.

pub mod adapter;
pub mod image_dir;
pub mod rtsp;
pub mod synthetic;

use anyhow::Result;

use crate::frame::Frame;

pub use adapter::{AdapterSettings, SourceAdapter};
pub use image_dir::ImageDirSource;
pub use rtsp::{RtspConfig, RtspSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// A capture source.
///
/// `next_frame` returns `Ok(None)` at end of stream. Errors are treated as
/// transient by the producer and retried with backoff.
pub trait FrameSource: Send {
    /// Acquire the underlying device or stream. Failure is fatal at startup.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool;

    /// Get frame statistics.
    fn stats(&self) -> SourceStats;

    /// Release the device or stream. Called once when the producer exits.
    fn release(&mut self) {}
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub uri: String,
}

/// Open a source from a URI.
///
/// - `stub://name` → synthetic frames of `width`x`height`
/// - `rtsp://...` → RTSP (requires the rtsp-gstreamer feature)
/// - `dir:///path` or a plain path → still images from a local directory
pub fn open_source(uri: &str, width: u32, height: u32) -> Result<Box<dyn FrameSource>> {
    let uri = uri.trim();
    if uri.is_empty() {
        anyhow::bail!("frame source uri must not be empty");
    }
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            uri: uri.to_string(),
            width,
            height,
            ..SyntheticConfig::default()
        })));
    }
    if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        return Ok(Box::new(RtspSource::new(RtspConfig {
            url: uri.to_string(),
            ..RtspConfig::default()
        })?));
    }
    let path = uri.strip_prefix("dir://").unwrap_or(uri);
    if path.contains("://") {
        anyhow::bail!("unsupported frame source uri '{}'", uri);
    }
    Ok(Box::new(ImageDirSource::new(path, true)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_source_picks_synthetic_for_stub_uri() -> Result<()> {
        let mut source = open_source("stub://gate", 64, 48)?;
        source.connect()?;
        let frame = source.next_frame()?.expect("frame");
        assert_eq!(frame.width(), 64);
        assert_eq!(source.stats().uri, "stub://gate");
        Ok(())
    }

    #[test]
    fn open_source_rejects_unknown_scheme() {
        assert!(open_source("http://camera/stream", 64, 48).is_err());
        assert!(open_source("  ", 64, 48).is_err());
    }
}
