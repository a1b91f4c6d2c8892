//! RTSP frame source.
//!
//! This module provides `RtspSource` for ingesting frames from IP cameras via RTSP.
//! Decoding goes through a GStreamer appsink that keeps at most one buffered
//! sample, so a slow consumer never builds a backlog inside GStreamer either.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Expected stream frame rate, used for stall detection.
    pub expected_fps: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            expected_fps: 30,
        }
    }
}

/// RTSP frame source.
pub struct RtspSource {
    #[cfg(feature = "rtsp-gstreamer")]
    inner: GstreamerRtspSource,
    #[cfg(not(feature = "rtsp-gstreamer"))]
    config: RtspConfig,
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(Self {
                inner: GstreamerRtspSource::new(config)?,
            })
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            anyhow::bail!("RTSP requires the rtsp-gstreamer feature ({})", config.url)
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        self.inner.connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.inner.next_frame()
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

#[cfg(not(feature = "rtsp-gstreamer"))]
impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        anyhow::bail!("RTSP requires the rtsp-gstreamer feature")
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        anyhow::bail!("RTSP requires the rtsp-gstreamer feature")
    }

    fn is_healthy(&self) -> bool {
        false
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: 0,
            uri: self.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if self.appsink.is_eos() {
            return Ok(None);
        }

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                self.frame_timeout().as_millis() as u64,
            ))
            .ok_or_else(|| anyhow::anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Frame::from_rgb(pixels, width, height, self.frame_count).map(Some)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.frame_timeout() * 3
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: self.config.url.clone(),
        }
    }

    fn release(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline: {}", e);
        }
        self.connected_at = None;
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.expected_fps == 0 {
            500
        } else {
            (1000 / self.config.expected_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
