//! Live overlay stream.
//!
//! Purely observational: reads the result cell at its own rate and never
//! touches correlator state.

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::{RendererSettings, SharedSettings};
use crate::detect::{Detection, ObjectClass};
use crate::frame::encode_jpeg;
use crate::pipeline::result_cell::SharedResultCell;
use crate::pipeline::stats::PipelineStats;

const BOX_THICKNESS: i32 = 3;

pub const MJPEG_BOUNDARY: &str = "frame";

#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub frame_seq: u64,
    /// Result-cell generation the overlay was drawn from.
    pub generation: u64,
}

impl EncodedFrame {
    /// One part of a `multipart/x-mixed-replace; boundary=frame` stream.
    pub fn mjpeg_part(&self) -> Vec<u8> {
        let mut part = Vec::with_capacity(self.jpeg.len() + 64);
        part.extend_from_slice(b"--");
        part.extend_from_slice(MJPEG_BOUNDARY.as_bytes());
        part.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
        part.extend_from_slice(&self.jpeg);
        part.extend_from_slice(b"\r\n");
        part
    }
}

/// Destination for rendered frames.
pub trait FrameSink: Send + Sync {
    fn emit(&self, frame: EncodedFrame);
}

/// Keeps only the newest rendered frame; viewers poll or wait on it.
#[derive(Default)]
pub struct LatestFrameSink {
    latest: Mutex<Option<Arc<EncodedFrame>>>,
    updated: Condvar,
}

impl LatestFrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Arc<EncodedFrame>> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait up to `timeout` for a frame with a generation newer than `seen`.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> Option<Arc<EncodedFrame>> {
        let guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .updated
            .wait_timeout_while(guard, timeout, |latest| {
                latest.as_ref().map_or(true, |f| f.generation <= seen)
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().filter(|f| f.generation > seen).cloned()
    }

    pub fn clear(&self) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl FrameSink for LatestFrameSink {
    fn emit(&self, frame: EncodedFrame) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(frame));
        self.updated.notify_all();
    }
}

pub fn class_color(class: ObjectClass) -> Rgb<u8> {
    match class {
        ObjectClass::NoHelmet => Rgb([255, 0, 0]),
        ObjectClass::Helmet => Rgb([0, 255, 0]),
        ObjectClass::Plate => Rgb([0, 0, 255]),
        ObjectClass::Vehicle => Rgb([255, 255, 0]),
        _ => Rgb([200, 200, 200]),
    }
}

/// Upscale to `display_width` when narrower, then outline every detection at
/// or above `display_threshold`.
pub fn draw_overlay<'a, I>(
    image: &RgbImage,
    detections: I,
    display_threshold: f32,
    display_width: u32,
) -> RgbImage
where
    I: IntoIterator<Item = &'a Detection>,
{
    let (mut canvas, scale) = if display_width > image.width() && image.width() > 0 {
        let scale = display_width as f32 / image.width() as f32;
        let height = ((image.height() as f32 * scale).round() as u32).max(1);
        (
            imageops::resize(image, display_width, height, FilterType::Triangle),
            scale,
        )
    } else {
        (image.clone(), 1.0)
    };

    for detection in detections {
        if detection.confidence < display_threshold {
            continue;
        }
        let b = &detection.bbox;
        let color = class_color(detection.class);
        for inset in 0..BOX_THICKNESS {
            let x = (b.x1 * scale).round() as i32 + inset;
            let y = (b.y1 * scale).round() as i32 + inset;
            let w = (b.width() * scale).round() as i32 - 2 * inset;
            let h = (b.height() * scale).round() as i32 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(w as u32, h as u32), color);
        }
    }
    canvas
}

pub struct Renderer {
    cell: Arc<SharedResultCell>,
    settings: Arc<SharedSettings>,
    params: RendererSettings,
    sink: Arc<dyn FrameSink>,
    stats: Arc<PipelineStats>,
    last_generation: u64,
}

impl Renderer {
    pub fn new(
        cell: Arc<SharedResultCell>,
        settings: Arc<SharedSettings>,
        params: RendererSettings,
        sink: Arc<dyn FrameSink>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            cell,
            settings,
            params,
            sink,
            stats,
            last_generation: 0,
        }
    }

    /// Render the latest snapshot if it changed. Returns whether a frame was emitted.
    pub fn render_once(&mut self) -> Result<bool> {
        let Some(snapshot) = self.cell.latest_since(self.last_generation) else {
            return Ok(false);
        };
        self.last_generation = snapshot.generation;
        let threshold = self.settings.snapshot().display_threshold;
        let canvas = draw_overlay(
            snapshot.frame.image(),
            snapshot.detections(),
            threshold,
            self.params.display_width,
        );
        let jpeg = encode_jpeg(&canvas, self.params.jpeg_quality)?;
        self.sink.emit(EncodedFrame {
            jpeg,
            frame_seq: snapshot.frame.seq,
            generation: snapshot.generation,
        });
        self.stats.frame_rendered();
        Ok(true)
    }

    pub fn run(mut self, stop: &AtomicBool) {
        let interval = self.params.interval();
        log::info!("renderer: started ({} fps)", self.params.fps);
        while !stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            if let Err(e) = self.render_once() {
                log::warn!("renderer: {:#}", e);
            }
            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        log::info!("renderer: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, DetectionSet};
    use crate::frame::Frame;

    #[test]
    fn overlay_upscales_and_colors_by_class() {
        let image = RgbImage::from_pixel(100, 50, Rgb([0, 0, 0]));
        let dets = [
            Detection::new(ObjectClass::NoHelmet, 0.9, BoundingBox::new(10.0, 10.0, 30.0, 30.0)),
            Detection::new(ObjectClass::Plate, 0.2, BoundingBox::new(50.0, 10.0, 70.0, 30.0)),
        ];
        let canvas = draw_overlay(&image, dets.iter(), 0.5, 200);
        assert_eq!((canvas.width(), canvas.height()), (200, 100));
        // Top-left corner of the scaled no-helmet box, and one pixel inside it.
        assert_eq!(*canvas.get_pixel(20, 20), Rgb([255, 0, 0]));
        assert_eq!(*canvas.get_pixel(22, 22), Rgb([255, 0, 0]));
        // Plate is below the display threshold.
        assert_eq!(*canvas.get_pixel(100, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn mjpeg_part_framing() {
        let part = EncodedFrame {
            jpeg: vec![0xFF, 0xD8],
            frame_seq: 1,
            generation: 1,
        }
        .mjpeg_part();
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(&[0xFF, 0xD8, b'\r', b'\n']));
    }

    #[test]
    fn renderer_emits_once_per_snapshot() -> Result<()> {
        let cell = Arc::new(SharedResultCell::new());
        let sink = Arc::new(LatestFrameSink::new());
        let stats = Arc::new(PipelineStats::default());
        let mut renderer = Renderer::new(
            cell.clone(),
            Arc::new(SharedSettings::default()),
            RendererSettings::default(),
            sink.clone(),
            stats.clone(),
        );
        assert!(!renderer.render_once()?);

        cell.publish(Frame::filled(64, 48, [10, 10, 10], 5), vec![DetectionSet::empty("m")]);
        assert!(renderer.render_once()?);
        assert!(!renderer.render_once()?);

        let frame = sink.wait_newer(0, Duration::from_millis(10)).expect("frame");
        assert_eq!(frame.frame_seq, 5);
        assert!(sink.wait_newer(frame.generation, Duration::from_millis(10)).is_none());
        assert_eq!(stats.snapshot().frames_rendered, 1);
        Ok(())
    }
}
