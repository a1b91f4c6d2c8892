use anyhow::Result;

use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Object detector backend.
///
/// Backends are stateless per call from the pipeline's point of view; model
/// loading happens at construction and `warm_up` runs once before the pipeline
/// starts. A backend that cannot warm up keeps the pipeline from starting.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &str;

    /// Run detection on a frame, dropping boxes below `recall_threshold`.
    ///
    /// Labels are the backend's own class names; the façade maps them.
    fn detect(&mut self, frame: &Frame, recall_threshold: f32) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: DetectorBackend + ?Sized> DetectorBackend for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame, recall_threshold: f32) -> Result<Vec<RawDetection>> {
        (**self).detect(frame, recall_threshold)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
