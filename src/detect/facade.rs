use anyhow::{anyhow, Context, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::labels::LabelMap;
use crate::detect::result::{Detection, DetectionSet};
use crate::frame::Frame;

/// Output of one inference cycle.
#[derive(Clone, Debug, Default)]
pub struct InferenceOutput {
    /// One set per configured backend, in registration order.
    pub sets: Vec<DetectionSet>,
    /// Backends that failed this cycle (their sets are empty).
    pub failures: usize,
}

/// Runs every configured backend on a frame and normalizes the results.
///
/// Backends run in sequence; no ordering dependency exists between them. A
/// backend error yields an empty set for that source so one bad cycle never
/// takes down the inference worker.
pub struct DetectorFacade {
    backends: Vec<Box<dyn DetectorBackend>>,
    labels: LabelMap,
}

impl DetectorFacade {
    pub fn new(labels: LabelMap) -> Self {
        Self {
            backends: Vec::new(),
            labels,
        }
    }

    /// Register a backend. Names must be unique.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) -> Result<()> {
        if self.backends.iter().any(|b| b.name() == backend.name()) {
            return Err(anyhow!("detector '{}' already registered", backend.name()));
        }
        self.backends.push(Box::new(backend));
        Ok(())
    }

    pub fn with_backend<B: DetectorBackend + 'static>(mut self, backend: B) -> Result<Self> {
        self.register(backend)?;
        Ok(self)
    }

    /// List registered backends.
    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Warm every backend up. Any failure is fatal for pipeline start.
    pub fn warm_up(&mut self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(anyhow!("no detector backends configured"));
        }
        for backend in &mut self.backends {
            let name = backend.name().to_string();
            backend
                .warm_up()
                .with_context(|| format!("detector '{}' failed to warm up", name))?;
        }
        Ok(())
    }

    /// Run all backends on `frame`, keeping boxes at or above `recall_threshold`.
    pub fn run(&mut self, frame: &Frame, recall_threshold: f32) -> InferenceOutput {
        let mut output = InferenceOutput::default();
        for backend in &mut self.backends {
            let source = backend.name().to_string();
            match backend.detect(frame, recall_threshold) {
                Ok(raw) => {
                    let detections = raw
                        .into_iter()
                        .filter(|d| d.confidence >= recall_threshold)
                        .map(|d| Detection {
                            class: self.labels.classify(&d.label),
                            bbox: d.bbox,
                            label: d.label,
                            confidence: d.confidence.clamp(0.0, 1.0),
                        })
                        .collect();
                    output.sets.push(DetectionSet::new(source, detections));
                }
                Err(e) => {
                    log::warn!("detector '{}' failed on frame {}: {:#}", source, frame.seq, e);
                    output.failures += 1;
                    output.sets.push(DetectionSet::empty(source));
                }
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedBackend;
    use crate::detect::result::{BoundingBox, ObjectClass, RawDetection};

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &str {
            "broken"
        }

        fn detect(&mut self, _frame: &Frame, _recall: f32) -> Result<Vec<RawDetection>> {
            Err(anyhow!("model exploded"))
        }
    }

    struct ColdBackend;

    impl DetectorBackend for ColdBackend {
        fn name(&self) -> &str {
            "cold"
        }

        fn detect(&mut self, _frame: &Frame, _recall: f32) -> Result<Vec<RawDetection>> {
            Ok(Vec::new())
        }

        fn warm_up(&mut self) -> Result<()> {
            Err(anyhow!("weights missing"))
        }
    }

    fn rider_backend() -> ScriptedBackend {
        ScriptedBackend::fixed(
            "rider-model",
            vec![
                RawDetection::new("no-helmet", 0.8, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
                RawDetection::new("helmet", 0.2, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            ],
        )
    }

    #[test]
    fn run_maps_labels_and_applies_recall_floor() {
        let mut facade = DetectorFacade::new(LabelMap::default())
            .with_backend(rider_backend())
            .unwrap();
        let frame = Frame::filled(32, 32, [0, 0, 0], 1);
        let out = facade.run(&frame, 0.3);

        assert_eq!(out.failures, 0);
        assert_eq!(out.sets.len(), 1);
        assert_eq!(out.sets[0].source, "rider-model");
        assert_eq!(out.sets[0].detections.len(), 1);
        assert_eq!(out.sets[0].detections[0].class, ObjectClass::NoHelmet);
    }

    #[test]
    fn failing_backend_yields_empty_set() {
        let mut facade = DetectorFacade::new(LabelMap::default())
            .with_backend(FailingBackend)
            .unwrap()
            .with_backend(rider_backend())
            .unwrap();
        let frame = Frame::filled(32, 32, [0, 0, 0], 1);
        let out = facade.run(&frame, 0.3);

        assert_eq!(out.failures, 1);
        assert_eq!(out.sets.len(), 2);
        assert!(out.sets[0].is_empty());
        assert_eq!(out.sets[1].detections.len(), 1);
    }

    #[test]
    fn warm_up_failure_is_reported() {
        let mut facade = DetectorFacade::new(LabelMap::default())
            .with_backend(ColdBackend)
            .unwrap();
        let err = facade.warm_up().unwrap_err();
        assert!(format!("{:#}", err).contains("cold"));
    }

    #[test]
    fn empty_facade_cannot_warm_up() {
        let mut facade = DetectorFacade::new(LabelMap::default());
        assert!(facade.warm_up().is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut facade = DetectorFacade::new(LabelMap::default());
        facade.register(rider_backend()).unwrap();
        assert!(facade.register(rider_backend()).is_err());
    }
}
