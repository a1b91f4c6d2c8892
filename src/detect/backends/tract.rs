#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, RawDetection};
use crate::frame::Frame;

const NMS_IOU: f32 = 0.45;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single `[1, 4 + classes, anchors]` output with centre-format boxes
/// in model input pixels followed by per-class scores.
pub struct TractYoloBackend {
    name: String,
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    class_names: Vec<String>,
}

impl TractYoloBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        name: impl Into<String>,
        model_path: P,
        input_size: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        if class_names.is_empty() {
            return Err(anyhow!("detector class names must not be empty"));
        }
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            name: name.into(),
            model,
            input_size,
            class_names,
        })
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let side = self.input_size;
        let resized = image::imageops::resize(
            frame.image(),
            side,
            side,
            image::imageops::FilterType::Triangle,
        );
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn decode(&self, output: &Tensor, frame: &Frame, recall: f32) -> Result<Vec<RawDetection>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[1] != 4 + self.class_names.len() {
            return Err(anyhow!(
                "unexpected output shape {:?} for {} classes",
                shape,
                self.class_names.len()
            ));
        }
        let anchors = shape[2];
        let sx = frame.width() as f32 / self.input_size as f32;
        let sy = frame.height() as f32 / self.input_size as f32;

        let mut candidates: Vec<(usize, RawDetection)> = Vec::new();
        for i in 0..anchors {
            let mut best_class = 0;
            let mut best_score = 0.0f32;
            for c in 0..self.class_names.len() {
                let score = view[[0, 4 + c, i]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if best_score < recall {
                continue;
            }
            let cx = view[[0, 0, i]];
            let cy = view[[0, 1, i]];
            let w = view[[0, 2, i]];
            let h = view[[0, 3, i]];
            let bbox = BoundingBox::new(
                (cx - w / 2.0) * sx,
                (cy - h / 2.0) * sy,
                (cx + w / 2.0) * sx,
                (cy + h / 2.0) * sy,
            )
            .clamp_to(frame.width() as f32, frame.height() as f32);
            candidates.push((
                best_class,
                RawDetection::new(self.class_names[best_class].clone(), best_score, bbox),
            ));
        }

        Ok(nms_per_class(candidates, NMS_IOU))
    }
}

fn nms_per_class(mut candidates: Vec<(usize, RawDetection)>, iou: f32) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence));
    let mut keep: Vec<(usize, RawDetection)> = Vec::new();
    for (class, det) in candidates {
        let suppressed = keep
            .iter()
            .any(|(k, kept)| *k == class && kept.bbox.intersection_over_union(&det.bbox) >= iou);
        if !suppressed {
            keep.push((class, det));
        }
    }
    keep.into_iter().map(|(_, det)| det).collect()
}

impl DetectorBackend for TractYoloBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, frame: &Frame, recall_threshold: f32) -> Result<Vec<RawDetection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        self.decode(output, frame, recall_threshold)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size;
        let blank = Frame::filled(side, side, [114, 114, 114], 0);
        self.detect(&blank, 1.0).map(|_| ())
    }
}
