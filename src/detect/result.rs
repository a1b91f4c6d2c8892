use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame pixel space (`x1,y1` top-left, `x2,y2` bottom-right).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Edges are inside: a point exactly on the border is contained.
    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    pub fn clamp_to(&self, width: f32, height: f32) -> Self {
        Self {
            x1: self.x1.clamp(0.0, width),
            y1: self.y1.clamp(0.0, height),
            x2: self.x2.clamp(0.0, width),
            y2: self.y2.clamp(0.0, height),
        }
    }

    /// Grow each edge by a multiple of the box's own size.
    ///
    /// `up`/`down` scale with height, `sides` with width (applied left and right).
    pub fn expand(&self, up: f32, down: f32, sides: f32) -> Self {
        let w = self.width();
        let h = self.height();
        Self {
            x1: self.x1 - w * sides,
            y1: self.y1 - h * up,
            x2: self.x2 + w * sides,
            y2: self.y2 + h * down,
        }
    }

    pub fn intersection_over_union(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox::new(
            self.x1.max(other.x1),
            self.y1.max(other.y1),
            self.x2.min(other.x2),
            self.y2.min(other.y2),
        )
        .area();
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Semantic class of a detection after label mapping.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectClass {
    Helmet,
    NoHelmet,
    Plate,
    Vehicle,
    Other,
}

impl ObjectClass {
    /// Plates and vehicles anchor rider association.
    pub fn is_anchor(self) -> bool {
        matches!(self, ObjectClass::Plate | ObjectClass::Vehicle)
    }

    pub fn is_rider(self) -> bool {
        matches!(self, ObjectClass::Helmet | ObjectClass::NoHelmet)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClass::Helmet => "helmet",
            ObjectClass::NoHelmet => "no-helmet",
            ObjectClass::Plate => "plate",
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Other => "other",
        }
    }
}

/// Box straight out of a backend, before label mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            bbox,
            label: label.into(),
            confidence,
        }
    }
}

/// Normalized detection shared by the correlator and renderer.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class: ObjectClass,
    /// Detector label as produced, kept for overlays.
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(class: ObjectClass, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            bbox,
            class,
            label: class.as_str().to_string(),
            confidence,
        }
    }
}

/// All detections one backend produced for one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionSet {
    /// Backend name, e.g. "rider-model" or "plate-model".
    pub source: String,
    pub detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn new(source: impl Into<String>, detections: Vec<Detection>) -> Self {
        Self {
            source: source.into(),
            detections,
        }
    }

    pub fn empty(source: impl Into<String>) -> Self {
        Self::new(source, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Detections at or above `min_confidence`, in detector order.
    pub fn confident(&self, min_confidence: f32) -> impl Iterator<Item = &Detection> + '_ {
        self.detections
            .iter()
            .filter(move |d| d.confidence >= min_confidence)
    }
}
