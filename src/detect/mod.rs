mod backend;
pub mod backends;
mod facade;
mod labels;
mod result;

pub use backend::DetectorBackend;
pub use backends::ScriptedBackend;
pub use facade::{DetectorFacade, InferenceOutput};
pub use labels::{parse_class, LabelMap};
pub use result::{BoundingBox, Detection, DetectionSet, ObjectClass, RawDetection};
