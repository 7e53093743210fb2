mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::{shared, DetectorBackend, SharedDetector};
pub use backends::{ScriptStep, ScriptedBackend};
pub use registry::{select_model_backend, BackendRegistry};
pub use result::{BoundingBox, Detection, DetectionResult, ObjectClass};
