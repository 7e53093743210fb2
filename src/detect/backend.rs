use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::detect::result::DetectionResult;

/// Detector backend trait.
///
/// This is the boundary between the occupancy core and whatever model does the
/// actual inference. The core only filters the returned detections by
/// confidence and class; it never depends on model internals.
///
/// `pixels` is tightly packed RGB24, `width * height * 3` bytes.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. May be slow (tens of milliseconds).
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Detector shared between the refresh workers.
pub type SharedDetector = Arc<Mutex<dyn DetectorBackend>>;

/// Wrap a backend for sharing across threads.
pub fn shared<B: DetectorBackend + 'static>(backend: B) -> SharedDetector {
    Arc::new(Mutex::new(backend))
}
