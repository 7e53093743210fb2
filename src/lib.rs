//! Occupancy Kernel
//!
//! Drives smart devices from live camera occupancy.
//!
//! # Architecture
//!
//! Three tasks share one explicitly constructed `CameraRegistry`:
//!
//! 1. **Frame refresh** (`refresh`): reads a frame per camera, runs the
//!    detector, counts confident person detections and publishes the
//!    annotated frame with its count atomically.
//! 2. **Automation** (`automation`): every tick, debounces each automated
//!    device's room occupancy into enable/disable commits through a
//!    `DeviceStore`. Manual devices are never touched.
//! 3. **Status API** (`api`): read-only frame and count queries.
//!
//! # Module Structure
//!
//! - `detect`: detector boundary (trait, results, backends)
//! - `ingest`: capture sources (device index, RTSP, HTTP, synthetic)
//! - `frame`: RGB frames, annotation overlay, JPEG encoding
//! - `registry`: camera map, capture handles, reconnect backoff
//! - `store`: device persistence (SQLite, in-memory)
//! - `config`: daemon configuration

pub mod api;
pub mod automation;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod refresh;
pub mod registry;
pub mod store;

pub use automation::{AutomationScheduler, OccupancySource, TickReport};
pub use detect::{shared, DetectorBackend, SharedDetector};
pub use frame::Frame;
pub use ingest::{CameraSource, Capture, DefaultOpener, SourceOpener};
pub use refresh::FrameRefresher;
pub use registry::{BackoffPolicy, CameraRegistry, CameraSnapshot, CameraStatus};
pub use store::{DeviceDescriptor, DeviceStore, InMemoryDeviceStore, SqliteDeviceStore, Thresholds};
