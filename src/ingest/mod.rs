//! Capture sources.
//!
//! A camera is configured with a source string. Strings that parse as an
//! unsigned integer name a local capture device by index; anything else is a
//! stream URI:
//! - `stub://...` synthetic frames (tests, demos)
//! - `rtsp://...` IP cameras (feature: rtsp-gstreamer)
//! - `http(s)://...` MJPEG/JPEG endpoints (feature: ingest-http)
//! - `/dev/videoN` or a device index (feature: ingest-v4l2)
//!
//! Opening a source yields a `Capture`, the exclusively owned capture handle.
//! Dropping the handle releases the underlying device or stream.

#[cfg(feature = "ingest-http")]
pub mod http;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod scripted;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::fmt;

use crate::frame::Frame;

pub use scripted::{ReadStep, ScriptedOpener};
pub use synthetic::SyntheticSource;

/// Where a camera's frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CameraSource {
    /// Local capture device index (`0` is the default webcam).
    Device(u32),
    /// Network stream or other URI.
    Stream(String),
}

impl CameraSource {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("camera source must not be empty"));
        }
        match raw.parse::<u32>() {
            Ok(index) => Ok(CameraSource::Device(index)),
            Err(_) => Ok(CameraSource::Stream(raw.to_string())),
        }
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSource::Device(index) => write!(f, "{}", index),
            CameraSource::Stream(uri) => f.write_str(uri),
        }
    }
}

/// An open capture handle.
pub trait Capture: Send {
    /// Read the next frame. Errors mean the handle should be reconnected.
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Opens capture handles for sources.
///
/// The registry owns one opener and calls it for initial opens and reconnects,
/// which is what lets tests substitute scripted sources.
pub trait SourceOpener: Send + Sync {
    fn open(&self, source: &CameraSource) -> Result<Box<dyn Capture>>;
}

/// Frame geometry and pacing hints handed to opened sources.
#[derive(Clone, Copy, Debug)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 30,
        }
    }
}

/// Opener that dispatches on the source scheme to the compiled-in backends.
#[derive(Clone, Debug, Default)]
pub struct DefaultOpener {
    settings: CaptureSettings,
}

impl DefaultOpener {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }
}

impl SourceOpener for DefaultOpener {
    fn open(&self, source: &CameraSource) -> Result<Box<dyn Capture>> {
        let uri = match source {
            CameraSource::Device(index) => {
                return open_device(&format!("/dev/video{}", index), self.settings)
            }
            CameraSource::Stream(uri) => uri.as_str(),
        };
        let scheme = uri.split_once("://").map(|(scheme, _)| scheme);
        match scheme {
            Some("stub") => Ok(Box::new(SyntheticSource::open(uri, self.settings)?)),
            Some("rtsp" | "rtsps") => open_rtsp(uri, self.settings),
            Some("http" | "https") => open_http(uri, self.settings),
            None if uri.starts_with("/dev/video") => open_device(uri, self.settings),
            _ => Err(anyhow!("unsupported camera source '{}'", uri)),
        }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(path: &str, settings: CaptureSettings) -> Result<Box<dyn Capture>> {
    Ok(Box::new(v4l2::V4l2Source::open(path, settings)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(path: &str, _settings: CaptureSettings) -> Result<Box<dyn Capture>> {
    Err(anyhow!(
        "local device {} requires the ingest-v4l2 feature",
        path
    ))
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_rtsp(url: &str, settings: CaptureSettings) -> Result<Box<dyn Capture>> {
    Ok(Box::new(rtsp::RtspSource::open(url, settings)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_rtsp(_url: &str, _settings: CaptureSettings) -> Result<Box<dyn Capture>> {
    Err(anyhow!("RTSP requires the rtsp-gstreamer feature"))
}

#[cfg(feature = "ingest-http")]
fn open_http(url: &str, settings: CaptureSettings) -> Result<Box<dyn Capture>> {
    Ok(Box::new(http::HttpSource::open(url, settings)?))
}

#[cfg(not(feature = "ingest-http"))]
fn open_http(_url: &str, _settings: CaptureSettings) -> Result<Box<dyn Capture>> {
    Err(anyhow!("HTTP sources require the ingest-http feature"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_sources_are_device_indexes() -> Result<()> {
        assert_eq!(CameraSource::parse("0")?, CameraSource::Device(0));
        assert_eq!(CameraSource::parse(" 2 ")?, CameraSource::Device(2));
        assert_eq!(
            CameraSource::parse("rtsp://10.0.0.5/stream")?,
            CameraSource::Stream("rtsp://10.0.0.5/stream".to_string())
        );
        assert!(CameraSource::parse("  ").is_err());
        Ok(())
    }

    #[test]
    fn default_opener_opens_stub_streams() -> Result<()> {
        let opener = DefaultOpener::new(CaptureSettings {
            width: 32,
            height: 24,
            target_fps: 30,
        });
        let mut capture = opener.open(&CameraSource::parse("stub://lobby")?)?;
        let frame = capture.read_frame()?;
        assert_eq!((frame.width, frame.height), (32, 24));
        Ok(())
    }

    #[test]
    fn default_opener_rejects_unknown_schemes() {
        let opener = DefaultOpener::default();
        let source = CameraSource::Stream("ftp://camera".to_string());
        assert!(opener.open(&source).is_err());
    }
}
