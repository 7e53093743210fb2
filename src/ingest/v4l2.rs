//! V4L2 frame source for local capture devices.
//!
//! Device indexes map to `/dev/videoN`. The device is asked for RGB3 at the
//! configured size; drivers that refuse keep their current format and the
//! frame length check in `Frame::from_rgb` rejects anything that is not RGB24.

use anyhow::{Context, Result};
use ouroboros::self_referencing;
use std::time::Instant;

use super::{Capture, CaptureSettings};
use crate::frame::Frame;

pub struct V4l2Source {
    device_path: String,
    state: DeviceState,
    width: u32,
    height: u32,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn open(device_path: &str, settings: CaptureSettings) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture as _;

        let mut device = v4l::Device::with_path(device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        if settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", device_path, err);
            }
        }

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Source: connected to {} ({}x{})",
            device_path,
            format.width,
            format.height
        );

        Ok(Self {
            device_path: device_path.to_string(),
            state,
            width: format.width,
            height: format.height,
            frame_count: 0,
            last_frame_at: None,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }
}

impl Capture for V4l2Source {
    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let pixels = self
            .state
            .with_stream_mut(|stream| stream.next().map(|(buf, _meta)| buf.to_vec()))
            .with_context(|| format!("capture v4l2 frame from {}", self.device_path))?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Frame::from_rgb(pixels, self.width, self.height)
    }
}
