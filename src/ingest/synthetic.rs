//! Synthetic `stub://` source for tests and demos.
//!
//! Produces a moving gradient so consecutive frames differ. Never fails.

use anyhow::{anyhow, Result};

use super::{Capture, CaptureSettings};
use crate::frame::Frame;

pub struct SyntheticSource {
    name: String,
    settings: CaptureSettings,
    frame_count: u64,
    /// Simulated scene state, changes every 50 frames.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn open(uri: &str, settings: CaptureSettings) -> Result<Self> {
        let name = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic sources use the stub:// scheme"))?;
        log::info!("SyntheticSource: connected to {} (synthetic)", uri);
        Ok(Self {
            name: name.to_string(),
            settings,
            frame_count: 0,
            scene_state: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = self.settings.width as usize * self.settings.height as usize * 3;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl Capture for SyntheticSource {
    fn read_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(pixels, self.settings.width, self.settings.height)
    }
}
