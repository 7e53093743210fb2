//! RTSP capture through GStreamer.
//!
//! The pipeline decodes to RGB into a one-buffer appsink that drops stale
//! buffers, so every read gets the newest decoded frame. Opening only
//! succeeds once the first frame has been decoded, so unreachable cameras
//! fail to open. The capture handle owns the pipeline; dropping it moves the
//! pipeline to `Null` and closes the RTSP session.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::{Duration, Instant};

use super::{Capture, CaptureSettings};
use crate::frame::Frame;

const MIN_PULL_TIMEOUT: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_POLL_MS: u64 = 100;

pub struct RtspSource {
    url: String,
    pipeline: gstreamer::Pipeline,
    sink: gstreamer_app::AppSink,
    pull_timeout: gstreamer::ClockTime,
    frames: u64,
}

impl RtspSource {
    pub fn open(url: &str, settings: CaptureSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline = gstreamer::parse::launch(&pipeline_description(url))
            .with_context(|| format!("build pipeline for {}", url))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("launch string for {} did not yield a pipeline", url))?;
        let sink = pipeline
            .by_name("frames")
            .ok_or_else(|| anyhow!("pipeline for {} has no frames sink", url))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("frames element for {} is not an appsink", url))?;

        let started = pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|err| anyhow!("start pipeline for {}: {}", url, err))
            .and_then(|_| await_first_sample(&pipeline, &sink, CONNECT_TIMEOUT));
        if let Err(err) = started {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(err.context(format!("open {}", url)));
        }
        log::info!("rtsp: streaming {}", url);

        Ok(Self {
            url: url.to_string(),
            pipeline,
            sink,
            pull_timeout: pull_timeout(settings.target_fps),
            frames: 0,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames
    }

    /// First error or end-of-stream posted on the bus since the last read.
    fn stream_fault(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let mut fault = None;
        while let Some(message) = bus.pop() {
            if fault.is_none() {
                fault = describe_fault(&message);
            }
        }
        fault
    }
}

impl Capture for RtspSource {
    fn read_frame(&mut self) -> Result<Frame> {
        if let Some(fault) = self.stream_fault() {
            return Err(anyhow!("{}: {}", self.url, fault));
        }
        let sample = self
            .sink
            .try_pull_sample(self.pull_timeout)
            .ok_or_else(|| anyhow!("{}: no frame within {}", self.url, self.pull_timeout))?;

        let buffer = sample.buffer().context("sample without buffer")?;
        let caps = sample.caps().context("sample without caps")?;
        let info = gstreamer_video::VideoInfo::from_caps(caps).context("sample caps")?;
        let map = buffer.map_readable().context("map sample buffer")?;
        let stride = usize::try_from(info.stride()[0]).context("negative row stride")?;
        let pixels = pack_rgb_rows(map.as_slice(), stride, info.width(), info.height())?;

        self.frames += 1;
        Frame::from_rgb(pixels, info.width(), info.height())
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("rtsp: failed to close {}: {}", self.url, err);
        }
    }
}

fn describe_fault(message: &gstreamer::Message) -> Option<String> {
    match message.view() {
        gstreamer::MessageView::Error(err) => Some(format!("{}", err.error())),
        gstreamer::MessageView::Eos(..) => Some("end of stream".to_string()),
        _ => None,
    }
}

/// Block until the pipeline has decoded a frame, reporting the first bus
/// fault instead if the camera cannot be reached within `timeout`.
fn await_first_sample(
    pipeline: &gstreamer::Pipeline,
    sink: &gstreamer_app::AppSink,
    timeout: Duration,
) -> Result<()> {
    let bus = pipeline.bus().context("pipeline without bus")?;
    let poll = gstreamer::ClockTime::from_mseconds(CONNECT_POLL_MS);
    let deadline = Instant::now() + timeout;
    loop {
        let faults = [gstreamer::MessageType::Error, gstreamer::MessageType::Eos];
        if let Some(message) = bus.timed_pop_filtered(poll, &faults) {
            let fault = describe_fault(&message).unwrap_or_else(|| "stream fault".to_string());
            return Err(anyhow!(fault));
        }
        if sink.try_pull_sample(poll).is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("no frame within {:?}", timeout));
        }
    }
}

fn pipeline_description(url: &str) -> String {
    format!(
        "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! \
         video/x-raw,format=RGB ! appsink name=frames sync=false max-buffers=1 drop=true",
        url
    )
}

/// Four frame intervals, never below half a second.
fn pull_timeout(target_fps: u32) -> gstreamer::ClockTime {
    let interval = Duration::from_millis(1000 / u64::from(target_fps.max(1)));
    let timeout = (interval * 4).max(MIN_PULL_TIMEOUT);
    gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64)
}

/// Copy padded rows into a tightly packed RGB24 buffer.
fn pack_rgb_rows(data: &[u8], stride: usize, width: u32, height: u32) -> Result<Vec<u8>> {
    let row = width as usize * 3;
    if stride < row || stride == 0 {
        return Err(anyhow!("row stride {} too small for width {}", stride, width));
    }
    if stride == row {
        return data
            .get(..row * height as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| anyhow!("frame buffer shorter than {}x{}", width, height));
    }
    let mut packed = Vec::with_capacity(row * height as usize);
    for chunk in data.chunks(stride).take(height as usize) {
        packed.extend_from_slice(
            chunk
                .get(..row)
                .ok_or_else(|| anyhow!("frame row shorter than {} bytes", row))?,
        );
    }
    if packed.len() != row * height as usize {
        return Err(anyhow!("frame buffer shorter than {}x{}", width, height));
    }
    Ok(packed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_row_padding() -> Result<()> {
        // 2x2 RGB with 2 bytes of padding per row.
        let data = [1, 2, 3, 4, 5, 6, 0, 0, 7, 8, 9, 10, 11, 12, 0, 0];
        let packed = pack_rgb_rows(&data, 8, 2, 2)?;
        assert_eq!(packed, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        Ok(())
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(pack_rgb_rows(&[0; 10], 6, 2, 2).is_err());
        assert!(pack_rgb_rows(&[0; 12], 8, 2, 2).is_err());
    }

    #[test]
    fn zero_and_narrow_strides_are_rejected() {
        assert!(pack_rgb_rows(&[0; 12], 0, 2, 2).is_err());
        assert!(pack_rgb_rows(&[0; 12], 0, 0, 2).is_err());
        assert!(pack_rgb_rows(&[0; 12], 4, 2, 2).is_err());
    }

    #[test]
    fn unreachable_camera_fails_to_open() {
        let settings = CaptureSettings {
            width: 320,
            height: 240,
            target_fps: 10,
        };
        let started = Instant::now();
        let opened = RtspSource::open("rtsp://127.0.0.1:1/missing", settings);
        assert!(opened.is_err());
        assert!(started.elapsed() < CONNECT_TIMEOUT + Duration::from_secs(5));
    }

    #[test]
    fn pull_timeout_has_a_floor() {
        assert_eq!(pull_timeout(30), gstreamer::ClockTime::from_mseconds(500));
        assert_eq!(pull_timeout(2), gstreamer::ClockTime::from_mseconds(2000));
    }
}
