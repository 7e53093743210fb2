//! Scripted opener for deterministic tests and demos.
//!
//! Every opened handle produces solid frames unless the per-source read
//! script says otherwise. Opens and releases are counted per source so tests
//! can assert on handle ownership.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{CameraSource, Capture, SourceOpener};
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStep {
    Frame,
    Fail,
}

#[derive(Default)]
struct SourceScript {
    reads: VecDeque<ReadStep>,
    failing_opens: u32,
    opens: u64,
    releases: u64,
}

#[derive(Clone)]
pub struct ScriptedOpener {
    width: u32,
    height: u32,
    state: Arc<Mutex<HashMap<String, SourceScript>>>,
}

impl ScriptedOpener {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue read outcomes for a source. Reads past the script succeed.
    pub fn script_reads(&self, source: &str, steps: impl IntoIterator<Item = ReadStep>) {
        self.lock()
            .entry(source.to_string())
            .or_default()
            .reads
            .extend(steps);
    }

    /// Make the next `count` opens of a source fail.
    pub fn fail_next_opens(&self, source: &str, count: u32) {
        self.lock().entry(source.to_string()).or_default().failing_opens += count;
    }

    pub fn opens(&self, source: &str) -> u64 {
        self.lock().get(source).map_or(0, |s| s.opens)
    }

    pub fn releases(&self, source: &str) -> u64 {
        self.lock().get(source).map_or(0, |s| s.releases)
    }

    /// Handles opened and not yet released.
    pub fn live_handles(&self, source: &str) -> u64 {
        self.lock()
            .get(source)
            .map_or(0, |s| s.opens.saturating_sub(s.releases))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SourceScript>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, source: &CameraSource) -> Result<Box<dyn Capture>> {
        let key = source.to_string();
        {
            let mut state = self.lock();
            let script = state.entry(key.clone()).or_default();
            if script.failing_opens > 0 {
                script.failing_opens -= 1;
                return Err(anyhow!("scripted open failure for {}", key));
            }
            script.opens += 1;
        }
        Ok(Box::new(ScriptedCapture {
            key,
            width: self.width,
            height: self.height,
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedCapture {
    key: String,
    width: u32,
    height: u32,
    state: Arc<Mutex<HashMap<String, SourceScript>>>,
}

impl Capture for ScriptedCapture {
    fn read_frame(&mut self) -> Result<Frame> {
        let step = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&self.key)
            .and_then(|s| s.reads.pop_front())
            .unwrap_or(ReadStep::Frame);
        match step {
            ReadStep::Frame => Ok(Frame::solid(self.width, self.height, [90, 90, 90])),
            ReadStep::Fail => Err(anyhow!("scripted read failure for {}", self.key)),
        }
    }
}

impl Drop for ScriptedCapture {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(script) = state.get_mut(&self.key) {
            script.releases += 1;
        }
    }
}
