use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, DetectionResult};

const SCRIPTED_CONFIDENCE: f32 = 0.9;

/// One scripted detector response.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Report this many confident person detections.
    Persons(u32),
    /// Report exactly these detections.
    Detections(Vec<Detection>),
    /// Fail the detect call.
    Fail(String),
}

/// Deterministic backend that replays a script instead of running a model.
///
/// Each `detect` call consumes one step. Once the script runs out, the last
/// step is repeated forever.
pub struct ScriptedBackend {
    steps: VecDeque<ScriptStep>,
    last: ScriptStep,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            last: ScriptStep::Persons(0),
            calls: 0,
        }
    }

    /// Always report `persons` people.
    pub fn constant(persons: u32) -> Self {
        Self {
            steps: VecDeque::new(),
            last: ScriptStep::Persons(persons),
            calls: 0,
        }
    }

    pub fn with_counts(counts: impl IntoIterator<Item = u32>) -> Self {
        Self::new(counts.into_iter().map(ScriptStep::Persons))
    }

    pub fn push(&mut self, step: ScriptStep) {
        self.steps.push_back(step);
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn next_step(&mut self) -> ScriptStep {
        if let Some(step) = self.steps.pop_front() {
            self.last = step;
        }
        self.last.clone()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::constant(0)
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<DetectionResult> {
        self.calls += 1;
        match self.next_step() {
            ScriptStep::Persons(count) => Ok(DetectionResult::new(person_row(count))),
            ScriptStep::Detections(detections) => Ok(DetectionResult::new(detections)),
            ScriptStep::Fail(reason) => Err(anyhow!("scripted detector failure: {}", reason)),
        }
    }
}

/// Lay `count` person boxes out side by side across the middle of the frame.
fn person_row(count: u32) -> Vec<Detection> {
    if count == 0 {
        return Vec::new();
    }
    let slot = 1.0 / count as f32;
    (0..count)
        .map(|i| {
            let bbox = BoundingBox::new(i as f32 * slot + slot * 0.1, 0.25, slot * 0.8, 0.5);
            Detection::person(SCRIPTED_CONFIDENCE, bbox)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_script_then_repeats_last_step() -> Result<()> {
        let mut backend = ScriptedBackend::with_counts([0, 3, 1]);

        let counts: Vec<u32> = (0..5)
            .map(|_| backend.detect(b"", 0, 0).map(|r| r.person_count(0.5)))
            .collect::<Result<_>>()?;

        assert_eq!(counts, vec![0, 3, 1, 1, 1]);
        assert_eq!(backend.calls(), 5);
        Ok(())
    }

    #[test]
    fn fail_step_returns_error_once() {
        let mut backend = ScriptedBackend::new([
            ScriptStep::Fail("model unavailable".into()),
            ScriptStep::Persons(2),
        ]);

        assert!(backend.detect(b"", 0, 0).is_err());
        let result = backend.detect(b"", 0, 0).expect("second step succeeds");
        assert_eq!(result.person_count(0.5), 2);
    }

    #[test]
    fn person_boxes_stay_inside_frame() {
        for detection in person_row(7) {
            let b = detection.bbox;
            assert!(b.x >= 0.0 && b.x + b.w <= 1.0);
            assert!(b.y >= 0.0 && b.y + b.h <= 1.0);
        }
    }
}
