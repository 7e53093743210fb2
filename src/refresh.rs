//! Frame refresh loop.
//!
//! Each tick reads one frame from every registered camera, runs the detector
//! on it, counts confident person detections, annotates the frame and
//! publishes `(frame, now, count)` to the registry. A failed read clears the
//! camera's frame and zeroes its count until a read succeeds again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::detect::{DetectionResult, SharedDetector};
use crate::frame::Frame;
use crate::registry::{lock_slot, CameraRegistry, CaptureSlot, Publish, SlotRead};

pub const DEFAULT_TARGET_FPS: u32 = 30;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Per-tick outcome counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Frames read and published.
    pub frames: u32,
    /// Cameras whose read (or reopen) failed this tick.
    pub failures: u32,
    /// Cameras waiting out a reconnect backoff.
    pub backing_off: u32,
    /// Detector calls that errored.
    pub detector_errors: u32,
}

impl RefreshStats {
    fn merge(&mut self, other: RefreshStats) {
        self.frames += other.frames;
        self.failures += other.failures;
        self.backing_off += other.backing_off;
        self.detector_errors += other.detector_errors;
    }
}

pub struct FrameRefresher {
    registry: Arc<CameraRegistry>,
    detector: SharedDetector,
    confidence_threshold: f32,
    target_fps: u32,
    workers: usize,
}

impl FrameRefresher {
    pub fn new(registry: Arc<CameraRegistry>, detector: SharedDetector) -> Self {
        Self {
            registry,
            detector,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            target_fps: DEFAULT_TARGET_FPS,
            workers: 1,
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = fps.max(1);
        self
    }

    /// Spread cameras across this many threads per tick.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn frame_budget(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.target_fps.max(1)))
    }

    /// Refresh every registered camera once.
    pub fn tick(&self) -> RefreshStats {
        let slots = self.registry.slots();
        if self.workers <= 1 || slots.len() <= 1 {
            let mut stats = RefreshStats::default();
            for (id, slot) in &slots {
                stats.merge(self.refresh_camera(id, slot));
            }
            return stats;
        }

        let workers = self.workers.min(slots.len());
        let mut partitions: Vec<Vec<&(String, Arc<Mutex<CaptureSlot>>)>> =
            (0..workers).map(|_| Vec::new()).collect();
        for (index, entry) in slots.iter().enumerate() {
            partitions[index % workers].push(entry);
        }

        std::thread::scope(|scope| {
            let joins: Vec<_> = partitions
                .into_iter()
                .map(|partition| {
                    scope.spawn(move || {
                        let mut stats = RefreshStats::default();
                        for (id, slot) in partition {
                            stats.merge(self.refresh_camera(id, slot));
                        }
                        stats
                    })
                })
                .collect();

            let mut stats = RefreshStats::default();
            for join in joins {
                match join.join() {
                    Ok(partial) => stats.merge(partial),
                    Err(_) => log::error!("refresh worker panicked"),
                }
            }
            stats
        })
    }

    fn refresh_camera(&self, id: &str, slot: &Arc<Mutex<CaptureSlot>>) -> RefreshStats {
        let mut stats = RefreshStats::default();
        let read = lock_slot(slot).read(
            self.registry.opener(),
            self.registry.backoff(),
            Instant::now(),
        );

        match read {
            SlotRead::Frame(frame) => {
                let (detections, failed) = match self.detect(&frame) {
                    Ok(result) => (result, false),
                    Err(err) => {
                        log::warn!("camera {}: detector failed: {:#}", id, err);
                        (DetectionResult::default(), true)
                    }
                };
                if failed {
                    stats.detector_errors += 1;
                }

                let confident: Vec<_> = detections
                    .confident(self.confidence_threshold)
                    .cloned()
                    .collect();
                let person_count = detections.person_count(self.confidence_threshold);
                let frame = frame.annotate(&confident, person_count);
                self.registry.publish(
                    id,
                    slot,
                    Publish::Frame {
                        frame,
                        person_count,
                    },
                );
                stats.frames += 1;
            }
            SlotRead::Failed { reconnected } => {
                self.registry
                    .publish(id, slot, Publish::Cleared { connected: reconnected });
                stats.failures += 1;
            }
            SlotRead::Backoff => stats.backing_off += 1,
            SlotRead::Released => {}
        }
        stats
    }

    fn detect(&self, frame: &Frame) -> Result<DetectionResult> {
        let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        detector.detect(frame.pixels(), frame.width, frame.height)
    }

    /// Tick at the target rate until `shutdown` is set.
    pub fn run(&self, shutdown: &AtomicBool) {
        let budget = self.frame_budget();
        let mut pacing = Pacing::default();
        let mut window = RefreshStats::default();
        let mut last_health_log = Instant::now();

        log::info!(
            "refresh loop started: {} fps, threshold {}, {} worker(s)",
            self.target_fps,
            self.confidence_threshold,
            self.workers
        );

        while !shutdown.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();
            window.merge(self.tick());
            let elapsed = cycle_start.elapsed();
            pacing.record(elapsed, budget);

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                log::info!(
                    "refresh health cameras={} frames={} failures={} backing_off={} detector_errors={} ticks={} deadline_misses={} worst_case={:?}",
                    self.registry.len(),
                    window.frames,
                    window.failures,
                    window.backing_off,
                    window.detector_errors,
                    pacing.ticks,
                    pacing.deadline_misses,
                    pacing.worst_case
                );
                window = RefreshStats::default();
                last_health_log = Instant::now();
            }

            if elapsed < budget {
                std::thread::sleep(budget - elapsed);
            }
        }
        log::info!("refresh loop stopped after {} ticks", pacing.ticks);
    }

    /// Run the loop on its own thread.
    pub fn spawn(self) -> Result<RefreshHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("frame-refresh".to_string())
            .spawn(move || self.run(&shutdown_thread))?;
        Ok(RefreshHandle {
            shutdown,
            join: Some(join),
        })
    }
}

#[derive(Debug, Default)]
struct Pacing {
    ticks: u64,
    deadline_misses: u64,
    worst_case: Duration,
}

impl Pacing {
    fn record(&mut self, elapsed: Duration, budget: Duration) {
        self.ticks += 1;
        if elapsed > budget {
            self.deadline_misses += 1;
        }
        if elapsed > self.worst_case {
            self.worst_case = elapsed;
        }
    }
}

pub struct RefreshHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    /// Signal the loop and wait for the in-flight tick to finish.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("refresh thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{shared, BoundingBox, Detection, ObjectClass, ScriptStep, ScriptedBackend};
    use crate::ingest::{ReadStep, ScriptedOpener};

    fn setup(opener: &ScriptedOpener, backend: ScriptedBackend) -> (Arc<CameraRegistry>, FrameRefresher) {
        let registry = Arc::new(CameraRegistry::new(Arc::new(opener.clone())));
        let refresher = FrameRefresher::new(Arc::clone(&registry), shared(backend));
        (registry, refresher)
    }

    #[test]
    fn tick_publishes_frame_and_count() {
        let opener = ScriptedOpener::new(32, 24);
        let (registry, refresher) = setup(&opener, ScriptedBackend::constant(3));
        registry.add_camera("101", "stub://101");

        let stats = refresher.tick();

        assert_eq!(stats.frames, 1);
        assert_eq!(registry.get_person_count("101"), Some(3));
        let jpeg = registry.get_frame("101").expect("frame");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn only_confident_people_are_counted() {
        let opener = ScriptedOpener::new(32, 24);
        let bbox = BoundingBox::new(0.1, 0.1, 0.2, 0.2);
        let backend = ScriptedBackend::new([ScriptStep::Detections(vec![
            Detection::person(0.9, bbox),
            Detection::person(0.5, bbox),
            Detection::person(0.49, bbox),
            Detection {
                class: ObjectClass::Vehicle,
                confidence: 0.95,
                bbox,
            },
        ])]);
        let (registry, refresher) = setup(&opener, backend);
        registry.add_camera("1", "stub://1");

        refresher.tick();

        assert_eq!(registry.get_person_count("1"), Some(2));
    }

    #[test]
    fn read_failure_clears_frame_and_zeroes_count() {
        let opener = ScriptedOpener::new(16, 16);
        let (registry, refresher) = setup(&opener, ScriptedBackend::constant(2));
        registry.add_camera("1", "stub://1");
        refresher.tick();
        assert_eq!(registry.get_person_count("1"), Some(2));

        opener.script_reads("stub://1", [ReadStep::Fail]);
        let stats = refresher.tick();

        assert_eq!(stats.failures, 1);
        assert_eq!(registry.get_frame("1"), None);
        assert_eq!(registry.get_person_count("1"), Some(0));
        assert_eq!(opener.live_handles("stub://1"), 1);

        refresher.tick();
        assert_eq!(registry.get_person_count("1"), Some(2));
        assert!(registry.get_frame("1").is_some());
    }

    #[test]
    fn detector_error_counts_as_nobody() {
        let opener = ScriptedOpener::new(16, 16);
        let backend = ScriptedBackend::new([
            ScriptStep::Persons(4),
            ScriptStep::Fail("model crashed".to_string()),
        ]);
        let (registry, refresher) = setup(&opener, backend);
        registry.add_camera("1", "stub://1");

        refresher.tick();
        let stats = refresher.tick();

        assert_eq!(stats.detector_errors, 1);
        assert_eq!(registry.get_person_count("1"), Some(0));
        assert!(registry.get_frame("1").is_some());
    }

    #[test]
    fn workers_refresh_every_camera() {
        let opener = ScriptedOpener::new(8, 8);
        let (registry, refresher) = setup(&opener, ScriptedBackend::constant(1));
        let refresher = refresher.with_workers(3);
        for id in ["a", "b", "c", "d", "e"] {
            registry.add_camera(id, &format!("stub://{}", id));
        }

        let stats = refresher.tick();

        assert_eq!(stats.frames, 5);
        for id in ["a", "b", "c", "d", "e"] {
            assert_eq!(registry.get_person_count(id), Some(1));
        }
    }

    #[test]
    fn spawned_loop_stops_cleanly() -> Result<()> {
        let opener = ScriptedOpener::new(8, 8);
        let (registry, refresher) = setup(&opener, ScriptedBackend::constant(1));
        registry.add_camera("1", "stub://1");

        let handle = refresher.with_target_fps(200).spawn()?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.get_person_count("1") != Some(1) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop()?;

        assert_eq!(registry.get_person_count("1"), Some(1));
        Ok(())
    }

    #[test]
    fn pacing_tracks_misses_and_worst_case() {
        let mut pacing = Pacing::default();
        let budget = Duration::from_millis(33);
        pacing.record(Duration::from_millis(10), budget);
        pacing.record(Duration::from_millis(50), budget);

        assert_eq!(pacing.ticks, 2);
        assert_eq!(pacing.deadline_misses, 1);
        assert_eq!(pacing.worst_case, Duration::from_millis(50));
    }
}
