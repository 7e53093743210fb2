use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use super::debounce::DebounceState;
use crate::registry::CameraRegistry;
use crate::store::{DeviceDescriptor, DeviceStore, Thresholds};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(2);

const STOP_POLL: Duration = Duration::from_millis(50);

/// Where the scheduler reads occupancy from. Cameras are keyed by room id.
pub trait OccupancySource: Send + Sync {
    fn person_count(&self, camera_id: &str) -> Option<u32>;
}

impl OccupancySource for CameraRegistry {
    fn person_count(&self, camera_id: &str) -> Option<u32> {
        self.get_person_count(camera_id)
    }
}

/// What one scheduler tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    /// Devices whose room has no camera count this tick.
    pub no_occupancy: usize,
    /// Devices skipped for overlapping thresholds.
    pub rejected: usize,
    pub enabled: Vec<i64>,
    pub disabled: Vec<i64>,
    pub commit_failures: usize,
}

pub struct AutomationScheduler {
    occupancy: Arc<dyn OccupancySource>,
    store: Box<dyn DeviceStore>,
    states: HashMap<i64, DebounceState>,
    warned_overlap: HashMap<i64, Thresholds>,
    tick_interval: Duration,
}

impl AutomationScheduler {
    pub fn new(occupancy: Arc<dyn OccupancySource>, store: Box<dyn DeviceStore>) -> Self {
        Self {
            occupancy,
            store,
            states: HashMap::new(),
            warned_overlap: HashMap::new(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Debounce timers held for a device, if any.
    pub fn debounce_state(&self, device_id: i64) -> Option<DebounceState> {
        self.states.get(&device_id).copied()
    }

    /// Evaluate every automated device once at `now`.
    ///
    /// Only a failure to list devices is returned as an error. Per-device
    /// commit failures are logged and leave that device's timers untouched so
    /// the commit is retried next tick.
    pub fn tick(&mut self, now: Instant) -> Result<TickReport> {
        let devices = self.store.automated_devices()?;
        let mut report = TickReport::default();

        let live: HashSet<i64> = devices.iter().map(|d| d.id).collect();
        self.states.retain(|id, _| live.contains(id));
        self.warned_overlap.retain(|id, _| live.contains(id));

        for device in &devices {
            if device.is_manual {
                self.states.remove(&device.id);
                continue;
            }
            if self.reject_overlap(device) {
                report.rejected += 1;
                continue;
            }
            let Some(count) = self.occupancy.person_count(&device.room_id.to_string()) else {
                report.no_occupancy += 1;
                continue;
            };
            report.evaluated += 1;
            self.evaluate(device, i64::from(count), now, &mut report);
        }
        Ok(report)
    }

    fn evaluate(&mut self, device: &DeviceDescriptor, count: i64, now: Instant, report: &mut TickReport) {
        let t = &device.thresholds;
        let state = self.states.entry(device.id).or_default();
        let enable_due = state
            .enable
            .observe(count >= t.persons_before_enabled, now, t.enable_delay());
        let disable_due = state
            .disable
            .observe(count <= t.persons_before_disabled, now, t.disable_delay());

        if enable_due && !device.is_enabled {
            match self.store.set_enabled(device.id, true) {
                Ok(()) => {
                    log::info!(
                        "device {} enabled: room {} has {} person(s) for {:?}",
                        device.id,
                        device.room_id,
                        count,
                        t.enable_delay()
                    );
                    report.enabled.push(device.id);
                }
                Err(err) => {
                    log::warn!("device {}: failed to persist enable: {:#}", device.id, err);
                    report.commit_failures += 1;
                }
            }
        } else if disable_due && device.is_enabled {
            match self.store.set_enabled(device.id, false) {
                Ok(()) => {
                    log::info!(
                        "device {} disabled: room {} has {} person(s) for {:?}",
                        device.id,
                        device.room_id,
                        count,
                        t.disable_delay()
                    );
                    report.disabled.push(device.id);
                }
                Err(err) => {
                    log::warn!("device {}: failed to persist disable: {:#}", device.id, err);
                    report.commit_failures += 1;
                }
            }
        }
    }

    /// Skip devices whose enable and disable bands overlap. Warns once per
    /// distinct configuration.
    fn reject_overlap(&mut self, device: &DeviceDescriptor) -> bool {
        if !device.thresholds.overlapping() {
            self.warned_overlap.remove(&device.id);
            return false;
        }
        self.states.remove(&device.id);
        if self.warned_overlap.get(&device.id) != Some(&device.thresholds) {
            log::warn!(
                "device {} skipped: persons_before_enabled ({}) must exceed persons_before_disabled ({})",
                device.id,
                device.thresholds.persons_before_enabled,
                device.thresholds.persons_before_disabled
            );
            self.warned_overlap.insert(device.id, device.thresholds);
        }
        true
    }

    /// Tick every interval until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        log::info!("automation scheduler started: tick {:?}", self.tick_interval);
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            match self.tick(started) {
                Ok(report) => {
                    if !report.enabled.is_empty() || !report.disabled.is_empty() {
                        log::debug!("automation tick: {:?}", report);
                    }
                }
                Err(err) => log::warn!("automation tick failed: {:#}", err),
            }

            let deadline = started + self.tick_interval;
            while !shutdown.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep((deadline - now).min(STOP_POLL));
            }
        }
        log::info!("automation scheduler stopped");
    }

    pub fn spawn(mut self) -> Result<SchedulerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("automation".to_string())
            .spawn(move || self.run(&shutdown_thread))?;
        Ok(SchedulerHandle {
            shutdown,
            join: Some(join),
        })
    }
}

pub struct SchedulerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("automation thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::DebounceTimer;
    use crate::store::InMemoryDeviceStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FixedCounts(Mutex<HashMap<String, u32>>);

    impl FixedCounts {
        fn set(&self, camera: &str, count: u32) {
            self.0
                .lock()
                .unwrap()
                .insert(camera.to_string(), count);
        }
    }

    impl OccupancySource for FixedCounts {
        fn person_count(&self, camera_id: &str) -> Option<u32> {
            self.0.lock().unwrap().get(camera_id).copied()
        }
    }

    fn device(id: i64, enabled: bool, thresholds: Thresholds) -> DeviceDescriptor {
        DeviceDescriptor {
            id,
            room_id: 10,
            is_enabled: enabled,
            is_manual: false,
            thresholds,
        }
    }

    fn thresholds(enable: i64, enable_delay: i64, disable: i64, disable_delay: i64) -> Thresholds {
        Thresholds {
            persons_before_enabled: enable,
            delay_before_enabled_s: enable_delay,
            persons_before_disabled: disable,
            delay_before_disabled_s: disable_delay,
        }
    }

    fn scheduler(counts: &Arc<FixedCounts>, store: &InMemoryDeviceStore) -> AutomationScheduler {
        let occupancy: Arc<dyn OccupancySource> = counts.clone();
        AutomationScheduler::new(occupancy, Box::new(store.clone()))
    }

    #[test]
    fn missing_count_leaves_state_alone() -> Result<()> {
        let counts = Arc::new(FixedCounts::default());
        let store = InMemoryDeviceStore::new();
        store.insert(device(1, false, thresholds(1, 0, 0, 0)));
        let mut scheduler = scheduler(&counts, &store);

        let report = scheduler.tick(Instant::now())?;

        assert_eq!(report.no_occupancy, 1);
        assert!(store.commits().is_empty());
        assert_eq!(scheduler.debounce_state(1), None);
        Ok(())
    }

    #[test]
    fn hysteresis_band_runs_no_timers() -> Result<()> {
        let counts = Arc::new(FixedCounts::default());
        counts.set("10", 2);
        let store = InMemoryDeviceStore::new();
        store.insert(device(1, true, thresholds(4, 0, 1, 0)));
        let mut scheduler = scheduler(&counts, &store);

        scheduler.tick(Instant::now())?;

        assert!(store.commits().is_empty());
        let state = scheduler.debounce_state(1).unwrap_or_default();
        assert_eq!(state.enable, DebounceTimer::Idle);
        assert_eq!(state.disable, DebounceTimer::Idle);
        Ok(())
    }

    #[test]
    fn overlapping_thresholds_are_skipped() -> Result<()> {
        let counts = Arc::new(FixedCounts::default());
        counts.set("10", 2);
        let store = InMemoryDeviceStore::new();
        store.insert(device(1, false, thresholds(2, 0, 2, 0)));
        let mut scheduler = scheduler(&counts, &store);

        let report = scheduler.tick(Instant::now())?;
        scheduler.tick(Instant::now())?;

        assert_eq!(report.rejected, 1);
        assert!(store.commits().is_empty());
        assert_eq!(scheduler.warned_overlap.len(), 1);
        Ok(())
    }

    #[test]
    fn failed_commit_is_retried_next_tick() -> Result<()> {
        let counts = Arc::new(FixedCounts::default());
        counts.set("10", 5);
        let store = InMemoryDeviceStore::new();
        store.insert(device(1, false, thresholds(3, 0, 0, 0)));
        store.insert(device(2, false, thresholds(3, 0, 0, 0)));
        store.fail_commits(1, true);
        let mut scheduler = scheduler(&counts, &store);
        let t0 = Instant::now();

        let report = scheduler.tick(t0)?;
        assert_eq!(report.commit_failures, 1);
        assert_eq!(report.enabled, vec![2]);

        store.fail_commits(1, false);
        let report = scheduler.tick(t0 + Duration::from_secs(2))?;
        assert_eq!(report.enabled, vec![1]);
        Ok(())
    }

    #[test]
    fn manual_and_vanished_devices_drop_their_timers() -> Result<()> {
        let counts = Arc::new(FixedCounts::default());
        counts.set("10", 5);
        let store = InMemoryDeviceStore::new();
        store.insert(device(1, false, thresholds(3, 60, 0, 60)));
        store.insert(device(2, false, thresholds(3, 60, 0, 60)));
        let mut scheduler = scheduler(&counts, &store);
        let t0 = Instant::now();

        scheduler.tick(t0)?;
        assert!(scheduler.debounce_state(1).is_some());

        store.set_manual(1, true);
        store.remove(2);
        scheduler.tick(t0 + Duration::from_secs(120))?;

        assert_eq!(scheduler.debounce_state(1), None);
        assert_eq!(scheduler.debounce_state(2), None);
        assert!(store.commits().is_empty());
        Ok(())
    }

    #[test]
    fn listing_failure_is_reported() {
        let counts = Arc::new(FixedCounts::default());
        let store = InMemoryDeviceStore::new();
        store.fail_listing(true);
        let mut scheduler = scheduler(&counts, &store);
        assert!(scheduler.tick(Instant::now()).is_err());
    }
}
