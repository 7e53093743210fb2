//! Camera registry: the shared state between the refresh loop, the automation
//! scheduler and request handlers.
//!
//! Locking:
//! - one map lock guards every camera's published `(frame, last_update, count)`
//!   triple; each publish replaces the triple in a single critical section, so
//!   readers see either the previous or the new triple, never a mix.
//! - each camera's capture handle sits behind its own slot lock. Reads,
//!   reconnects and inference never hold the map lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::frame::{Frame, DEFAULT_JPEG_QUALITY};
use crate::ingest::{CameraSource, Capture, SourceOpener};

pub const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_millis(100);
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);

// ----------------------------------------------------------------------------
// Reconnect backoff
// ----------------------------------------------------------------------------

/// Bounds for per-camera reopen attempts after an open failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_RECONNECT_INITIAL,
            max: DEFAULT_RECONNECT_MAX,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Default)]
struct ReconnectBackoff {
    failures: u32,
    next_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    fn record_failure(&mut self, now: Instant, policy: &BackoffPolicy) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = policy.delay(self.failures);
        self.next_attempt = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.next_attempt = None;
    }
}

// ----------------------------------------------------------------------------
// Capture slot: the exclusively owned capture handle of one camera
// ----------------------------------------------------------------------------

/// Outcome of one read attempt on a capture slot.
pub(crate) enum SlotRead {
    Frame(Frame),
    /// Read or reopen failed. `reconnected` says whether a fresh handle is
    /// already open for the next tick.
    Failed { reconnected: bool },
    /// Waiting out the reconnect backoff.
    Backoff,
    /// Camera was removed while the caller held a stale slot.
    Released,
}

pub(crate) struct CaptureSlot {
    id: String,
    source: CameraSource,
    handle: Option<Box<dyn Capture>>,
    backoff: ReconnectBackoff,
    released: bool,
}

impl CaptureSlot {
    fn new(id: &str, source: CameraSource, handle: Box<dyn Capture>) -> Self {
        Self {
            id: id.to_string(),
            source,
            handle: Some(handle),
            backoff: ReconnectBackoff::default(),
            released: false,
        }
    }

    /// Read one frame, reconnecting on failure.
    ///
    /// A failed read releases the handle and reopens it straight away. Only
    /// when reopening fails does the slot back off before the next attempt.
    pub(crate) fn read(
        &mut self,
        opener: &dyn SourceOpener,
        policy: &BackoffPolicy,
        now: Instant,
    ) -> SlotRead {
        if self.released {
            return SlotRead::Released;
        }
        if self.handle.is_none() {
            if !self.backoff.ready(now) {
                return SlotRead::Backoff;
            }
            if !self.reopen(opener, policy, now) {
                return SlotRead::Failed { reconnected: false };
            }
        }

        let Some(handle) = self.handle.as_mut() else {
            return SlotRead::Failed { reconnected: false };
        };
        match handle.read_frame() {
            Ok(frame) => SlotRead::Frame(frame),
            Err(err) => {
                log::warn!("camera {}: read failed: {:#}", self.id, err);
                self.handle = None;
                let reconnected = self.reopen(opener, policy, now);
                SlotRead::Failed { reconnected }
            }
        }
    }

    fn reopen(&mut self, opener: &dyn SourceOpener, policy: &BackoffPolicy, now: Instant) -> bool {
        match opener.open(&self.source) {
            Ok(handle) => {
                if self.backoff.failures > 0 {
                    log::info!("camera {}: reconnected to {}", self.id, self.source);
                }
                self.handle = Some(handle);
                self.backoff.reset();
                true
            }
            Err(err) => {
                let delay = self.backoff.record_failure(now, policy);
                log::warn!(
                    "camera {}: reconnect to {} failed (attempt {}, next in {:?}): {:#}",
                    self.id,
                    self.source,
                    self.backoff.failures,
                    delay,
                    err
                );
                false
            }
        }
    }

    fn release(&mut self) {
        self.released = true;
        self.handle = None;
    }

    #[cfg(test)]
    fn is_connected(&self) -> bool {
        self.handle.is_some()
    }
}

fn lock_recover<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// What the refresh loop publishes for one camera.
pub(crate) enum Publish {
    Frame { frame: Frame, person_count: u32 },
    Cleared { connected: bool },
}

struct CameraEntry {
    source: CameraSource,
    slot: Arc<Mutex<CaptureSlot>>,
    latest_frame: Option<Arc<Frame>>,
    last_update: Option<SystemTime>,
    person_count: u32,
    failure_streak: u32,
    connected: bool,
}

/// Point-in-time view of one camera, for status listings.
#[derive(Clone, Debug, Serialize)]
pub struct CameraStatus {
    pub id: String,
    pub source: String,
    pub has_frame: bool,
    pub person_count: u32,
    /// Seconds since the Unix epoch of the last successful read.
    pub last_update_epoch_s: Option<u64>,
    pub connected: bool,
    pub failure_streak: u32,
}

/// A camera's published frame and count, taken in one critical section so
/// both come from the same publish.
#[derive(Clone, Debug)]
pub struct CameraSnapshot {
    pub frame: Option<Arc<Frame>>,
    pub person_count: u32,
}

pub struct CameraRegistry {
    cameras: Mutex<HashMap<String, CameraEntry>>,
    opener: Arc<dyn SourceOpener>,
    backoff: BackoffPolicy,
    jpeg_quality: u8,
}

impl CameraRegistry {
    pub fn new(opener: Arc<dyn SourceOpener>) -> Self {
        Self {
            cameras: Mutex::new(HashMap::new()),
            opener,
            backoff: BackoffPolicy::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Open `source` and register it under `id`.
    ///
    /// Idempotent: a known `id` returns `true` without reopening. Returns
    /// `false`, registering nothing, when the source cannot be parsed or opened.
    /// The open happens under the map lock so concurrent adds of the same id
    /// never open two handles.
    pub fn add_camera(&self, id: &str, source: &str) -> bool {
        let mut cameras = lock_recover(&self.cameras);
        if cameras.contains_key(id) {
            return true;
        }

        let parsed = match CameraSource::parse(source) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("camera {}: invalid source '{}': {}", id, source, err);
                return false;
            }
        };
        let handle = match self.opener.open(&parsed) {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("failed to open camera {} with source {}: {:#}", id, parsed, err);
                return false;
            }
        };

        log::info!("camera {} added ({})", id, parsed);
        cameras.insert(
            id.to_string(),
            CameraEntry {
                slot: Arc::new(Mutex::new(CaptureSlot::new(id, parsed.clone(), handle))),
                source: parsed,
                latest_frame: None,
                last_update: None,
                person_count: 0,
                failure_streak: 0,
                connected: true,
            },
        );
        true
    }

    /// Release the capture handle and forget the camera. No-op when absent.
    pub fn remove_camera(&self, id: &str) {
        let entry = lock_recover(&self.cameras).remove(id);
        if let Some(entry) = entry {
            lock_recover(&entry.slot).release();
            log::info!("camera {} removed", id);
        }
    }

    /// Latest annotated frame as JPEG, or `None` for unknown cameras and
    /// cameras without a frame.
    pub fn get_frame(&self, id: &str) -> Option<Vec<u8>> {
        let frame = {
            let cameras = lock_recover(&self.cameras);
            cameras.get(id)?.latest_frame.clone()?
        };
        match frame.encode_jpeg(self.jpeg_quality) {
            Ok(jpeg) => Some(jpeg),
            Err(err) => {
                log::warn!("camera {}: {:#}", id, err);
                None
            }
        }
    }

    /// Last computed person count, or `None` for unknown cameras.
    pub fn get_person_count(&self, id: &str) -> Option<u32> {
        lock_recover(&self.cameras)
            .get(id)
            .map(|entry| entry.person_count)
    }

    /// Unencoded frame and count of a camera, or `None` for unknown cameras.
    pub fn snapshot(&self, id: &str) -> Option<CameraSnapshot> {
        lock_recover(&self.cameras)
            .get(id)
            .map(|entry| CameraSnapshot {
                frame: entry.latest_frame.clone(),
                person_count: entry.person_count,
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        lock_recover(&self.cameras).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock_recover(&self.cameras).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered camera ids, sorted.
    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_recover(&self.cameras).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn statuses(&self) -> Vec<CameraStatus> {
        let cameras = lock_recover(&self.cameras);
        let mut statuses: Vec<CameraStatus> = cameras
            .iter()
            .map(|(id, entry)| CameraStatus {
                id: id.clone(),
                source: entry.source.to_string(),
                has_frame: entry.latest_frame.is_some(),
                person_count: entry.person_count,
                last_update_epoch_s: entry.last_update.and_then(|t| {
                    t.duration_since(SystemTime::UNIX_EPOCH)
                        .ok()
                        .map(|d| d.as_secs())
                }),
                connected: entry.connected,
                failure_streak: entry.failure_streak,
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Release every capture handle and clear the registry.
    pub fn shutdown(&self) {
        let entries: Vec<(String, CameraEntry)> = lock_recover(&self.cameras).drain().collect();
        for (id, entry) in entries {
            lock_recover(&entry.slot).release();
            log::debug!("camera {} released", id);
        }
    }

    pub(crate) fn opener(&self) -> &dyn SourceOpener {
        self.opener.as_ref()
    }

    pub(crate) fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Capture slots to refresh this tick, sorted by camera id.
    pub(crate) fn slots(&self) -> Vec<(String, Arc<Mutex<CaptureSlot>>)> {
        let cameras = lock_recover(&self.cameras);
        let mut slots: Vec<_> = cameras
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.slot)))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    /// Atomically replace a camera's published triple.
    ///
    /// Ignored when the camera was removed (or removed and re-added) since
    /// `slot` was handed out.
    pub(crate) fn publish(&self, id: &str, slot: &Arc<Mutex<CaptureSlot>>, update: Publish) {
        let mut cameras = lock_recover(&self.cameras);
        let Some(entry) = cameras.get_mut(id) else {
            return;
        };
        if !Arc::ptr_eq(&entry.slot, slot) {
            return;
        }
        match update {
            Publish::Frame {
                frame,
                person_count,
            } => {
                entry.latest_frame = Some(Arc::new(frame));
                entry.last_update = Some(SystemTime::now());
                entry.person_count = person_count;
                entry.failure_streak = 0;
                entry.connected = true;
            }
            Publish::Cleared { connected } => {
                entry.latest_frame = None;
                entry.person_count = 0;
                entry.connected = connected;
                entry.failure_streak = entry.failure_streak.saturating_add(1);
            }
        }
    }
}

/// Lock a slot handed out by `CameraRegistry::slots`.
pub(crate) fn lock_slot(slot: &Mutex<CaptureSlot>) -> MutexGuard<'_, CaptureSlot> {
    lock_recover(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ReadStep, ScriptedOpener};

    fn registry(opener: &ScriptedOpener) -> CameraRegistry {
        CameraRegistry::new(Arc::new(opener.clone()))
    }

    #[test]
    fn add_camera_is_idempotent() {
        let opener = ScriptedOpener::new(8, 8);
        let registry = registry(&opener);

        assert!(registry.add_camera("101", "stub://room-101"));
        assert!(registry.add_camera("101", "stub://room-101"));
        assert!(registry.add_camera("101", "stub://somewhere-else"));

        assert_eq!(opener.opens("stub://room-101"), 1);
        assert_eq!(opener.opens("stub://somewhere-else"), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failed_open_registers_nothing() {
        let opener = ScriptedOpener::new(8, 8);
        opener.fail_next_opens("stub://broken", 1);
        let registry = registry(&opener);

        assert!(!registry.add_camera("7", "stub://broken"));
        assert!(!registry.contains("7"));
        assert_eq!(registry.get_person_count("7"), None);
        assert!(!registry.add_camera("8", "   "));
    }

    #[test]
    fn new_camera_has_no_frame_and_zero_count() {
        let opener = ScriptedOpener::new(8, 8);
        let registry = registry(&opener);
        registry.add_camera("1", "stub://one");

        assert_eq!(registry.get_frame("1"), None);
        assert_eq!(registry.get_person_count("1"), Some(0));
        assert_eq!(registry.get_person_count("unknown"), None);
        assert_eq!(registry.get_frame("unknown"), None);
    }

    #[test]
    fn remove_releases_handle_and_is_noop_when_absent() {
        let opener = ScriptedOpener::new(8, 8);
        let registry = registry(&opener);
        registry.add_camera("1", "stub://one");

        registry.remove_camera("1");
        registry.remove_camera("1");
        registry.remove_camera("never-added");

        assert!(!registry.contains("1"));
        assert_eq!(opener.live_handles("stub://one"), 0);
    }

    #[test]
    fn publish_replaces_triple_and_clear_resets_count() {
        let opener = ScriptedOpener::new(8, 8);
        let registry = registry(&opener);
        registry.add_camera("1", "stub://one");
        let (_, slot) = registry.slots().remove(0);

        registry.publish(
            "1",
            &slot,
            Publish::Frame {
                frame: Frame::solid(8, 8, [1, 2, 3]),
                person_count: 4,
            },
        );
        assert_eq!(registry.get_person_count("1"), Some(4));
        assert!(registry.get_frame("1").is_some());
        assert!(registry.statuses()[0].last_update_epoch_s.is_some());

        registry.publish("1", &slot, Publish::Cleared { connected: false });
        assert_eq!(registry.get_person_count("1"), Some(0));
        assert_eq!(registry.get_frame("1"), None);
        let status = &registry.statuses()[0];
        assert_eq!(status.failure_streak, 1);
        assert!(!status.connected);
    }

    #[test]
    fn stale_slot_cannot_publish_after_readd() {
        let opener = ScriptedOpener::new(8, 8);
        let registry = registry(&opener);
        registry.add_camera("1", "stub://one");
        let (_, stale) = registry.slots().remove(0);

        registry.remove_camera("1");
        registry.add_camera("1", "stub://one");
        registry.publish(
            "1",
            &stale,
            Publish::Frame {
                frame: Frame::solid(8, 8, [0, 0, 0]),
                person_count: 9,
            },
        );

        assert_eq!(registry.get_person_count("1"), Some(0));
    }

    #[test]
    fn slot_reopens_immediately_after_read_failure() {
        let opener = ScriptedOpener::new(8, 8);
        opener.script_reads("stub://one", [ReadStep::Fail]);
        let registry = registry(&opener);
        registry.add_camera("1", "stub://one");
        let (_, slot) = registry.slots().remove(0);
        let now = Instant::now();

        let first = lock_slot(&slot).read(registry.opener(), registry.backoff(), now);
        assert!(matches!(first, SlotRead::Failed { reconnected: true }));
        assert!(lock_slot(&slot).is_connected());
        assert_eq!(opener.opens("stub://one"), 2);
        assert_eq!(opener.live_handles("stub://one"), 1);

        let second = lock_slot(&slot).read(registry.opener(), registry.backoff(), now);
        assert!(matches!(second, SlotRead::Frame(_)));
    }

    #[test]
    fn slot_backs_off_when_reopen_fails() {
        let opener = ScriptedOpener::new(8, 8);
        let registry = registry(&opener).with_backoff(BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(4),
        });
        registry.add_camera("1", "stub://one");
        opener.script_reads("stub://one", [ReadStep::Fail]);
        opener.fail_next_opens("stub://one", 2);
        let (_, slot) = registry.slots().remove(0);
        let t0 = Instant::now();

        // Read fails, immediate reopen fails: backoff 1s.
        let read = lock_slot(&slot).read(registry.opener(), registry.backoff(), t0);
        assert!(matches!(read, SlotRead::Failed { reconnected: false }));
        let read = lock_slot(&slot).read(registry.opener(), registry.backoff(), t0);
        assert!(matches!(read, SlotRead::Backoff));

        // Second reopen fails at t0+1s: backoff 2s.
        let t1 = t0 + Duration::from_secs(1);
        let read = lock_slot(&slot).read(registry.opener(), registry.backoff(), t1);
        assert!(matches!(read, SlotRead::Failed { reconnected: false }));
        let read = lock_slot(&slot).read(registry.opener(), registry.backoff(), t1 + Duration::from_secs(1));
        assert!(matches!(read, SlotRead::Backoff));

        // Third reopen succeeds.
        let read = lock_slot(&slot).read(registry.opener(), registry.backoff(), t1 + Duration::from_secs(2));
        assert!(matches!(read, SlotRead::Frame(_)));
    }

    #[test]
    fn backoff_delay_doubles_up_to_max() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(64), Duration::from_millis(1000));
    }

    #[test]
    fn shutdown_releases_every_handle() {
        let opener = ScriptedOpener::new(8, 8);
        let registry = registry(&opener);
        registry.add_camera("1", "stub://one");
        registry.add_camera("2", "stub://two");

        registry.shutdown();

        assert!(registry.is_empty());
        assert_eq!(opener.live_handles("stub://one"), 0);
        assert_eq!(opener.live_handles("stub://two"), 0);
    }

    #[test]
    fn released_slot_is_not_reopened() {
        let opener = ScriptedOpener::new(8, 8);
        let registry = registry(&opener);
        registry.add_camera("1", "stub://one");
        let (_, slot) = registry.slots().remove(0);

        registry.remove_camera("1");
        let read = lock_slot(&slot).read(registry.opener(), registry.backoff(), Instant::now());

        assert!(matches!(read, SlotRead::Released));
        assert_eq!(opener.opens("stub://one"), 1);
    }
}
