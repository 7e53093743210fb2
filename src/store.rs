//! Device persistence.
//!
//! The automation scheduler reads automated device descriptors and commits
//! `is_enabled` changes through `DeviceStore`. `SqliteDeviceStore` keeps the
//! building/room/device tables; `InMemoryDeviceStore` backs tests and the demo.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Per-device hysteresis parameters. Delays are whole seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Thresholds {
    pub persons_before_enabled: i64,
    pub delay_before_enabled_s: i64,
    pub persons_before_disabled: i64,
    pub delay_before_disabled_s: i64,
}

impl Thresholds {
    /// Enable and disable conditions can hold at the same count.
    pub fn overlapping(&self) -> bool {
        self.persons_before_enabled <= self.persons_before_disabled
    }

    /// Negative delays are treated as zero.
    pub fn enable_delay(&self) -> Duration {
        seconds(self.delay_before_enabled_s)
    }

    pub fn disable_delay(&self) -> Duration {
        seconds(self.delay_before_disabled_s)
    }
}

fn seconds(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: i64,
    pub room_id: i64,
    pub is_enabled: bool,
    pub is_manual: bool,
    pub thresholds: Thresholds,
}

pub trait DeviceStore: Send {
    /// Devices under automatic control (`is_manual = false`).
    fn automated_devices(&mut self) -> Result<Vec<DeviceDescriptor>>;

    /// Durably set `is_enabled`. A device that no longer exists is not an error.
    fn set_enabled(&mut self, device_id: i64, enabled: bool) -> Result<()>;
}

/// Fields for inserting a device row.
#[derive(Clone, Debug)]
pub struct NewDevice {
    pub hardware_id: i64,
    pub name: String,
    pub room_id: i64,
    pub is_enabled: bool,
    pub is_manual: bool,
    pub thresholds: Thresholds,
}

pub struct SqliteDeviceStore {
    conn: Connection,
}

impl SqliteDeviceStore {
    /// Open the database and create the schema if missing. Run once at
    /// startup, before any loop or request handler touches the store.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn =
            Connection::open(db_path).with_context(|| format!("open device db {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS building (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              description TEXT NOT NULL,
              path TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS room (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              live_camera TEXT NOT NULL,
              building_id INTEGER NOT NULL REFERENCES building(id)
            );

            CREATE TABLE IF NOT EXISTS device (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              hardware_id INTEGER NOT NULL,
              name TEXT NOT NULL,
              is_enabled INTEGER NOT NULL,
              is_manual INTEGER NOT NULL DEFAULT 0,
              persons_before_enabled INTEGER NOT NULL,
              delay_before_enabled INTEGER NOT NULL,
              persons_before_disabled INTEGER NOT NULL,
              delay_before_disabled INTEGER NOT NULL,
              room_id INTEGER NOT NULL REFERENCES room(id)
            );

            CREATE INDEX IF NOT EXISTS idx_device_room ON device(room_id);
            "#,
        )?;
        Ok(())
    }

    pub fn add_building(&mut self, name: &str, description: &str, path: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO building(name, description, path) VALUES (?1, ?2, ?3)",
            params![name, description, path],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_room(&mut self, name: &str, live_camera: &str, building_id: i64) -> Result<i64> {
        if live_camera.trim().is_empty() {
            return Err(anyhow!("room '{}' needs a live camera source", name));
        }
        self.conn.execute(
            "INSERT INTO room(name, live_camera, building_id) VALUES (?1, ?2, ?3)",
            params![name, live_camera.trim(), building_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_device(&mut self, device: &NewDevice) -> Result<i64> {
        let t = &device.thresholds;
        self.conn.execute(
            r#"
            INSERT INTO device(hardware_id, name, is_enabled, is_manual,
                               persons_before_enabled, delay_before_enabled,
                               persons_before_disabled, delay_before_disabled, room_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                device.hardware_id,
                device.name,
                device.is_enabled,
                device.is_manual,
                t.persons_before_enabled,
                t.delay_before_enabled_s,
                t.persons_before_disabled,
                t.delay_before_disabled_s,
                device.room_id
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_manual(&mut self, device_id: i64, manual: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE device SET is_manual = ?1 WHERE id = ?2",
            params![manual, device_id],
        )?;
        Ok(())
    }

    pub fn device(&self, device_id: i64) -> Result<Option<DeviceDescriptor>> {
        let descriptor = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", DEVICE_SELECT),
                params![device_id],
                descriptor_from_row,
            )
            .optional()?;
        Ok(descriptor)
    }

    /// `(room id, live camera source)` for every room, ordered by id.
    pub fn rooms_with_cameras(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, live_camera FROM room ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row?);
        }
        Ok(rooms)
    }
}

const DEVICE_SELECT: &str = r#"
    SELECT id, room_id, is_enabled, is_manual,
           persons_before_enabled, delay_before_enabled,
           persons_before_disabled, delay_before_disabled
    FROM device"#;

fn descriptor_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceDescriptor> {
    Ok(DeviceDescriptor {
        id: row.get(0)?,
        room_id: row.get(1)?,
        is_enabled: row.get(2)?,
        is_manual: row.get(3)?,
        thresholds: Thresholds {
            persons_before_enabled: row.get(4)?,
            delay_before_enabled_s: row.get(5)?,
            persons_before_disabled: row.get(6)?,
            delay_before_disabled_s: row.get(7)?,
        },
    })
}

impl DeviceStore for SqliteDeviceStore {
    fn automated_devices(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE is_manual = 0 ORDER BY id", DEVICE_SELECT))?;
        let rows = stmt.query_map([], descriptor_from_row)?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    fn set_enabled(&mut self, device_id: i64, enabled: bool) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE device SET is_enabled = ?1 WHERE id = ?2",
            params![enabled, device_id],
        )?;
        if updated == 0 {
            log::debug!("device {} vanished before commit", device_id);
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    devices: BTreeMap<i64, DeviceDescriptor>,
    failing: HashSet<i64>,
    fail_listing: bool,
    commits: Vec<(i64, bool)>,
}

/// Shared in-memory store. Clones see the same devices, so a test can hand
/// one clone to the scheduler and inspect another.
#[derive(Clone, Default)]
pub struct InMemoryDeviceStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: DeviceDescriptor) {
        self.lock().devices.insert(device.id, device);
    }

    pub fn remove(&self, device_id: i64) {
        self.lock().devices.remove(&device_id);
    }

    pub fn get(&self, device_id: i64) -> Option<DeviceDescriptor> {
        self.lock().devices.get(&device_id).cloned()
    }

    pub fn set_manual(&self, device_id: i64, manual: bool) {
        if let Some(device) = self.lock().devices.get_mut(&device_id) {
            device.is_manual = manual;
        }
    }

    /// Make commits for `device_id` fail until cleared.
    pub fn fail_commits(&self, device_id: i64, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(device_id);
        } else {
            state.failing.remove(&device_id);
        }
    }

    pub fn fail_listing(&self, failing: bool) {
        self.lock().fail_listing = failing;
    }

    /// Successful commits, in order.
    pub fn commits(&self) -> Vec<(i64, bool)> {
        self.lock().commits.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceStore for InMemoryDeviceStore {
    fn automated_devices(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let state = self.lock();
        if state.fail_listing {
            return Err(anyhow!("device listing unavailable"));
        }
        Ok(state
            .devices
            .values()
            .filter(|device| !device.is_manual)
            .cloned()
            .collect())
    }

    fn set_enabled(&mut self, device_id: i64, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        if state.failing.contains(&device_id) {
            return Err(anyhow!("commit failed for device {}", device_id));
        }
        if let Some(device) = state.devices.get_mut(&device_id) {
            device.is_enabled = enabled;
            state.commits.push((device_id, enabled));
        }
        Ok(())
    }
}
