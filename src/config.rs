use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::CaptureSettings;
use crate::registry::BackoffPolicy;

const DEFAULT_DB_PATH: &str = "occupancy.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_REFRESH_WORKERS: usize = 1;
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 100;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_AUTOMATION_TICK_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
struct OccupancydConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    refresh: Option<RefreshConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
    automation: Option<AutomationConfigFile>,
    detector: Option<DetectorConfigFile>,
    cameras: Option<Vec<CameraConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RefreshConfigFile {
    target_fps: Option<u32>,
    confidence_threshold: Option<f32>,
    workers: Option<usize>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    initial_ms: Option<u64>,
    max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AutomationConfigFile {
    tick_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
}

/// A camera registered at startup in addition to the rooms' cameras.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CameraConfig {
    pub id: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct OccupancydConfig {
    pub db_path: String,
    pub api_addr: String,
    pub refresh: RefreshSettings,
    pub reconnect: BackoffPolicy,
    pub automation_tick: Duration,
    pub detector: DetectorSettings,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub target_fps: u32,
    pub confidence_threshold: f32,
    pub workers: usize,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl RefreshSettings {
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            width: self.frame_width,
            height: self.frame_height,
            target_fps: self.target_fps,
        }
    }
}

/// Detector selection. There is no default backend: the daemon refuses to
/// start rather than publish counts nobody measured.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
}

impl OccupancydConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("OCCUPANCY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: OccupancydConfigFile) -> Self {
        let refresh = file.refresh.unwrap_or_default();
        let reconnect = file.reconnect.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            refresh: RefreshSettings {
                target_fps: refresh.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                confidence_threshold: refresh
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                workers: refresh.workers.unwrap_or(DEFAULT_REFRESH_WORKERS),
                frame_width: refresh.frame_width.unwrap_or(DEFAULT_FRAME_WIDTH),
                frame_height: refresh.frame_height.unwrap_or(DEFAULT_FRAME_HEIGHT),
            },
            reconnect: BackoffPolicy {
                initial: Duration::from_millis(
                    reconnect.initial_ms.unwrap_or(DEFAULT_RECONNECT_INITIAL_MS),
                ),
                max: Duration::from_millis(reconnect.max_ms.unwrap_or(DEFAULT_RECONNECT_MAX_MS)),
            },
            automation_tick: Duration::from_millis(
                file.automation
                    .and_then(|automation| automation.tick_ms)
                    .unwrap_or(DEFAULT_AUTOMATION_TICK_MS),
            ),
            detector: DetectorSettings {
                backend: detector.backend.unwrap_or_default(),
                model_path: detector.model_path,
            },
            cameras: file.cameras.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("OCCUPANCY_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("OCCUPANCY_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(workers) = std::env::var("OCCUPANCY_REFRESH_WORKERS") {
            self.refresh.workers = workers
                .trim()
                .parse()
                .map_err(|_| anyhow!("OCCUPANCY_REFRESH_WORKERS must be a positive integer"))?;
        }
        if let Ok(tick) = std::env::var("OCCUPANCY_AUTOMATION_TICK_MS") {
            let millis: u64 = tick.trim().parse().map_err(|_| {
                anyhow!("OCCUPANCY_AUTOMATION_TICK_MS must be an integer number of milliseconds")
            })?;
            self.automation_tick = Duration::from_millis(millis);
        }
        if let Ok(backend) = std::env::var("OCCUPANCY_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.detector.backend.trim().is_empty() {
            return Err(anyhow!(
                "detector.backend is required (config file or OCCUPANCY_DETECTOR)"
            ));
        }
        if self.refresh.target_fps == 0 {
            return Err(anyhow!("refresh.target_fps must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.refresh.confidence_threshold) {
            return Err(anyhow!("refresh.confidence_threshold must be within [0, 1]"));
        }
        if self.refresh.workers == 0 {
            return Err(anyhow!("refresh.workers must be at least 1"));
        }
        if self.refresh.frame_width == 0 || self.refresh.frame_height == 0 {
            return Err(anyhow!("refresh frame size must be non-zero"));
        }
        if self.automation_tick.is_zero() {
            return Err(anyhow!("automation.tick_ms must be greater than zero"));
        }
        if self.reconnect.initial > self.reconnect.max {
            return Err(anyhow!("reconnect.initial_ms must not exceed reconnect.max_ms"));
        }
        for camera in &self.cameras {
            if camera.id.trim().is_empty() || camera.source.trim().is_empty() {
                return Err(anyhow!("cameras entries need a non-empty id and source"));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<OccupancydConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
