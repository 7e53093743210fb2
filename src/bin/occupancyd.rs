//! occupancyd - occupancy-driven device automation daemon
//!
//! Startup order:
//! 1. Load configuration, load the detector model and initialise the device
//!    database schema.
//! 2. Register a camera for every room, plus any configured extras.
//! 3. Start the frame refresh loop, the automation scheduler and the status API.
//!
//! Ctrl-C stops the API, the scheduler and the refresh loop, then releases
//! every capture handle.

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::sync::Arc;

use occupancy_kernel::{
    api::{ApiConfig, ApiServer},
    config::OccupancydConfig,
    detect::select_model_backend,
    AutomationScheduler, CameraRegistry, DefaultOpener, FrameRefresher, OccupancySource,
    SqliteDeviceStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = OccupancydConfig::load()?;
    let detector = select_model_backend(&cfg.detector)?;
    let store = SqliteDeviceStore::open(&cfg.db_path)?;
    log::info!("device database ready at {}", cfg.db_path);

    let opener = DefaultOpener::new(cfg.refresh.capture_settings());
    let registry = Arc::new(CameraRegistry::new(Arc::new(opener)).with_backoff(cfg.reconnect));
    seed_cameras(&registry, &store, &cfg);

    let refresher = FrameRefresher::new(Arc::clone(&registry), detector)
        .with_confidence_threshold(cfg.refresh.confidence_threshold)
        .with_target_fps(cfg.refresh.target_fps)
        .with_workers(cfg.refresh.workers)
        .spawn()?;

    let occupancy: Arc<dyn OccupancySource> = registry.clone();
    let scheduler = AutomationScheduler::new(occupancy, Box::new(store))
        .with_tick_interval(cfg.automation_tick)
        .spawn()?;

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        Arc::clone(&registry),
    )
    .spawn()?;

    log::info!(
        "occupancyd running: {} camera(s), detector={}, api={}",
        registry.len(),
        cfg.detector.backend,
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    scheduler.stop()?;
    refresher.stop()?;
    registry.shutdown();
    log::info!("all capture handles released");

    Ok(())
}

fn seed_cameras(registry: &CameraRegistry, store: &SqliteDeviceStore, cfg: &OccupancydConfig) {
    match store.rooms_with_cameras() {
        Ok(rooms) => {
            for (room_id, source) in rooms {
                if !registry.add_camera(&room_id.to_string(), &source) {
                    log::warn!("room {}: camera {} not available", room_id, source);
                }
            }
        }
        Err(err) => log::warn!("failed to list room cameras: {:#}", err),
    }
    for camera in &cfg.cameras {
        if !registry.add_camera(&camera.id, &camera.source) {
            log::warn!("camera {}: {} not available", camera.id, camera.source);
        }
    }
}
