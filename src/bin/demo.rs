//! demo - end-to-end synthetic run of the occupancy kernel
//!
//! Synthetic cameras feed a scripted detector whose occupancy rises and falls
//! over the run. The automation scheduler enables each room's device once the
//! room has been busy long enough and disables it again once it empties.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use occupancy_kernel::{
    detect::{shared, ScriptedBackend},
    ingest::CaptureSettings,
    AutomationScheduler, CameraRegistry, DefaultOpener, DeviceDescriptor, FrameRefresher,
    InMemoryDeviceStore, OccupancySource, Thresholds,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Duration of the run in seconds.
    #[arg(long, default_value_t = 12)]
    seconds: u64,
    /// Refresh rate of the synthetic cameras.
    #[arg(long, default_value_t = 10)]
    fps: u32,
    /// Number of rooms, one camera and one device each.
    #[arg(long, default_value_t = 2)]
    rooms: u32,
    /// People seen during the busy middle third of the run.
    #[arg(long, default_value_t = 4)]
    peak: u32,
    /// Automation tick in milliseconds.
    #[arg(long, default_value_t = 500)]
    automation_ms: u64,
    /// Enable/disable delay in seconds.
    #[arg(long, default_value_t = 2)]
    delay: i64,
    /// Write the last annotated frame of room 1 here.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.fps == 0 || args.rooms == 0 {
        return Err(anyhow!("fps and rooms must be >= 1"));
    }

    let ticks = args.seconds * u64::from(args.fps);
    let detector = ScriptedBackend::with_counts((0..ticks).flat_map(|tick| {
        let count = if tick >= ticks / 3 && tick < 2 * ticks / 3 {
            args.peak
        } else {
            0
        };
        std::iter::repeat(count).take(args.rooms as usize)
    }));

    let opener = DefaultOpener::new(CaptureSettings {
        width: 320,
        height: 240,
        target_fps: args.fps,
    });
    let registry = Arc::new(CameraRegistry::new(Arc::new(opener)));
    let store = InMemoryDeviceStore::new();
    for room in 1..=args.rooms {
        let room_id = i64::from(room);
        if !registry.add_camera(&room_id.to_string(), &format!("stub://room-{}", room)) {
            return Err(anyhow!("failed to open synthetic camera for room {}", room));
        }
        store.insert(DeviceDescriptor {
            id: room_id,
            room_id,
            is_enabled: false,
            is_manual: false,
            thresholds: Thresholds {
                persons_before_enabled: 3,
                delay_before_enabled_s: args.delay,
                persons_before_disabled: 0,
                delay_before_disabled_s: args.delay,
            },
        });
    }

    let refresher = FrameRefresher::new(Arc::clone(&registry), shared(detector))
        .with_target_fps(args.fps);
    let occupancy: Arc<dyn OccupancySource> = registry.clone();
    let mut scheduler = AutomationScheduler::new(occupancy, Box::new(store.clone()));

    let budget = refresher.frame_budget();
    let automation_every = Duration::from_millis(args.automation_ms.max(1));
    let started = Instant::now();
    let mut last_automation: Option<Instant> = None;

    for _ in 0..ticks {
        let cycle_start = Instant::now();
        refresher.tick();

        if last_automation.map_or(true, |at| cycle_start.duration_since(at) >= automation_every) {
            let report = scheduler.tick(cycle_start)?;
            for id in &report.enabled {
                log::info!("t={:.1}s device {} ON", started.elapsed().as_secs_f32(), id);
            }
            for id in &report.disabled {
                log::info!("t={:.1}s device {} OFF", started.elapsed().as_secs_f32(), id);
            }
            last_automation = Some(cycle_start);
        }

        let elapsed = cycle_start.elapsed();
        if elapsed < budget {
            std::thread::sleep(budget - elapsed);
        }
    }

    if let Some(path) = &args.snapshot {
        let jpeg = registry
            .get_frame("1")
            .ok_or_else(|| anyhow!("room 1 has no frame"))?;
        fs::write(path, jpeg).with_context(|| format!("write snapshot {}", path.display()))?;
        log::info!("snapshot written to {}", path.display());
    }

    for (device_id, enabled) in store.commits() {
        println!("device {} -> {}", device_id, if enabled { "on" } else { "off" });
    }
    for status in registry.statuses() {
        println!(
            "camera {} source={} persons={} has_frame={}",
            status.id, status.source, status.person_count, status.has_frame
        );
    }

    registry.shutdown();
    Ok(())
}
