use std::sync::Arc;
use std::thread;

use occupancy_kernel::detect::{shared, ScriptedBackend};
use occupancy_kernel::ingest::{ReadStep, ScriptedOpener};
use occupancy_kernel::{CameraRegistry, Frame, FrameRefresher};

fn setup(opener: &ScriptedOpener, backend: ScriptedBackend) -> (Arc<CameraRegistry>, FrameRefresher) {
    let registry = Arc::new(CameraRegistry::new(Arc::new(opener.clone())));
    let refresher = FrameRefresher::new(Arc::clone(&registry), shared(backend));
    (registry, refresher)
}

#[test]
fn three_failed_reads_then_recovery() {
    let opener = ScriptedOpener::new(32, 24);
    let (registry, refresher) = setup(&opener, ScriptedBackend::constant(2));
    assert!(registry.add_camera("101", "stub://room-101"));

    refresher.tick();
    assert_eq!(registry.get_person_count("101"), Some(2));

    opener.script_reads(
        "stub://room-101",
        [ReadStep::Fail, ReadStep::Fail, ReadStep::Fail],
    );
    for _ in 0..3 {
        refresher.tick();
        assert_eq!(registry.get_frame("101"), None);
        assert_eq!(registry.get_person_count("101"), Some(0));
    }

    refresher.tick();
    let jpeg = registry.get_frame("101").expect("frame after recovery");
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    assert_eq!(registry.get_person_count("101"), Some(2));
    assert_eq!(opener.live_handles("stub://room-101"), 1);
}

#[test]
fn failing_camera_does_not_block_others() {
    let opener = ScriptedOpener::new(16, 16);
    let (registry, refresher) = setup(&opener, ScriptedBackend::constant(1));
    registry.add_camera("a", "stub://a");
    registry.add_camera("b", "stub://b");
    opener.script_reads("stub://a", [ReadStep::Fail]);

    let stats = refresher.tick();

    assert_eq!(stats.failures, 1);
    assert_eq!(stats.frames, 1);
    assert_eq!(registry.get_person_count("a"), Some(0));
    assert_eq!(registry.get_person_count("b"), Some(1));
}

#[test]
fn unregistered_camera_is_unknown_not_zero() {
    let opener = ScriptedOpener::new(8, 8);
    let (registry, refresher) = setup(&opener, ScriptedBackend::constant(5));
    refresher.tick();

    assert_eq!(registry.get_person_count("nowhere"), None);
    assert_eq!(registry.get_frame("nowhere"), None);
}

#[test]
fn concurrent_adds_open_one_handle() {
    let opener = ScriptedOpener::new(8, 8);
    let registry = Arc::new(CameraRegistry::new(Arc::new(opener.clone())));

    let joins: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.add_camera("7", "stub://seven"))
        })
        .collect();
    for join in joins {
        assert!(join.join().expect("add thread"));
    }

    assert_eq!(opener.opens("stub://seven"), 1);
    assert_eq!(registry.len(), 1);
}

/// Count the green occupancy markers drawn along the top-left strip.
fn markers_drawn(frame: &Frame) -> u32 {
    let pixels = frame.pixels();
    let mut markers = 0;
    loop {
        let x = 8 + markers * 12;
        if x >= frame.width {
            return markers;
        }
        let offset = ((8 * frame.width + x) * 3) as usize;
        if pixels[offset..offset + 3] != [0, 255, 0] {
            return markers;
        }
        markers += 1;
    }
}

#[test]
fn readers_never_see_a_frame_from_another_publish() {
    let opener = ScriptedOpener::new(96, 64);
    let (registry, refresher) = setup(&opener, ScriptedBackend::with_counts([1, 3, 1, 3, 1, 3]));
    registry.add_camera("1", "stub://1");

    let reader = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            let mut framed = 0;
            for _ in 0..500 {
                let snapshot = registry.snapshot("1").expect("registered");
                match snapshot.frame {
                    Some(frame) => {
                        assert_eq!(markers_drawn(&frame), snapshot.person_count);
                        framed += 1;
                    }
                    None => assert_eq!(snapshot.person_count, 0),
                }
                let _ = registry.get_frame("1");
            }
            framed
        })
    };
    for _ in 0..20 {
        refresher.tick();
    }
    reader.join().expect("reader thread");

    let snapshot = registry.snapshot("1").expect("registered");
    assert_eq!(snapshot.person_count, 3);
    let frame = snapshot.frame.expect("published frame");
    assert_eq!(markers_drawn(&frame), 3);
    assert_eq!(registry.get_person_count("1"), Some(3));
    assert!(registry.snapshot("unknown").is_none());
}

#[test]
fn removal_and_shutdown_release_handles() {
    let opener = ScriptedOpener::new(8, 8);
    let (registry, refresher) = setup(&opener, ScriptedBackend::constant(0));
    registry.add_camera("1", "stub://1");
    registry.add_camera("2", "stub://2");
    refresher.tick();

    registry.remove_camera("1");
    assert_eq!(opener.live_handles("stub://1"), 0);
    assert_eq!(registry.camera_ids(), vec!["2".to_string()]);

    registry.shutdown();
    assert_eq!(opener.live_handles("stub://2"), 0);
    assert!(registry.is_empty());
}
