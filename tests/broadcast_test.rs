//! Fan-out behaviour of the broadcast hub
//!
//! Run with: cargo test --test broadcast_test

use crabrelay::failover::{FailoverController, FailoverOptions};
use crabrelay::testing::ScriptedBackend;
use crabrelay::{BroadcastHub, CaptureSettings, FrameProducer};
use std::sync::Arc;
use std::time::Duration;

const FPS: u32 = 200;
const TICKS: u64 = 90_000 / FPS as u64;

async fn start_hub(
    backend: &ScriptedBackend,
    capacity: usize,
    rotation: Option<Duration>,
) -> (Arc<BroadcastHub>, Arc<FailoverController>) {
    let settings = CaptureSettings {
        width: 16,
        height: 12,
        fps: FPS,
        ..CaptureSettings::default()
    };
    let controller = FailoverController::open(
        backend.candidates(),
        settings,
        Arc::new(backend.clone()),
        FailoverOptions {
            rotation_period: rotation,
            open_retry_backoff: Duration::from_millis(10),
        },
    )
    .await
    .unwrap();
    let hub = BroadcastHub::start(FrameProducer::new(Arc::clone(&controller)), capacity);
    (Arc::new(hub), controller)
}

#[tokio::test]
async fn test_late_subscriber_gets_no_backfill_and_no_gaps() {
    let backend = ScriptedBackend::new(1);
    let (hub, controller) = start_hub(&backend, 64, None).await;

    let mut early = hub.subscribe().unwrap();
    let mut last_early = 0;
    for _ in 0..5 {
        last_early = early.next().await.unwrap().pts;
    }

    let mut late = hub.subscribe().unwrap();
    let first = late.next().await.unwrap().pts;
    assert!(first > last_early);

    let mut previous = first;
    for _ in 0..10 {
        let pts = late.next().await.unwrap().pts;
        assert_eq!(pts - previous, TICKS);
        previous = pts;
    }
    assert_eq!(late.skipped(), 0);

    hub.close().await;
    controller.shutdown().await;
}

#[tokio::test]
async fn test_one_upstream_read_per_frame() {
    let backend = ScriptedBackend::new(1);
    let (hub, controller) = start_hub(&backend, 64, None).await;

    let mut subs: Vec<_> = (0..5).map(|_| hub.subscribe().unwrap()).collect();
    for sub in subs.iter_mut() {
        for _ in 0..3 {
            sub.next().await.unwrap();
        }
    }

    hub.close().await;
    assert_eq!(backend.reads(0), hub.frames_broadcast());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_slow_subscriber_does_not_hold_back_others() {
    let backend = ScriptedBackend::new(1);
    let (hub, controller) = start_hub(&backend, 4, None).await;

    let mut fast = hub.subscribe().unwrap();
    let mut slow = hub.subscribe().unwrap();

    let fast_task = tokio::spawn(async move {
        let mut previous = None;
        for _ in 0..20 {
            let pts = fast.next().await.unwrap().pts;
            if let Some(prev) = previous {
                assert_eq!(pts - prev, TICKS);
            }
            previous = Some(pts);
        }
        fast.skipped()
    });

    assert_eq!(fast_task.await.unwrap(), 0);

    // the slow subscriber lagged behind the 4-frame buffer and skips ahead
    let frame = slow.next().await.unwrap();
    assert!(slow.skipped() > 0);
    assert!(frame.pts > 0);

    hub.close().await;
    controller.shutdown().await;
}

#[tokio::test]
async fn test_frames_stay_ordered_across_rotations() {
    let backend = ScriptedBackend::new(3);
    let (hub, controller) = start_hub(&backend, 64, Some(Duration::from_millis(12))).await;

    let mut sub = hub.subscribe().unwrap();
    let mut previous = sub.next().await.unwrap().pts;
    let mut devices = std::collections::HashSet::new();
    for _ in 0..40 {
        let frame = sub.next().await.unwrap();
        assert_eq!(frame.pts - previous, TICKS);
        previous = frame.pts;
        devices.insert(frame.frame.device_id.clone());
    }

    assert!(devices.len() > 1, "rotation should switch cameras");
    hub.close().await;
    controller.shutdown().await;
}

#[tokio::test]
async fn test_teardown_ends_every_subscription() {
    let backend = ScriptedBackend::new(1);
    let (hub, controller) = start_hub(&backend, 16, None).await;

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let mut sub = hub.subscribe().unwrap();
            tokio::spawn(async move { while sub.next().await.is_some() {} })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    hub.close().await;
    controller.shutdown().await;

    for waiter in waiters {
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("subscription ended")
            .unwrap();
    }
    assert_eq!(backend.open_handles(), 0);
}

#[tokio::test]
async fn test_producer_timestamps_ignore_camera_failures() {
    let backend = ScriptedBackend::new(2);
    let settings = CaptureSettings {
        width: 16,
        height: 12,
        fps: FPS,
        ..CaptureSettings::default()
    };
    let controller = FailoverController::open(
        backend.candidates(),
        settings,
        Arc::new(backend.clone()),
        FailoverOptions {
            rotation_period: None,
            open_retry_backoff: Duration::from_millis(10),
        },
    )
    .await
    .unwrap();
    let mut producer = FrameProducer::new(Arc::clone(&controller));

    backend.fail_next_reads(0, 1);
    backend.fail_next_reads(1, 1);
    let frames: Vec<_> = {
        let mut frames = Vec::new();
        for _ in 0..8 {
            frames.push(producer.next().await);
        }
        frames
    };

    let fillers = frames.iter().filter(|f| f.frame.is_filler).count();
    assert_eq!(fillers, 2);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.pts, i as u64 * TICKS);
    }
    controller.shutdown().await;
}
