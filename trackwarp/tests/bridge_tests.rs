//! Integration tests for processed tracks: setup, lifecycle and teardown

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};
use trackwarp::*;

const WAIT: Duration = Duration::from_secs(5);

fn camera() -> (Arc<SourceTrack>, FrameWriter) {
    let mut descriptor = TrackDescriptor::new(MediaKind::Video, "Integrated Camera");
    descriptor.settings.device_id = Some("cam-0".to_string());
    descriptor.settings.width = Some(32);
    descriptor.settings.height = Some(24);
    SourceTrack::new(descriptor, 16)
}

fn config(mode: ContextMode) -> GlobalConfig {
    GlobalConfig {
        context_mode: mode,
        rng_seed: Some(11),
        ..GlobalConfig::default()
    }
}

fn video(ts: i64) -> MediaFrame {
    MediaFrame::Video(VideoFrame::filled(32, 24, PixelFormat::Rgba8, 128, ts))
}

/// Push `count` frames and read them back from the processed track
async fn exchange(device: &FrameWriter, output: &mut FrameReader, start: i64, count: i64) -> Vec<Frame> {
    let mut received = Vec::new();
    for ts in start..start + count {
        device.push(video(ts)).await.unwrap();
        let frame = tokio::time::timeout(WAIT, output.read())
            .await
            .expect("frame in time")
            .expect("stream open");
        received.push(frame);
    }
    received
}

async fn wait_state(processed: &ProcessedTrack, target: BridgeState) {
    let reached = tokio::time::timeout(WAIT, processed.bridge().wait_for_state(|s| s == target))
        .await
        .expect("state in time");
    assert_eq!(reached, target);
}

/// Shared-runtime context whose tasks can be made to vanish
#[derive(Debug)]
struct CrashingContext {
    inner: SharedRuntimeContext,
    crash: Arc<Notify>,
}

impl ExecutionContext for CrashingContext {
    fn spawn(&self, label: &str, task: BoxFuture<'static, ()>) -> TrackWarpResult<ContextHandle> {
        let crash = self.crash.clone();
        let wrapped = async move {
            tokio::select! {
                _ = task => {}
                _ = crash.notified() => {}
            }
        };
        self.inner.spawn(label, wrapped.boxed())
    }
}

fn crashing_warp() -> (TrackWarp, Arc<Notify>) {
    let crash = Arc::new(Notify::new());
    let context = CrashingContext {
        inner: SharedRuntimeContext::current().unwrap(),
        crash: crash.clone(),
    };
    let warp = TrackWarp::init_with(config(ContextMode::SharedRuntime))
        .unwrap()
        .with_context(Arc::new(context));
    (warp, crash)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_running_after_ack_in_both_context_modes() {
    for mode in [ContextMode::DedicatedThread, ContextMode::SharedRuntime] {
        let warp = assert_ok!(TrackWarp::init_with(config(mode)));
        let (camera, device) = camera();

        let processed = assert_ok!(warp.processor(camera.clone()).build().await);
        assert_eq!(processed.state(), BridgeState::SetupPending);
        assert_ne!(processed.id(), camera.id());

        let proxy = processed.track();
        let settings = proxy.settings();
        assert!(is_synthetic_device_id(settings.device_id.as_deref().unwrap()));
        assert_eq!(settings.width, Some(32));

        let mut output = proxy.take_frames().unwrap();
        let frames = exchange(&device, &mut output, 0, 3).await;
        assert_eq!(frames.len(), 3);
        wait_state(&processed, BridgeState::Running).await;

        let stored: Option<BridgeState> = warp
            .store()
            .get_as(&keys::track_state(processed.id()))
            .unwrap();
        assert_eq!(stored, Some(BridgeState::Running));

        drop(device);
        camera.stop();
        let end = tokio::time::timeout(WAIT, processed.bridge().wait_terminal()).await;
        assert_eq!(end.unwrap(), BridgeState::Ended);
    }
}

#[tokio::test]
async fn test_mute_pauses_and_unmute_resumes() {
    let warp = TrackWarp::init().unwrap();
    let mut events = warp.events();
    let (camera, device) = camera();

    let processed = warp.processor(camera.clone()).build().await.unwrap();
    let mut output = processed.track().take_frames().unwrap();
    exchange(&device, &mut output, 0, 3).await;
    wait_state(&processed, BridgeState::Running).await;

    camera.set_muted(true);
    wait_state(&processed, BridgeState::Paused).await;
    assert!(processed.track().muted());

    camera.set_muted(false);
    wait_state(&processed, BridgeState::Running).await;
    exchange(&device, &mut output, 3, 2).await;

    while let Some(event) = events.try_next() {
        assert!(!event.is_error(), "unexpected {:?}", event);
    }
    assert_eq!(camera.ready_state(), TrackReadyState::Live);
}

#[tokio::test]
async fn test_setup_failure_falls_back_to_original() {
    let warp = TrackWarp::init().unwrap();
    let (camera, _device) = camera();

    // Someone else already owns the frames
    let _taken = camera.take_frames().unwrap();

    let result = warp.processor(camera.clone()).build().await;
    assert_err!(result);

    let altered = warp.processor(camera.clone()).build_or_passthrough().await;
    assert!(!altered.is_processed());
    assert_eq!(altered.track().id(), camera.id());
}

/// Context that cannot run workers
#[derive(Debug)]
struct RefusingContext;

impl ExecutionContext for RefusingContext {
    fn spawn(&self, label: &str, _task: BoxFuture<'static, ()>) -> TrackWarpResult<ContextHandle> {
        Err(TrackWarpError::Initialization {
            reason: format!("no capacity for {}", label),
        })
    }
}

/// Context that accepts workers but never runs them
#[derive(Debug)]
struct StallingContext {
    inner: SharedRuntimeContext,
}

impl ExecutionContext for StallingContext {
    fn spawn(&self, label: &str, task: BoxFuture<'static, ()>) -> TrackWarpResult<ContextHandle> {
        let stalled = async move {
            let _worker = task;
            futures::future::pending::<()>().await
        };
        self.inner.spawn(label, stalled.boxed())
    }
}

async fn assert_original_still_flows(camera: &SourceTrack, device: &FrameWriter) {
    let mut frames = assert_ok!(camera.take_frames());
    assert_ok!(device.push(video(7)).await);
    let frame = tokio::time::timeout(WAIT, frames.read())
        .await
        .expect("frame in time")
        .expect("stream open");
    assert_eq!(frame.timestamp_us(), 7);
    frame.close();
    assert!(camera.ledger().snapshot().is_balanced());
    assert_ok!(camera.restore_frames(frames));
}

#[tokio::test]
async fn test_refused_worker_leaves_original_usable() {
    let warp = TrackWarp::init_with(config(ContextMode::SharedRuntime))
        .unwrap()
        .with_context(Arc::new(RefusingContext));
    let (camera, device) = camera();

    let altered = warp.processor(camera.clone()).build_or_passthrough().await;
    assert!(!altered.is_processed());
    assert_eq!(altered.track().id(), camera.id());
    assert_original_still_flows(&camera, &device).await;
}

#[tokio::test]
async fn test_setup_timeout_leaves_original_usable() {
    let context = StallingContext {
        inner: SharedRuntimeContext::current().unwrap(),
    };
    let warp = TrackWarp::init_with(GlobalConfig {
        setup_timeout_ms: 50,
        ..config(ContextMode::SharedRuntime)
    })
    .unwrap()
    .with_context(Arc::new(context));
    let (camera, device) = camera();

    let result = warp.processor(camera.clone()).build().await;
    assert!(matches!(result, Err(TrackWarpError::Timeout { .. })));
    assert_original_still_flows(&camera, &device).await;

    // A second attempt gets the frames again and gives them back again
    let altered = warp.processor(camera.clone()).build_or_passthrough().await;
    assert!(!altered.is_processed());
    assert_original_still_flows(&camera, &device).await;
}

#[tokio::test]
async fn test_worker_failure_tears_down_once() {
    let (warp, crash) = crashing_warp();
    let mut events = warp.events();
    let (camera, device) = camera();

    let processed = warp.processor(camera.clone()).build().await.unwrap();
    let mut output = processed.track().take_frames().unwrap();
    exchange(&device, &mut output, 0, 3).await;
    wait_state(&processed, BridgeState::Running).await;

    crash.notify_one();
    let end = tokio::time::timeout(WAIT, processed.bridge().wait_terminal()).await;
    assert_eq!(end.unwrap(), BridgeState::Errored);

    let errored = tokio::time::timeout(
        WAIT,
        events.wait_for(processed.id(), |e| matches!(e, TrackEvent::Errored { .. })),
    )
    .await
    .unwrap();
    assert!(errored.is_some());

    // Torn down: source ended, proxy stream closed, reported once
    assert_eq!(camera.ready_state(), TrackReadyState::Ended);
    assert!(tokio::time::timeout(WAIT, output.read()).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let repeats = std::iter::from_fn(|| events.try_next())
        .filter(|e| matches!(e, TrackEvent::Errored { .. }))
        .count();
    assert_eq!(repeats, 0);

    let stored: Option<BridgeState> = warp
        .store()
        .get_as(&keys::track_state(processed.id()))
        .unwrap();
    assert_eq!(stored, Some(BridgeState::Errored));
}

#[tokio::test]
async fn test_worker_failure_while_muted_is_ignored() {
    let (warp, crash) = crashing_warp();
    let mut events = warp.events();
    let (camera, device) = camera();

    let processed = warp.processor(camera.clone()).build().await.unwrap();
    let mut output = processed.track().take_frames().unwrap();
    exchange(&device, &mut output, 0, 3).await;
    wait_state(&processed, BridgeState::Running).await;

    camera.set_muted(true);
    wait_state(&processed, BridgeState::Paused).await;

    crash.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(processed.state(), BridgeState::Paused);
    assert_eq!(camera.ready_state(), TrackReadyState::Live);
    while let Some(event) = events.try_next() {
        assert!(!matches!(event, TrackEvent::Errored { .. }));
    }
}

#[tokio::test]
async fn test_stored_impairment_reaches_worker() {
    let warp = TrackWarp::init().unwrap();
    let mut events = warp.events();
    warp.set_impairment(MediaKind::Video, ImpairmentSettings::at(ImpairmentLevel::Severe))
        .unwrap();
    let (camera, device) = camera();

    let processed = warp.processor(camera.clone()).build().await.unwrap();
    let applied = tokio::time::timeout(
        WAIT,
        events.wait_for(processed.id(), |e| {
            matches!(e, TrackEvent::ImpairmentApplied { active: true, .. })
        }),
    )
    .await
    .unwrap();
    assert!(applied.is_some());
    let active: Option<bool> = warp.store().get_as(keys::IMPAIRMENT_VIDEO_ACTIVE).unwrap();
    assert_eq!(active, Some(true));

    let mut output = processed.track().take_frames().unwrap();
    let frames = exchange(&device, &mut output, 0, 20).await;
    let degraded = frames
        .iter()
        .filter_map(|f| f.as_video())
        .filter(|v| v.is_downscaled())
        .count();
    assert!(degraded > 0);
    for frame in &frames {
        let video = frame.as_video().unwrap();
        assert_eq!((video.display_width, video.display_height), (32, 24));
    }

    // Switching off goes through the store as well
    warp.set_impairment(MediaKind::Video, ImpairmentSettings::disabled())
        .unwrap();
    let cleared = tokio::time::timeout(
        WAIT,
        events.wait_for(processed.id(), |e| {
            matches!(e, TrackEvent::ImpairmentApplied { active: false, .. })
        }),
    )
    .await
    .unwrap();
    assert!(cleared.is_some());
    let frames = exchange(&device, &mut output, 20, 3).await;
    assert!(frames
        .iter()
        .all(|f| !f.as_video().unwrap().is_downscaled()));
}

#[tokio::test]
async fn test_invalid_bus_settings_are_reported_not_applied() {
    let warp = TrackWarp::init().unwrap();
    let mut events = warp.events();
    let (camera, _device) = camera();
    let processed = warp.processor(camera).build().await.unwrap();

    let broken = ImpairmentSettings {
        overrides: ImpairmentOverrides {
            resolution_scale: Some(0.0),
            ..ImpairmentOverrides::default()
        },
        ..ImpairmentSettings::at(ImpairmentLevel::Moderate)
    };
    warp.bus()
        .send(
            ContextKind::Dashboard,
            ContextKind::Page,
            Topic::ImpairmentChange,
            ControlMessage::Impairment {
                kind: MediaKind::Video,
                settings: broken,
            },
        )
        .unwrap();

    let rejected = tokio::time::timeout(
        WAIT,
        events.wait_for(processed.id(), |e| matches!(e, TrackEvent::ImpairmentRejected { .. })),
    )
    .await
    .unwrap();
    assert!(rejected.is_some());
}

#[tokio::test]
async fn test_capture_through_bridge() {
    let warp = TrackWarp::init().unwrap();
    let (camera, device) = camera();
    let processed = warp.processor(camera).build().await.unwrap();
    let mut output = processed.track().take_frames().unwrap();

    let mut session = processed
        .bridge()
        .start_capture(CaptureSettings {
            interval: Duration::ZERO,
            max_frames: Some(2),
            capacity: 4,
        })
        .await
        .unwrap();
    // Let the worker insert the tap
    tokio::time::sleep(Duration::from_millis(50)).await;
    exchange(&device, &mut output, 0, 5).await;

    let first = tokio::time::timeout(WAIT, session.next()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, session.next()).await.unwrap().unwrap();
    assert_eq!((first.sequence, second.sequence), (0, 1));
    assert_eq!(first.frame.width, 32);
    assert!(session.next().await.is_none());

    assert_ok!(processed.bridge().stop_capture().await);
}

#[tokio::test]
async fn test_track_end_shuts_worker_down() {
    let warp = TrackWarp::init().unwrap();
    let mut events = warp.events();
    let (camera, device) = camera();
    let processed = warp.processor(camera.clone()).build().await.unwrap();
    let mut output = processed.track().take_frames().unwrap();
    exchange(&device, &mut output, 0, 3).await;

    // The device stops delivering when its track is stopped
    processed.stop();
    drop(device);

    let end = tokio::time::timeout(WAIT, processed.bridge().wait_terminal()).await;
    assert_eq!(end.unwrap(), BridgeState::Ended);
    let ended = tokio::time::timeout(
        WAIT,
        events.wait_for(processed.id(), |e| matches!(e, TrackEvent::Ended { .. })),
    )
    .await
    .unwrap();
    assert!(ended.is_some());
    assert!(tokio::time::timeout(WAIT, output.read()).await.unwrap().is_none());
}
