//! Integration tests for the source adapter and proxy track

use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use trackwarp_media::*;

fn camera() -> (Arc<SourceTrack>, FrameWriter) {
    let mut descriptor = TrackDescriptor::new(MediaKind::Video, "USB Camera");
    descriptor.settings.device_id = Some("usb-42".to_string());
    descriptor.settings.width = Some(64);
    descriptor.settings.height = Some(48);
    descriptor.settings.frame_rate = Some(30.0);
    SourceTrack::new(descriptor, 4)
}

#[test]
fn test_adapter_takes_source_exactly_once() {
    let (track, _device) = camera();
    let adapter = assert_ok!(FrameSourceAdapter::attach(track.as_ref(), 4));
    assert_eq!(adapter.track_id(), track.id());

    let second = assert_err!(FrameSourceAdapter::attach(track.as_ref(), 4));
    assert!(matches!(second, MediaError::AlreadyTransferred { .. }));
}

#[test]
fn test_ended_track_cannot_be_attached() {
    let (track, _device) = camera();
    track.stop();
    let result = FrameSourceAdapter::attach(track.as_ref(), 4);
    assert!(matches!(result, Err(MediaError::TrackEnded { .. })));
}

#[tokio::test]
async fn test_frames_flow_from_device_to_proxy() {
    let (track, device) = camera();
    let adapter = FrameSourceAdapter::attach(track.as_ref(), 4).unwrap();
    let (handles, output) = adapter.transfer();
    let proxy = ProxyTrack::new(track.clone(), output);

    let manager = TransformManager::new();
    let pump = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.pipe(handles.source, handles.sink).await })
    };

    for ts in 0..10 {
        let frame = VideoFrame::filled(64, 48, PixelFormat::Rgba8, ts as u8, ts);
        device.push(MediaFrame::Video(frame)).await.unwrap();
    }
    drop(device);

    let mut frames = proxy.take_frames().unwrap();
    assert!(proxy.take_frames().is_err());

    let mut received = 0;
    while let Some(frame) = tokio::time::timeout(Duration::from_secs(5), frames.read())
        .await
        .unwrap()
    {
        assert_eq!(frame.timestamp_us(), received);
        received += 1;
    }
    assert_eq!(received, 10);
    pump.await.unwrap().unwrap();

    let ledger = track.ledger().snapshot();
    assert_eq!(ledger.forwarded, 10);
    assert!(ledger.is_balanced());
}

#[tokio::test]
async fn test_substitute_stage_replaces_live_video() {
    let (track, device) = camera();
    let (handles, mut output) = FrameSourceAdapter::attach(track.as_ref(), 4).unwrap().transfer();

    let clip = vec![VideoFrame::filled(16, 12, PixelFormat::Rgba8, 250, 0)];
    let (substitute, player) = spawn_player(
        clip,
        PlayerConfig {
            frame_rate: 1_000,
            loop_count: Some(1),
            capacity: 1,
        },
    );
    // Wait for the clip frame to be buffered
    tokio::time::sleep(Duration::from_millis(20)).await;

    let manager = TransformManager::new();
    manager.add(SUBSTITUTE_STAGE, Box::new(SubstituteStage::new(substitute)), Some(StagePosition::First));
    let pump = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.pipe(handles.source, handles.sink).await })
    };

    device
        .push(MediaFrame::Video(VideoFrame::filled(64, 48, PixelFormat::Rgba8, 1, 77)))
        .await
        .unwrap();
    let replaced = output.read().await.unwrap();
    let video = replaced.as_video().unwrap();
    assert_eq!(video.timestamp_us, 77);
    assert_eq!((video.width, video.height), (64, 48));
    assert!(video.data.iter().all(|v| *v == 250));

    drop(device);
    while output.read().await.is_some() {}
    pump.await.unwrap().unwrap();
    player.stop();
    assert!(track.ledger().snapshot().is_balanced());
}
