//! Impairment demo for trackwarp
//!
//! Feeds a synthetic camera through a processed track and switches the video
//! impairment level while frames flow.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use trackwarp::{
    init_logging, GlobalConfig, ImpairmentLevel, ImpairmentSettings, MediaFrame, MediaKind,
    PixelFormat, SourceTrack, TrackDescriptor, TrackWarp, VideoFrame,
};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const FRAMES_PER_LEVEL: i64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GlobalConfig::default();
    init_logging(&config);

    let warp = TrackWarp::init_with(config).context("initializing trackwarp")?;
    let mut events = warp.events();
    let mut descriptor = TrackDescriptor::new(MediaKind::Video, "Synthetic Camera");
    descriptor.settings.width = Some(WIDTH);
    descriptor.settings.height = Some(HEIGHT);
    descriptor.settings.frame_rate = Some(30.0);
    let (camera, device) = SourceTrack::new(descriptor, 8);

    let processed = warp
        .processor(camera.clone())
        .build()
        .await
        .context("building processed track")?;
    let mut output = processed.track().take_frames()?;
    println!("🎥 Processing track {} ({})", processed.id(), processed.state());

    // Read processed frames on their own task; the impairment may drop some
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        let mut last_checksum = None;
        while let Some(frame) = output.read().await {
            if let Some(video) = frame.as_video() {
                let checksum: u64 = video.data.iter().map(|v| *v as u64).sum();
                let repeated = last_checksum == Some(checksum);
                last_checksum = Some(checksum);
                let _ = seen_tx.send((video.is_downscaled(), repeated));
            }
            frame.close();
        }
    });

    let mut ts = 0i64;
    let mut ticker = tokio::time::interval(Duration::from_millis(33));
    for level in [
        ImpairmentLevel::Passthrough,
        ImpairmentLevel::Moderate,
        ImpairmentLevel::Severe,
        ImpairmentLevel::Passthrough,
    ] {
        warp.set_impairment(MediaKind::Video, ImpairmentSettings::at(level))?;

        for _ in 0..FRAMES_PER_LEVEL {
            ticker.tick().await;
            let shade = (ts % 200) as u8 + 20;
            let frame = VideoFrame::filled(WIDTH, HEIGHT, PixelFormat::Rgba8, shade, ts * 33_333);
            device.push(MediaFrame::Video(frame)).await?;
            ts += 1;
        }
        // Let delayed frames drain before counting
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (mut received, mut downscaled, mut repeated) = (0, 0, 0);
        while let Ok((is_downscaled, is_repeat)) = seen.try_recv() {
            received += 1;
            downscaled += is_downscaled as u32;
            repeated += is_repeat as u32;
        }
        println!(
            "📊 {:<11} sent {:>3}, received {:>3}, downscaled {:>3}, repeated {:>3}",
            level.to_string(),
            FRAMES_PER_LEVEL,
            received,
            downscaled,
            repeated
        );
    }

    println!("🔍 State: {}", processed.state());
    processed.stop();
    drop(device);
    let end = processed.bridge().wait_terminal().await;
    println!("✅ Finished: {}", end);
    let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
    while let Some(event) = events.try_next() {
        println!("📨 {}", event.event_type());
    }

    let ledger = camera.ledger().snapshot();
    println!(
        "🧮 Frames allocated {}, forwarded {}, released {}, leaked {}",
        ledger.allocated, ledger.forwarded, ledger.released, ledger.leaked
    );
    Ok(())
}
