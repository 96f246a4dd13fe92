//! Video impairment stage
//!
//! Simulates a poor connection: frames are downscaled, pushed through a
//! low-bitrate encode/decode round trip, occasionally replaced by the
//! previous output, and optionally held back to add latency.
//!
//! The encode backlog is bounded: while impairing, a frame reaching the stage
//! with more than [`MAX_PENDING_ENCODES`] frames already queued on it is
//! released by the pipeline instead of waiting.

use super::{Backlog, StageCommand, StageFailure, StageResult, TransformStage};
use crate::codecs::{default_codec_factory, CodecFactory, VideoCodec, VideoCodecConfig};
use crate::error::{MediaError, MediaResult};
use crate::frame::{Frame, MediaFrame, MediaKind, VideoFrame};
use crate::profile::{ImpairmentProfile, ImpairmentSettings, LatencyPolicy, VideoImpairmentProfile};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Encodes allowed in flight before incoming frames are dropped
pub const MAX_PENDING_ENCODES: usize = 2;

/// Counters for one video impairment stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoImpairmentStats {
    /// Frames that went through the codec
    pub encoded: u64,
    /// Frames replaced by the previous output
    pub repeated: u64,
    /// Frames dropped because the codec was backed up
    pub dropped_backpressure: u64,
    /// Forced full-quality keyframes emitted
    pub keyframes: u64,
    /// Codec failures
    pub failures: u64,
}

/// Downscale, recompress, repeat and delay video frames
pub struct VideoImpairmentStage {
    settings: ImpairmentSettings,
    profile: Option<VideoImpairmentProfile>,
    running: bool,
    latency: LatencyPolicy,
    factory: CodecFactory,
    codec: Option<Box<dyn VideoCodec>>,
    source_size: Option<(u32, u32)>,
    backlog: Arc<Backlog>,
    force_keyframe: bool,
    last_output: Option<VideoFrame>,
    rng: StdRng,
    stats: VideoImpairmentStats,
}

impl VideoImpairmentStage {
    /// Stopped stage with no profile
    pub fn new(latency: LatencyPolicy) -> Self {
        Self {
            settings: ImpairmentSettings::disabled(),
            profile: None,
            running: false,
            latency,
            factory: default_codec_factory(),
            codec: None,
            source_size: None,
            backlog: Arc::new(Backlog::new(MAX_PENDING_ENCODES)),
            force_keyframe: false,
            last_output: None,
            rng: StdRng::from_entropy(),
            stats: VideoImpairmentStats::default(),
        }
    }

    /// Use a deterministic random source
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Use codecs from `factory`
    pub fn with_codec_factory(mut self, factory: CodecFactory) -> Self {
        self.factory = factory;
        self.codec = None;
        self.source_size = None;
        self
    }

    /// Whether frames are currently being impaired
    pub fn is_active(&self) -> bool {
        self.running && self.profile.is_some()
    }

    /// Settings last applied
    pub fn settings(&self) -> &ImpairmentSettings {
        &self.settings
    }

    /// Resolved profile, if the settings are active
    pub fn profile(&self) -> Option<&VideoImpairmentProfile> {
        self.profile.as_ref()
    }

    /// Counters
    pub fn stats(&self) -> VideoImpairmentStats {
        VideoImpairmentStats {
            dropped_backpressure: self.backlog.shed(),
            ..self.stats
        }
    }

    /// Begin impairing frames
    pub fn start(&mut self) {
        if !self.running {
            info!("Video impairment started ({})", self.settings.level);
        }
        self.running = true;
        self.backlog.set_engaged(self.is_active());
    }

    /// Pass frames through, keeping codec state
    pub fn stop(&mut self) {
        if self.running {
            info!("Video impairment stopped");
        }
        self.running = false;
        self.backlog.set_engaged(false);
    }

    /// Swap in new settings
    ///
    /// The codec is flushed and reconfigured and the next frame is emitted as
    /// a full-quality keyframe. If the codec rejects the new configuration the
    /// previous one stays active.
    pub fn apply(&mut self, settings: ImpairmentSettings) -> MediaResult<()> {
        let profile = match ImpairmentProfile::resolve(MediaKind::Video, &settings)? {
            Some(ImpairmentProfile::Video(profile)) => Some(profile),
            _ => None,
        };

        if let Some(codec) = self.codec.as_mut() {
            if let Err(e) = codec.flush() {
                warn!("Video codec flush failed before reconfiguration: {}", e);
            }
        }

        if let (Some(profile), Some((width, height))) = (profile, self.source_size) {
            if let Err(e) = self.configure_codec(&profile, width, height) {
                warn!("Video impairment reconfiguration rejected: {}", e);
                return Err(e);
            }
        }

        debug!("Video impairment settings applied: {:?}", settings);
        self.settings = settings;
        self.profile = profile;
        self.force_keyframe = true;
        self.last_output = None;
        self.backlog.set_engaged(self.is_active());
        Ok(())
    }

    fn configure_codec(
        &mut self,
        profile: &VideoImpairmentProfile,
        width: u32,
        height: u32,
    ) -> MediaResult<()> {
        let scaled_width = ((width as f64 * profile.resolution_scale).round() as u32).max(1);
        let scaled_height = ((height as f64 * profile.resolution_scale).round() as u32).max(1);
        let config = VideoCodecConfig {
            width: scaled_width,
            height: scaled_height,
            bitrate: profile.bitrate(scaled_width, scaled_height),
            framerate: profile.frame_rate,
        };

        let factory = &self.factory;
        let codec = self.codec.get_or_insert_with(|| factory());
        if codec.config() == Some(config) {
            return Ok(());
        }
        codec.configure(config)
    }

    fn latency_ms(&self, profile: &VideoImpairmentProfile) -> u64 {
        if self.latency.video {
            profile.latency_ms
        } else {
            0
        }
    }

    async fn round_trip(&mut self, scaled: VideoFrame) -> MediaResult<VideoFrame> {
        let mut codec = match self.codec.take() {
            Some(codec) => codec,
            None => {
                return Err(MediaError::InvalidState {
                    message: "video codec not configured".to_string(),
                })
            }
        };

        let joined = tokio::task::spawn_blocking(move || {
            let outcome = codec
                .encode(&scaled, false)
                .and_then(|chunk| codec.decode(&chunk));
            (codec, outcome)
        })
        .await;

        match joined {
            Ok((codec, outcome)) => {
                self.codec = Some(codec);
                outcome
            }
            Err(e) => {
                // Codec is gone with the task; the next frame recreates it
                self.source_size = None;
                Err(MediaError::EncodingFailed {
                    codec: "video".to_string(),
                    reason: format!("Thread pool error: {}", e),
                })
            }
        }
    }
}

impl fmt::Debug for VideoImpairmentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoImpairmentStage")
            .field("settings", &self.settings)
            .field("running", &self.running)
            .field("codec", &self.codec)
            .field("pending", &self.backlog.pending())
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl TransformStage for VideoImpairmentStage {
    fn name(&self) -> &str {
        "video-impairment"
    }

    async fn transform(&mut self, mut frame: Frame) -> StageResult {
        let profile = match self.profile {
            Some(profile) if self.running => profile,
            _ => return Ok(Some(frame)),
        };
        let source = match frame.as_video() {
            Some(video) => video.clone(),
            None => return Ok(Some(frame)),
        };

        let size = (source.width, source.height);
        if self.source_size != Some(size) || self.codec.is_none() {
            if let Err(e) = self.configure_codec(&profile, size.0, size.1) {
                self.stats.failures += 1;
                return Err(StageFailure::with_frame(e, frame));
            }
            self.source_size = Some(size);
        }

        if self.force_keyframe {
            self.force_keyframe = false;
            self.stats.keyframes += 1;
            if let Some(video) = frame.as_video_mut() {
                video.is_keyframe = true;
                self.last_output = Some(video.clone());
            }
            debug!("Emitting forced keyframe at {} us", source.timestamp_us);
            frame.hold_for(self.latency_ms(&profile));
            return Ok(Some(frame));
        }

        if let Some(last) = &self.last_output {
            if self.rng.gen_bool(profile.drop_probability) {
                let mut repeat = frame.derive(MediaFrame::Video(last.clone()));
                frame.close();
                self.stats.repeated += 1;
                repeat.hold_for(self.latency_ms(&profile));
                return Ok(Some(repeat));
            }
        }

        let (width, height) = match self.codec.as_ref().and_then(|codec| codec.config()) {
            Some(config) => (config.width, config.height),
            None => size,
        };
        let scaled = match source.resized(width, height) {
            Ok(scaled) => scaled,
            Err(e) => {
                self.stats.failures += 1;
                return Err(StageFailure::with_frame(e, frame));
            }
        };

        match self.round_trip(scaled).await {
            Ok(mut decoded) => {
                decoded.display_width = source.display_width;
                decoded.display_height = source.display_height;
                decoded.timestamp_us = source.timestamp_us;
                decoded.duration_us = source.duration_us;
                decoded.is_keyframe = false;
                self.last_output = Some(decoded.clone());
                frame.replace_media(MediaFrame::Video(decoded));
                self.stats.encoded += 1;
                frame.hold_for(self.latency_ms(&profile));
                Ok(Some(frame))
            }
            Err(e) => {
                self.stats.failures += 1;
                Err(StageFailure::with_frame(e, frame))
            }
        }
    }

    async fn handle(&mut self, command: StageCommand) -> MediaResult<()> {
        match command {
            StageCommand::Start => {
                self.start();
                Ok(())
            }
            StageCommand::Stop => {
                self.stop();
                Ok(())
            }
            StageCommand::Configure(settings) => self.apply(settings),
            other => Err(MediaError::UnsupportedCommand {
                stage: self.name().to_string(),
                command: other.name().to_string(),
            }),
        }
    }

    async fn flush(&mut self) -> MediaResult<()> {
        match self.codec.as_mut() {
            Some(codec) => codec.flush(),
            None => Ok(()),
        }
    }

    fn backlog(&self) -> Option<Arc<Backlog>> {
        Some(self.backlog.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameLedger, PixelFormat};
    use crate::profile::ImpairmentLevel;

    fn frame(ledger: &FrameLedger, ts: i64) -> Frame {
        let video = VideoFrame::filled(100, 50, PixelFormat::Gray8, 128, ts);
        Frame::tracked(MediaFrame::Video(video), ledger)
    }

    fn severe_stage() -> VideoImpairmentStage {
        let mut stage = VideoImpairmentStage::new(LatencyPolicy::default()).with_seed(7);
        stage.apply(ImpairmentSettings::at(ImpairmentLevel::Severe)).unwrap();
        stage.start();
        stage
    }

    #[tokio::test]
    async fn test_stopped_stage_passes_frames() {
        let ledger = FrameLedger::new();
        let mut stage = VideoImpairmentStage::new(LatencyPolicy::default());
        let out = stage.transform(frame(&ledger, 1)).await.unwrap().unwrap();
        assert_eq!(out.as_video().unwrap().width, 100);
        out.close();
    }

    #[tokio::test]
    async fn test_first_frame_after_apply_is_full_keyframe() {
        let ledger = FrameLedger::new();
        let mut stage = severe_stage();

        let first = stage.transform(frame(&ledger, 1)).await.unwrap().unwrap();
        let video = first.as_video().unwrap();
        assert!(video.is_keyframe);
        assert_eq!(video.width, 100);
        first.close();

        let mut saw_scaled = false;
        for ts in 2..20 {
            let out = stage.transform(frame(&ledger, ts)).await.unwrap().unwrap();
            let video = out.as_video().unwrap();
            if video.width == 10 {
                assert_eq!(video.height, 5);
                assert_eq!(video.display_width, 100);
                assert!(!video.is_keyframe);
                saw_scaled = true;
            }
            out.close();
        }
        assert!(saw_scaled);
        assert!(ledger.snapshot().is_balanced());
    }

    #[tokio::test]
    async fn test_stop_keeps_codec_state() {
        let ledger = FrameLedger::new();
        let mut stage = severe_stage();
        stage.transform(frame(&ledger, 1)).await.unwrap().unwrap().close();
        stage.stop();
        assert!(!stage.is_active());
        assert!(stage.codec.is_some());
        stage.start();
        assert!(stage.is_active());
    }

    #[test]
    fn test_backlog_engaged_only_while_impairing() {
        let mut stage = VideoImpairmentStage::new(LatencyPolicy::default());
        let backlog = stage.backlog().unwrap();
        stage.start();
        assert!(!backlog.is_engaged());

        stage.apply(ImpairmentSettings::at(ImpairmentLevel::Moderate)).unwrap();
        assert!(backlog.is_engaged());
        stage.stop();
        assert!(!backlog.is_engaged());
        stage.start();
        stage.apply(ImpairmentSettings::disabled()).unwrap();
        assert!(!backlog.is_engaged());
    }

    #[tokio::test]
    async fn test_rejected_settings_keep_previous_profile() {
        let mut stage = severe_stage();
        let mut bad = ImpairmentSettings::at(ImpairmentLevel::Moderate);
        bad.overrides.resolution_scale = Some(2.0);
        assert!(stage.apply(bad).is_err());
        assert_eq!(stage.settings().level, ImpairmentLevel::Severe);
    }
}
