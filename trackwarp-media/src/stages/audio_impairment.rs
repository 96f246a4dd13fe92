//! Audio impairment stage
//!
//! Two kinds of loss are layered. Every 60 s window a fixed number of
//! one-second buckets is picked at random and silenced completely; outside
//! those buckets each sample-frame is zeroed with the drop probability.

use super::{StageCommand, StageResult, TransformStage};
use crate::error::{MediaError, MediaResult};
use crate::frame::{Frame, MediaKind};
use crate::profile::{AudioImpairmentProfile, ImpairmentProfile, ImpairmentSettings, LatencyPolicy};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// One-second buckets per clipping window
pub const WINDOW_BUCKETS: usize = 60;

/// Counters for one audio impairment stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioImpairmentStats {
    /// Audio frames seen while active
    pub frames: u64,
    /// Sample-frames zeroed by random drops
    pub dropped_samples: u64,
    /// Sample-frames zeroed by silenced buckets
    pub clipped_samples: u64,
    /// Clipping windows started
    pub windows: u64,
}

#[derive(Debug)]
struct ClipWindow {
    start: u64,
    sample_rate: u32,
    silenced: [bool; WINDOW_BUCKETS],
}

/// Zero samples and silence whole seconds of audio
#[derive(Debug)]
pub struct AudioImpairmentStage {
    settings: ImpairmentSettings,
    profile: Option<AudioImpairmentProfile>,
    running: bool,
    latency: LatencyPolicy,
    position: u64,
    window: Option<ClipWindow>,
    rng: StdRng,
    stats: AudioImpairmentStats,
}

impl AudioImpairmentStage {
    /// Stopped stage with no profile
    pub fn new(latency: LatencyPolicy) -> Self {
        Self {
            settings: ImpairmentSettings::disabled(),
            profile: None,
            running: false,
            latency,
            position: 0,
            window: None,
            rng: StdRng::from_entropy(),
            stats: AudioImpairmentStats::default(),
        }
    }

    /// Use a deterministic random source
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
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

    /// Counters
    pub fn stats(&self) -> AudioImpairmentStats {
        self.stats
    }

    /// Buckets silenced in the current window, ascending
    pub fn silenced_buckets(&self) -> Vec<usize> {
        match &self.window {
            Some(window) => window
                .silenced
                .iter()
                .enumerate()
                .filter(|(_, silenced)| **silenced)
                .map(|(bucket, _)| bucket)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Begin impairing frames
    pub fn start(&mut self) {
        if !self.running {
            info!("Audio impairment started ({})", self.settings.level);
        }
        self.running = true;
    }

    /// Pass frames through, keeping the current window
    pub fn stop(&mut self) {
        if self.running {
            info!("Audio impairment stopped");
        }
        self.running = false;
    }

    /// Swap in new settings and restart the clipping window
    pub fn apply(&mut self, settings: ImpairmentSettings) -> MediaResult<()> {
        let profile = match ImpairmentProfile::resolve(MediaKind::Audio, &settings)? {
            Some(ImpairmentProfile::Audio(profile)) => Some(profile),
            _ => None,
        };
        debug!("Audio impairment settings applied: {:?}", settings);
        self.settings = settings;
        self.profile = profile;
        self.window = None;
        self.position = 0;
        Ok(())
    }

    fn roll_window(&mut self, profile: &AudioImpairmentProfile, sample_rate: u32) -> ClipWindow {
        let count = ((profile.clipping_pct * WINDOW_BUCKETS as f64).round() as usize).min(WINDOW_BUCKETS);
        let mut silenced = [false; WINDOW_BUCKETS];
        for bucket in index::sample(&mut self.rng, WINDOW_BUCKETS, count).iter() {
            silenced[bucket] = true;
        }
        self.stats.windows += 1;
        debug!("New clipping window at sample {}: {} bucket(s) silenced", self.position, count);
        ClipWindow {
            start: self.position,
            sample_rate,
            silenced,
        }
    }
}

#[async_trait]
impl TransformStage for AudioImpairmentStage {
    fn name(&self) -> &str {
        "audio-impairment"
    }

    async fn transform(&mut self, mut frame: Frame) -> StageResult {
        let profile = match self.profile {
            Some(profile) if self.running => profile,
            _ => return Ok(Some(frame)),
        };
        let Some(audio) = frame.as_audio_mut() else {
            return Ok(Some(frame));
        };

        let sample_rate = audio.sample_rate.max(1);
        let mut window = match self.window.take() {
            Some(window) if window.sample_rate == sample_rate => window,
            _ => self.roll_window(&profile, sample_rate),
        };

        for sample_frame in 0..audio.number_of_frames() {
            let mut bucket = ((self.position - window.start) / sample_rate as u64) as usize;
            if bucket >= WINDOW_BUCKETS {
                window = self.roll_window(&profile, sample_rate);
                bucket = 0;
            }
            if window.silenced[bucket] {
                audio.silence_frame(sample_frame);
                self.stats.clipped_samples += 1;
            } else if self.rng.gen_bool(profile.drop_probability) {
                audio.silence_frame(sample_frame);
                self.stats.dropped_samples += 1;
            }
            self.position += 1;
        }
        self.window = Some(window);
        self.stats.frames += 1;

        if self.latency.audio {
            frame.hold_for(profile.latency_ms);
        }
        Ok(Some(frame))
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioFrame, FrameLedger, MediaFrame};
    use crate::profile::ImpairmentLevel;

    fn tone(ledger: &FrameLedger, samples: usize) -> Frame {
        let audio = AudioFrame::new(vec![0.5; samples * 2], 8_000, 2, 0).unwrap();
        Frame::tracked(MediaFrame::Audio(audio), ledger)
    }

    #[tokio::test]
    async fn test_bucket_count_matches_clipping_pct() {
        let mut stage = AudioImpairmentStage::new(LatencyPolicy { video: false, audio: false }).with_seed(3);
        stage.apply(ImpairmentSettings::at(ImpairmentLevel::Moderate)).unwrap();
        stage.start();

        let ledger = FrameLedger::new();
        stage.transform(tone(&ledger, 80)).await.unwrap().unwrap().close();
        assert_eq!(stage.silenced_buckets().len(), 6);
        assert!(ledger.snapshot().is_balanced());
    }

    #[tokio::test]
    async fn test_apply_resets_window() {
        let mut stage = AudioImpairmentStage::new(LatencyPolicy { video: false, audio: false }).with_seed(3);
        stage.apply(ImpairmentSettings::at(ImpairmentLevel::Severe)).unwrap();
        stage.start();
        let ledger = FrameLedger::new();
        stage.transform(tone(&ledger, 80)).await.unwrap().unwrap().close();
        assert_eq!(stage.silenced_buckets().len(), 15);

        stage.apply(ImpairmentSettings::disabled()).unwrap();
        assert!(stage.silenced_buckets().is_empty());
        assert!(!stage.is_active());
    }

    #[tokio::test]
    async fn test_channels_zeroed_together() {
        let mut stage = AudioImpairmentStage::new(LatencyPolicy { video: false, audio: false }).with_seed(11);
        stage.apply(ImpairmentSettings::at(ImpairmentLevel::Severe)).unwrap();
        stage.start();
        let ledger = FrameLedger::new();
        let out = stage.transform(tone(&ledger, 400)).await.unwrap().unwrap();
        let audio = out.as_audio().unwrap();
        for pair in audio.samples.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
        out.close();
    }
}
