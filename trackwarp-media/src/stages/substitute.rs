//! Substitute-source stage: replaces live video with frames from another source

use super::{StageCommand, StageFailure, StageResult, TransformStage};
use crate::error::{MediaError, MediaResult};
use crate::frame::{Frame, MediaFrame, MediaKind, VideoFrame};
use crate::source::{FrameReader, ReadOutcome};
use async_trait::async_trait;
use tracing::{debug, info};

/// Swaps live video frames for substitute frames
#[derive(Debug)]
pub struct SubstituteStage {
    source: FrameReader,
    last: Option<VideoFrame>,
    paused: bool,
    exhausted: bool,
    substituted: u64,
}

impl SubstituteStage {
    /// Stage pulling replacements from `source`
    pub fn new(source: FrameReader) -> Self {
        Self {
            source,
            last: None,
            paused: false,
            exhausted: false,
            substituted: 0,
        }
    }

    /// Whether live frames currently pass untouched
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the substitute source has ended
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Live frames replaced so far
    pub fn substituted(&self) -> u64 {
        self.substituted
    }

    fn next_substitute(&mut self) -> MediaResult<Option<VideoFrame>> {
        match self.source.try_read() {
            ReadOutcome::Frame(frame) => match frame.into_media() {
                MediaFrame::Video(video) => {
                    self.last = Some(video.clone());
                    Ok(Some(video))
                }
                MediaFrame::Audio(_) => Err(MediaError::InvalidMediaType {
                    expected: MediaKind::Video.to_string(),
                    actual: MediaKind::Audio.to_string(),
                }),
            },
            ReadOutcome::Empty => Ok(self.last.clone()),
            ReadOutcome::Ended => {
                info!("Substitute source exhausted, passing live video");
                self.exhausted = true;
                self.last = None;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TransformStage for SubstituteStage {
    fn name(&self) -> &str {
        "substitute"
    }

    async fn transform(&mut self, frame: Frame) -> StageResult {
        if self.paused || self.exhausted {
            return Ok(Some(frame));
        }
        let (timestamp_us, display_width, display_height) = match frame.as_video() {
            Some(live) => (live.timestamp_us, live.display_width, live.display_height),
            None => return Ok(Some(frame)),
        };

        let substitute = match self.next_substitute() {
            Ok(Some(substitute)) => substitute,
            Ok(None) => return Ok(Some(frame)),
            Err(e) => return Err(StageFailure::with_frame(e, frame)),
        };

        let mut replacement = if substitute.width != display_width || substitute.height != display_height {
            match substitute.resized(display_width, display_height) {
                Ok(resized) => resized,
                Err(e) => return Err(StageFailure::with_frame(e, frame)),
            }
        } else {
            substitute
        };
        replacement.display_width = display_width;
        replacement.display_height = display_height;
        replacement.timestamp_us = timestamp_us;

        let out = frame.derive(MediaFrame::Video(replacement));
        frame.close();
        self.substituted += 1;
        Ok(Some(out))
    }

    async fn handle(&mut self, command: StageCommand) -> MediaResult<()> {
        match command {
            StageCommand::Pause | StageCommand::Stop => {
                debug!("Substitute paused");
                self.paused = true;
                Ok(())
            }
            StageCommand::Resume | StageCommand::Start => {
                debug!("Substitute resumed");
                self.paused = false;
                Ok(())
            }
            other => Err(MediaError::UnsupportedCommand {
                stage: self.name().to_string(),
                command: other.name().to_string(),
            }),
        }
    }
}
