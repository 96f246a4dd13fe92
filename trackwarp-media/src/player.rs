//! Substitute clip player
//!
//! Plays a decoded clip at a fixed frame rate into a frame channel, for use
//! as the source of a [`SubstituteStage`](crate::stages::SubstituteStage).

use crate::frame::{MediaFrame, MediaKind, VideoFrame};
use crate::source::{frame_channel, FrameReader};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Playback parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerConfig {
    /// Frames per second
    pub frame_rate: u32,
    /// Times to play the clip, `None` to loop forever
    pub loop_count: Option<u32>,
    /// Frames buffered ahead of the consumer
    pub capacity: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            loop_count: None,
            capacity: 4,
        }
    }
}

/// Playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Emitting frames
    Playing,
    /// Holding the current position
    Paused,
    /// Finished or stopped
    Stopped,
}

/// Controls a running player
#[derive(Debug)]
pub struct PlayerHandle {
    control: watch::Sender<PlayerState>,
    task: JoinHandle<()>,
}

impl PlayerHandle {
    /// Hold the current position
    pub fn pause(&self) {
        self.set(PlayerState::Paused);
    }

    /// Continue from the held position
    pub fn resume(&self) {
        self.set(PlayerState::Playing);
    }

    /// End playback; the reader sees end of stream
    pub fn stop(&self) {
        self.set(PlayerState::Stopped);
        self.task.abort();
    }

    /// Current state
    pub fn state(&self) -> PlayerState {
        if self.task.is_finished() {
            PlayerState::Stopped
        } else {
            *self.control.borrow()
        }
    }

    fn set(&self, state: PlayerState) {
        self.control.send_if_modified(|current| {
            if *current == PlayerState::Stopped || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Start playing `clip` on the current runtime
pub fn spawn_player(clip: Vec<VideoFrame>, config: PlayerConfig) -> (FrameReader, PlayerHandle) {
    let (writer, reader) = frame_channel(MediaKind::Video, config.capacity);
    let (control, mut state) = watch::channel(PlayerState::Playing);
    let period = Duration::from_secs(1) / config.frame_rate.max(1);

    let task = tokio::spawn(async move {
        if clip.is_empty() {
            debug!("Empty clip, nothing to play");
            return;
        }
        info!("Playing {} frame clip at {} fps", clip.len(), config.frame_rate);

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut emitted: i64 = 0;
        let mut loops = 0u32;

        'playback: loop {
            for frame in &clip {
                loop {
                    let current = *state.borrow_and_update();
                    match current {
                        PlayerState::Playing => break,
                        PlayerState::Stopped => break 'playback,
                        PlayerState::Paused => {
                            if state.changed().await.is_err() {
                                break 'playback;
                            }
                        }
                    }
                }

                ticker.tick().await;
                let mut frame = frame.clone();
                frame.timestamp_us = emitted * period.as_micros() as i64;
                if writer.push(MediaFrame::Video(frame)).await.is_err() {
                    debug!("Player output closed");
                    break 'playback;
                }
                emitted += 1;
            }

            loops += 1;
            if config.loop_count.is_some_and(|count| loops >= count) {
                break;
            }
        }
        debug!("Player finished after {} frame(s)", emitted);
    });

    (reader, PlayerHandle { control, task })
}
