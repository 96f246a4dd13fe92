//! Periodic frame capture
//!
//! [`capture_session`] returns a tap stage that copies at most one video frame
//! per interval out of the pipeline, and a lazy session that yields those
//! copies. The tap never blocks the pipeline: if the session is not keeping
//! up, captures are skipped.

use crate::frame::{Frame, VideoFrame};
use crate::stages::{StageResult, TransformStage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Capture parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Minimum spacing between captures
    pub interval: Duration,
    /// Stop after this many captures
    pub max_frames: Option<usize>,
    /// Captures buffered between tap and session
    pub capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_frames: None,
            capacity: 4,
        }
    }
}

/// One captured picture
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Copy of the frame content
    pub frame: VideoFrame,
    /// Capture number, starting at 0
    pub sequence: u64,
    /// Wall-clock capture time
    pub captured_at: DateTime<Utc>,
}

/// Cancels a [`CaptureSession`] from anywhere
#[derive(Debug, Clone, Default)]
pub struct CaptureCancel {
    cancelled: Arc<AtomicBool>,
}

impl CaptureCancel {
    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Pipeline stage copying frames out to a [`CaptureSession`]
#[derive(Debug)]
pub struct CaptureTap {
    sender: mpsc::Sender<CapturedFrame>,
    interval: Duration,
    last_capture: Option<Instant>,
    sequence: u64,
    cancel: CaptureCancel,
}

/// Lazy, finite sequence of captured frames
#[derive(Debug)]
pub struct CaptureSession {
    receiver: mpsc::Receiver<CapturedFrame>,
    remaining: Option<usize>,
    cancel: CaptureCancel,
}

/// Create a connected tap and session
pub fn capture_session(settings: CaptureSettings) -> (CaptureTap, CaptureSession) {
    let (sender, receiver) = mpsc::channel(settings.capacity.max(1));
    let cancel = CaptureCancel::default();
    (
        CaptureTap {
            sender,
            interval: settings.interval,
            last_capture: None,
            sequence: 0,
            cancel: cancel.clone(),
        },
        CaptureSession {
            receiver,
            remaining: settings.max_frames,
            cancel,
        },
    )
}

impl CaptureTap {
    /// Captures handed to the session so far
    pub fn captured(&self) -> u64 {
        self.sequence
    }

    fn due(&self, at: Instant) -> bool {
        match self.last_capture {
            Some(last) => at.duration_since(last) >= self.interval,
            None => true,
        }
    }
}

#[async_trait]
impl TransformStage for CaptureTap {
    fn name(&self) -> &str {
        "capture"
    }

    async fn transform(&mut self, frame: Frame) -> StageResult {
        if self.cancel.is_cancelled() || self.sender.is_closed() {
            return Ok(Some(frame));
        }
        let Some(video) = frame.as_video() else {
            return Ok(Some(frame));
        };
        let at = frame.captured_at();
        if !self.due(at) {
            return Ok(Some(frame));
        }

        let captured = CapturedFrame {
            frame: video.clone(),
            sequence: self.sequence,
            captured_at: Utc::now(),
        };
        match self.sender.try_send(captured) {
            Ok(()) => {
                self.last_capture = Some(at);
                self.sequence += 1;
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Capture session busy, skipping frame at {} us", video.timestamp_us);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
        Ok(Some(frame))
    }
}

impl CaptureSession {
    /// Next capture, `None` once finished or cancelled
    pub async fn next(&mut self) -> Option<CapturedFrame> {
        if self.is_finished() {
            self.receiver.close();
            return None;
        }
        let captured = self.receiver.recv().await?;
        if self.cancel.is_cancelled() {
            self.receiver.close();
            return None;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(captured)
    }

    /// Stop the session; the tap stops copying frames
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.receiver.close();
    }

    /// Handle cancelling this session from elsewhere
    pub fn cancel_handle(&self) -> CaptureCancel {
        self.cancel.clone()
    }

    /// Whether no more captures will be yielded
    pub fn is_finished(&self) -> bool {
        self.cancel.is_cancelled() || self.remaining == Some(0)
    }

    /// The session as a stream
    pub fn into_stream(self) -> impl Stream<Item = CapturedFrame> {
        stream::unfold(self, |mut session| async move {
            session.next().await.map(|captured| (captured, session))
        })
    }
}
