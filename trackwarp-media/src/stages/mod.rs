//! Transform stages
//!
//! A stage takes ownership of one frame and either returns a frame (the same
//! one or a replacement) or consumes it. Any frame a stage replaces or drops
//! must be closed by the stage. On failure the frame is handed back inside
//! [`StageFailure`] so the pipeline can release it.
//!
//! A stage may expose a [`Backlog`]: the pipeline reserves a slot in it before
//! a frame waits for the stage, and sheds the frame when the backlog is full.

use crate::error::{MediaError, MediaResult};
use crate::frame::{release_dropped, Frame};
use crate::profile::ImpairmentSettings;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub mod audio_impairment;
pub mod substitute;
pub mod video_impairment;

pub use audio_impairment::{AudioImpairmentStage, AudioImpairmentStats};
pub use substitute::SubstituteStage;
pub use video_impairment::{VideoImpairmentStage, VideoImpairmentStats, MAX_PENDING_ENCODES};

/// Key of the impairment stage
pub const IMPAIRMENT_STAGE: &str = "impairment";
/// Key of the substitute-source stage
pub const SUBSTITUTE_STAGE: &str = "substitute";
/// Key of the frame capture tap
pub const CAPTURE_STAGE: &str = "capture";

/// Outcome of one stage invocation
pub type StageResult = Result<Option<Frame>, StageFailure>;

/// A stage error, with the frame if the stage still owned it
#[derive(Debug)]
pub struct StageFailure {
    /// What went wrong
    pub error: MediaError,
    /// Frame to release
    pub frame: Option<Frame>,
}

impl StageFailure {
    /// Failure handing the frame back
    pub fn with_frame(error: MediaError, frame: Frame) -> Self {
        Self {
            error,
            frame: Some(frame),
        }
    }

    /// Failure after the stage already settled the frame
    pub fn consumed(error: MediaError) -> Self {
        Self { error, frame: None }
    }
}

/// Control message delivered to a stage between frames
#[derive(Debug, Clone, PartialEq)]
pub enum StageCommand {
    /// Begin transforming
    Start,
    /// Pass frames through, keeping internal state
    Stop,
    /// Swap in new impairment settings
    Configure(ImpairmentSettings),
    /// Temporarily pass frames through
    Pause,
    /// Undo a pause
    Resume,
}

impl StageCommand {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            StageCommand::Start => "start",
            StageCommand::Stop => "stop",
            StageCommand::Configure(_) => "configure",
            StageCommand::Pause => "pause",
            StageCommand::Resume => "resume",
        }
    }
}

/// One step of a transform pipeline
#[async_trait]
pub trait TransformStage: Send + fmt::Debug {
    /// Name for logs
    fn name(&self) -> &str;

    /// Process one frame
    async fn transform(&mut self, frame: Frame) -> StageResult;

    /// React to a control command
    async fn handle(&mut self, command: StageCommand) -> MediaResult<()> {
        Err(MediaError::UnsupportedCommand {
            stage: self.name().to_string(),
            command: command.name().to_string(),
        })
    }

    /// Drop queued work
    async fn flush(&mut self) -> MediaResult<()> {
        Ok(())
    }

    /// Bound on frames waiting for or inside this stage
    ///
    /// Read once when the stage is registered.
    fn backlog(&self) -> Option<Arc<Backlog>> {
        None
    }
}

/// Count of frames queued on a stage, shared with the pipeline
///
/// Slots are reserved without taking the stage lock. While the backlog is
/// engaged, a frame arriving with more than `limit` frames already pending is
/// refused.
#[derive(Debug)]
pub struct Backlog {
    limit: usize,
    pending: AtomicUsize,
    shed: AtomicU64,
    engaged: AtomicBool,
}

impl Backlog {
    /// Disengaged backlog refusing frames beyond `limit` pending
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            pending: AtomicUsize::new(0),
            shed: AtomicU64::new(0),
            engaged: AtomicBool::new(false),
        }
    }

    /// Start or stop refusing frames
    pub fn set_engaged(&self, engaged: bool) {
        self.engaged.store(engaged, Ordering::Release);
    }

    /// Whether frames can be refused
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// Frames holding a slot
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Frames refused so far
    pub fn shed(&self) -> u64 {
        self.shed.load(Ordering::Acquire)
    }

    /// Reserve a slot for one frame
    ///
    /// The slot is given back when the returned guard drops.
    pub fn enter(self: &Arc<Self>) -> MediaResult<BacklogSlot> {
        let engaged = self.is_engaged();
        let limit = self.limit;
        let reserved = self.pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
            if engaged && pending > limit {
                None
            } else {
                Some(pending + 1)
            }
        });

        match reserved {
            Ok(_) => Ok(BacklogSlot {
                backlog: self.clone(),
            }),
            Err(pending) => {
                self.shed.fetch_add(1, Ordering::AcqRel);
                Err(MediaError::Backpressure { pending })
            }
        }
    }
}

/// One reserved [`Backlog`] slot
#[derive(Debug)]
pub struct BacklogSlot {
    backlog: Arc<Backlog>,
}

impl Drop for BacklogSlot {
    fn drop(&mut self) {
        self.backlog.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Stage built from a closure
///
/// A frame the closure drops without settling is released.
pub struct FnStage<F> {
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: FnMut(Frame) -> Option<Frame> + Send,
{
    /// Wrap `func`
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> TransformStage for FnStage<F>
where
    F: FnMut(Frame) -> Option<Frame> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn transform(&mut self, frame: Frame) -> StageResult {
        let func = &mut self.func;
        Ok(release_dropped(move || func(frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameLedger, MediaFrame, PixelFormat, VideoFrame};

    fn frame(ledger: &FrameLedger, ts: i64) -> Frame {
        let video = VideoFrame::filled(2, 2, PixelFormat::Gray8, 0, ts);
        Frame::tracked(MediaFrame::Video(video), ledger)
    }

    #[tokio::test]
    async fn test_closure_dropping_frame_releases_it() {
        let ledger = FrameLedger::new();
        let mut stage = FnStage::new("filter", |frame: Frame| {
            if frame.timestamp_us() % 2 == 0 {
                None
            } else {
                Some(frame)
            }
        });

        for ts in 0..4 {
            if let Some(out) = stage.transform(frame(&ledger, ts)).await.unwrap() {
                out.close();
            }
        }

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.allocated, 4);
        assert_eq!(snapshot.released, 4);
        assert!(snapshot.is_balanced());
    }

    #[test]
    fn test_backlog_refuses_only_when_engaged() {
        let backlog = Arc::new(Backlog::new(1));
        let held: Vec<BacklogSlot> = (0..3).map(|_| backlog.enter().unwrap()).collect();
        assert_eq!(backlog.pending(), 3);

        backlog.set_engaged(true);
        assert!(matches!(
            backlog.enter(),
            Err(MediaError::Backpressure { pending: 3 })
        ));
        assert_eq!(backlog.shed(), 1);

        drop(held);
        assert_eq!(backlog.pending(), 0);
        let first = backlog.enter().unwrap();
        let second = backlog.enter().unwrap();
        assert!(backlog.enter().is_err());
        drop((first, second));
        assert_eq!(backlog.shed(), 2);
    }
}
