//! Transform manager: an ordered, live-editable chain of transform stages
//!
//! The stage list is copy-on-write. Every frame traverses the snapshot that
//! was current when it arrived, so adding or removing stages never disturbs a
//! frame in flight. Each stage sits behind its own async mutex; control
//! commands wait for that mutex and therefore land between frames.
//!
//! [`TransformManager::run`] keeps several frames between source and sink at
//! once. Stage mutexes are fair, so frames reach each stage in arrival order
//! and leave the pipeline in that order. A stage's [`Backlog`] is checked
//! before a frame queues on the stage's mutex.

use crate::error::{MediaError, MediaResult};
use crate::frame::{release_dropped, Frame};
use crate::source::{FrameReader, FrameWriter};
use crate::stages::{Backlog, FnStage, StageCommand, TransformStage};
use futures::stream::{FuturesOrdered, StreamExt};
use futures::FutureExt;
use parking_lot::RwLock;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type SharedStage = Arc<Mutex<Box<dyn TransformStage>>>;

/// Frames allowed between source and sink at once
pub const MAX_FRAMES_IN_FLIGHT: usize = 16;

#[derive(Clone)]
struct StageEntry {
    key: String,
    stage: SharedStage,
    backlog: Option<Arc<Backlog>>,
}

/// Where a stage is inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagePosition {
    /// Before every other stage
    First,
    /// After every other stage
    #[default]
    End,
    /// At an index, clamped to the list length
    At(usize),
}

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Registered stages
    pub stages: usize,
    /// Frames read from the source
    pub frames_in: u64,
    /// Frames written to the sink
    pub frames_out: u64,
    /// Frames a stage consumed without output
    pub frames_consumed: u64,
    /// Frames released because a stage's backlog was full
    pub frames_shed: u64,
    /// Stage failures recovered from
    pub stage_failures: u64,
    /// Stage panics recovered from
    pub stage_panics: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    frames_consumed: AtomicU64,
    frames_shed: AtomicU64,
    stage_failures: AtomicU64,
    stage_panics: AtomicU64,
}

struct Inner {
    stages: RwLock<Arc<Vec<StageEntry>>>,
    counters: Counters,
}

/// Ordered set of keyed transform stages
#[derive(Clone)]
pub struct TransformManager {
    inner: Arc<Inner>,
}

impl TransformManager {
    /// Empty pipeline
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                stages: RwLock::new(Arc::new(Vec::new())),
                counters: Counters::default(),
            }),
        }
    }

    /// Register `stage` under `key`
    ///
    /// A stage already registered under `key` is replaced: in place when
    /// `position` is `None`, otherwise the new stage moves to `position`.
    /// Returns whether a stage was replaced.
    pub fn add(
        &self,
        key: impl Into<String>,
        stage: Box<dyn TransformStage>,
        position: Option<StagePosition>,
    ) -> bool {
        let key = key.into();
        let entry = StageEntry {
            key: key.clone(),
            backlog: stage.backlog(),
            stage: Arc::new(Mutex::new(stage)),
        };

        let mut stages = self.inner.stages.write();
        let mut list: Vec<StageEntry> = stages.as_ref().clone();
        let existing = list.iter().position(|e| e.key == key);

        match (existing, position) {
            (Some(index), None) => list[index] = entry,
            (Some(index), Some(position)) => {
                list.remove(index);
                insert_at(&mut list, position, entry);
            }
            (None, position) => insert_at(&mut list, position.unwrap_or_default(), entry),
        }
        *stages = Arc::new(list);

        if existing.is_some() {
            info!("Replaced transform stage '{}'", key);
        } else {
            debug!("Added transform stage '{}'", key);
        }
        existing.is_some()
    }

    /// Register a closure as a stage
    pub fn add_fn<F>(&self, key: impl Into<String>, func: F, position: Option<StagePosition>) -> bool
    where
        F: FnMut(Frame) -> Option<Frame> + Send + 'static,
    {
        let key = key.into();
        let stage = FnStage::new(key.clone(), func);
        self.add(key, Box::new(stage), position)
    }

    /// Unregister the stage under `key`
    pub fn remove(&self, key: &str) -> bool {
        let mut stages = self.inner.stages.write();
        if !stages.iter().any(|e| e.key == key) {
            debug!("No transform stage '{}' to remove", key);
            return false;
        }
        let list: Vec<StageEntry> = stages.iter().filter(|e| e.key != key).cloned().collect();
        *stages = Arc::new(list);
        debug!("Removed transform stage '{}'", key);
        true
    }

    /// Whether a stage is registered under `key`
    pub fn has(&self, key: &str) -> bool {
        self.inner.stages.read().iter().any(|e| e.key == key)
    }

    /// Stage keys in traversal order
    pub fn keys(&self) -> Vec<String> {
        self.inner.stages.read().iter().map(|e| e.key.clone()).collect()
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.inner.stages.read().len()
    }

    /// Whether no stage is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a control command to one stage
    ///
    /// Waits until the stage is between frames.
    pub async fn command(&self, key: &str, command: StageCommand) -> MediaResult<()> {
        let stage = self
            .find(key)
            .ok_or_else(|| MediaError::StageNotFound {
                key: key.to_string(),
            })?;
        let mut stage = stage.lock().await;
        debug!("Stage '{}' <- {}", key, command.name());
        stage.handle(command).await
    }

    /// Flush every stage, returning the first error
    pub async fn flush(&self) -> MediaResult<()> {
        let snapshot = self.snapshot();
        let mut first_error = None;
        for entry in snapshot.iter() {
            let mut stage = entry.stage.lock().await;
            if let Err(e) = stage.flush().await {
                warn!("Flushing stage '{}' failed: {}", entry.key, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Counters
    pub fn stats(&self) -> PipelineStats {
        let counters = &self.inner.counters;
        PipelineStats {
            stages: self.len(),
            frames_in: counters.frames_in.load(Ordering::Relaxed),
            frames_out: counters.frames_out.load(Ordering::Relaxed),
            frames_consumed: counters.frames_consumed.load(Ordering::Relaxed),
            frames_shed: counters.frames_shed.load(Ordering::Relaxed),
            stage_failures: counters.stage_failures.load(Ordering::Relaxed),
            stage_panics: counters.stage_panics.load(Ordering::Relaxed),
        }
    }

    /// Run one frame through the current stages
    ///
    /// Returns `None` when a stage consumed, shed or failed the frame.
    /// Failures and panics are logged and counted. A frame handed back by a
    /// failing stage or lost in a panicking one is released. A frame some
    /// stage asked to hold is returned once its hold expires.
    pub async fn process_frame(&self, frame: Frame) -> Option<Frame> {
        let snapshot = self.snapshot();
        let counters = &self.inner.counters;
        let mut current = frame;

        for entry in snapshot.iter() {
            let _slot = match &entry.backlog {
                Some(backlog) => match backlog.enter() {
                    Ok(slot) => Some(slot),
                    Err(e) => {
                        counters.frames_shed.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "Stage '{}' shed frame at {} us: {}",
                            entry.key,
                            current.timestamp_us(),
                            e
                        );
                        current.close();
                        return None;
                    }
                },
                None => None,
            };

            let mut stage = entry.stage.lock().await;
            let mut attempt = AssertUnwindSafe(stage.transform(current)).catch_unwind();
            let outcome = (&mut attempt).await;
            match outcome {
                Ok(Ok(Some(next))) => current = next,
                Ok(Ok(None)) => {
                    counters.frames_consumed.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Ok(Err(failure)) => {
                    counters.stage_failures.fetch_add(1, Ordering::Relaxed);
                    let category = failure.error.category();
                    if failure.error.is_recoverable() {
                        warn!("Stage '{}' failed ({:?}), frame dropped: {}", entry.key, category, failure.error);
                    } else {
                        error!("Stage '{}' failed ({:?}), frame dropped: {}", entry.key, category, failure.error);
                    }
                    if let Some(frame) = failure.frame {
                        frame.close();
                    }
                    return None;
                }
                Err(_) => {
                    // The panicked transform may still own the frame
                    release_dropped(move || drop(attempt));
                    counters.stage_panics.fetch_add(1, Ordering::Relaxed);
                    error!("Stage '{}' panicked, frame released", entry.key);
                    return None;
                }
            }
        }

        if let Some(due) = current.due() {
            tokio::time::sleep_until(due).await;
        }
        Some(current)
    }

    /// Pump frames from `source` through the stages into `sink`
    ///
    /// Up to [`MAX_FRAMES_IN_FLIGHT`] frames are processed at once and
    /// written to `sink` in the order they were read. `observer` is called
    /// with the zero-based index of every frame read, in order, after the
    /// frame was handled. Returns when the source ends or the sink is closed.
    pub async fn run<F>(&self, mut source: FrameReader, sink: FrameWriter, mut observer: F) -> MediaResult<()>
    where
        F: FnMut(u64) + Send,
    {
        let counters = &self.inner.counters;
        let mut in_flight = FuturesOrdered::new();
        let mut next_index = 0u64;
        let mut source_open = true;

        loop {
            tokio::select! {
                biased;

                Some((index, processed)) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Some(frame) = processed {
                        match sink.reserve().await {
                            Ok(permit) => {
                                permit.send(Frame::forward(frame));
                                counters.frames_out.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                frame.close();
                                info!("Frame sink closed after {} frame(s), stopping", index + 1);
                                source.close();
                                while let Some((_, processed)) = in_flight.next().await {
                                    if let Some(frame) = processed {
                                        frame.close();
                                    }
                                }
                                return Ok(());
                            }
                        }
                    }
                    observer(index);
                }
                read = source.read(), if source_open && in_flight.len() < MAX_FRAMES_IN_FLIGHT => {
                    match read {
                        Some(frame) => {
                            counters.frames_in.fetch_add(1, Ordering::Relaxed);
                            let index = next_index;
                            next_index += 1;
                            in_flight.push_back(
                                self.process_frame(frame).map(move |processed| (index, processed)),
                            );
                        }
                        None => source_open = false,
                    }
                }
                else => break,
            }
        }

        info!("Frame source ended after {} frame(s)", next_index);
        Ok(())
    }

    /// [`TransformManager::run`] without an observer
    pub async fn pipe(&self, source: FrameReader, sink: FrameWriter) -> MediaResult<()> {
        self.run(source, sink, |_| {}).await
    }

    fn snapshot(&self) -> Arc<Vec<StageEntry>> {
        self.inner.stages.read().clone()
    }

    fn find(&self, key: &str) -> Option<SharedStage> {
        self.inner
            .stages
            .read()
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.stage.clone())
    }
}

impl Default for TransformManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransformManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformManager")
            .field("stages", &self.keys())
            .finish()
    }
}

fn insert_at(list: &mut Vec<StageEntry>, position: StagePosition, entry: StageEntry) {
    match position {
        StagePosition::First => list.insert(0, entry),
        StagePosition::End => list.push(entry),
        StagePosition::At(index) => list.insert(index.min(list.len()), entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameLedger, MediaFrame, PixelFormat, VideoFrame};

    fn passthrough() -> impl FnMut(Frame) -> Option<Frame> + Send + 'static {
        Some
    }

    #[test]
    fn test_positions_and_last_write_wins() {
        let manager = TransformManager::new();
        assert!(!manager.add_fn("a", passthrough(), None));
        assert!(!manager.add_fn("b", passthrough(), None));
        assert!(!manager.add_fn("first", passthrough(), Some(StagePosition::First)));
        assert!(!manager.add_fn("mid", passthrough(), Some(StagePosition::At(2))));
        assert_eq!(manager.keys(), vec!["first", "a", "mid", "b"]);

        assert!(manager.add_fn("a", passthrough(), None));
        assert_eq!(manager.keys(), vec!["first", "a", "mid", "b"]);

        assert!(manager.add_fn("a", passthrough(), Some(StagePosition::End)));
        assert_eq!(manager.keys(), vec!["first", "mid", "b", "a"]);
    }

    #[test]
    fn test_remove_missing_key_is_not_an_error() {
        let manager = TransformManager::new();
        manager.add_fn("a", passthrough(), None);
        assert!(!manager.remove("missing"));
        assert!(manager.remove("a"));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_command_to_missing_stage() {
        let manager = TransformManager::new();
        let result = manager.command("impairment", StageCommand::Start).await;
        assert!(matches!(result, Err(MediaError::StageNotFound { .. })));
    }

    #[derive(Debug)]
    struct PanicOnOdd;

    #[async_trait::async_trait]
    impl TransformStage for PanicOnOdd {
        fn name(&self) -> &str {
            "panic-on-odd"
        }

        async fn transform(&mut self, frame: Frame) -> crate::stages::StageResult {
            tokio::task::yield_now().await;
            if frame.timestamp_us() % 2 == 1 {
                panic!("odd frame");
            }
            Ok(Some(frame))
        }
    }

    #[tokio::test]
    async fn test_panicking_stage_releases_its_frame() {
        let ledger = FrameLedger::new();
        let manager = TransformManager::new();
        manager.add("panic", Box::new(PanicOnOdd), None);

        for ts in 0..4 {
            let video = VideoFrame::filled(1, 1, PixelFormat::Gray8, 0, ts);
            if let Some(out) = manager.process_frame(Frame::tracked(MediaFrame::Video(video), &ledger)).await {
                out.close();
            }
        }

        let snapshot = ledger.snapshot();
        assert_eq!(manager.stats().stage_panics, 2);
        assert_eq!(snapshot.released, 4);
        assert!(snapshot.is_balanced());
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_frame_waits_outside_stage() {
        let manager = TransformManager::new();
        manager.add_fn(
            "hold",
            |mut frame: Frame| {
                frame.hold_for(250);
                Some(frame)
            },
            None,
        );

        let started = tokio::time::Instant::now();
        let frame = Frame::new(MediaFrame::Video(VideoFrame::filled(1, 1, PixelFormat::Gray8, 0, 0)));
        let held = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.process_frame(frame).await })
        };
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        // Commands reach the stage while the frame is held
        let command = manager.command("hold", StageCommand::Start).await;
        assert!(matches!(command, Err(MediaError::UnsupportedCommand { .. })));
        assert_eq!(started.elapsed(), std::time::Duration::ZERO);

        let out = held.await.unwrap().unwrap();
        assert_eq!(started.elapsed(), std::time::Duration::from_millis(250));
        out.close();
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let manager = TransformManager::new();
        manager.add_fn(
            "double",
            |mut frame: Frame| {
                if let Some(video) = frame.as_video_mut() {
                    video.data.iter_mut().for_each(|v| *v *= 2);
                }
                Some(frame)
            },
            None,
        );
        manager.add_fn(
            "increment",
            |mut frame: Frame| {
                if let Some(video) = frame.as_video_mut() {
                    video.data.iter_mut().for_each(|v| *v += 1);
                }
                Some(frame)
            },
            None,
        );

        let frame = Frame::new(MediaFrame::Video(VideoFrame::filled(1, 1, PixelFormat::Gray8, 3, 0)));
        let out = manager.process_frame(frame).await.unwrap();
        assert_eq!(out.as_video().unwrap().data, vec![7]);
    }
}
