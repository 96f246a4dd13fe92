//! Frame channels and the frame source adapter
//!
//! A track's frames travel through bounded single-consumer channels. The
//! [`FrameSourceAdapter`] splits a live track into the readable source the
//! worker consumes and the writable sink whose output backs the proxy track.

use crate::error::{MediaError, MediaResult};
use crate::frame::{Frame, FrameLedger, MediaFrame, MediaKind};
use crate::tracks::TrackLike;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Result of a non-blocking read
#[derive(Debug)]
pub enum ReadOutcome {
    /// A frame was ready
    Frame(Frame),
    /// No frame ready yet
    Empty,
    /// The writing side is gone and the channel is drained
    Ended,
}

/// Receiving end of a frame channel
#[derive(Debug)]
pub struct FrameReader {
    kind: MediaKind,
    receiver: mpsc::Receiver<Frame>,
}

impl FrameReader {
    /// Media kind carried by the channel
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Next frame, `None` at end of stream
    pub async fn read(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Next frame if one is ready
    pub fn try_read(&mut self) -> ReadOutcome {
        match self.receiver.try_recv() {
            Ok(frame) => ReadOutcome::Frame(frame),
            Err(mpsc::error::TryRecvError::Empty) => ReadOutcome::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => ReadOutcome::Ended,
        }
    }

    /// Stop accepting frames and release everything still queued
    pub fn close(&mut self) {
        self.receiver.close();
        let mut released = 0usize;
        while let Ok(frame) = self.receiver.try_recv() {
            frame.close();
            released += 1;
        }
        if released > 0 {
            debug!("Released {} queued {} frame(s) on close", released, self.kind);
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sending end of a frame channel
#[derive(Debug, Clone)]
pub struct FrameWriter {
    kind: MediaKind,
    sender: mpsc::Sender<Frame>,
    ledger: Option<FrameLedger>,
}

/// Reserved slot in a frame channel
#[derive(Debug)]
pub struct WritePermit<'a> {
    permit: mpsc::Permit<'a, Frame>,
}

impl WritePermit<'_> {
    /// Write into the reserved slot
    pub fn send(self, frame: Frame) {
        self.permit.send(frame);
    }
}

impl FrameWriter {
    /// Account every frame pushed through this writer in `ledger`
    pub fn with_ledger(mut self, ledger: FrameLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Ledger used by [`FrameWriter::push`], if any
    pub fn ledger(&self) -> Option<&FrameLedger> {
        self.ledger.as_ref()
    }

    /// Media kind carried by the channel
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Whether the reader is gone
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Write a frame, waiting for capacity
    ///
    /// If the reader is gone the frame is released and an error returned.
    pub async fn write(&self, frame: Frame) -> MediaResult<()> {
        match self.sender.send(frame).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(frame)) => {
                frame.close();
                Err(MediaError::channel_closed(format!("{} frame sink", self.kind)))
            }
        }
    }

    /// Wrap `media` in a new frame and write it
    pub async fn push(&self, media: MediaFrame) -> MediaResult<()> {
        if media.kind() != self.kind {
            return Err(MediaError::InvalidMediaType {
                expected: self.kind.to_string(),
                actual: media.kind().to_string(),
            });
        }
        let frame = match &self.ledger {
            Some(ledger) => Frame::tracked(media, ledger),
            None => Frame::new(media),
        };
        self.write(frame).await
    }

    /// Wait for capacity without committing a frame yet
    pub async fn reserve(&self) -> MediaResult<WritePermit<'_>> {
        self.sender
            .reserve()
            .await
            .map(|permit| WritePermit { permit })
            .map_err(|_| MediaError::channel_closed(format!("{} frame sink", self.kind)))
    }
}

/// Bounded frame channel
pub fn frame_channel(kind: MediaKind, capacity: usize) -> (FrameWriter, FrameReader) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        FrameWriter {
            kind,
            sender,
            ledger: None,
        },
        FrameReader { kind, receiver },
    )
}

/// Handles transferred into a worker
#[derive(Debug)]
pub struct TransferHandles {
    /// Frames from the live track
    pub source: FrameReader,
    /// Where processed frames go
    pub sink: FrameWriter,
}

impl TransferHandles {
    /// Give the source back to the track it was taken from, dropping the sink
    pub fn restore_to(self, track: &dyn TrackLike) -> MediaResult<()> {
        track.restore_frames(self.source)
    }
}

/// Transfer handles on offer to a worker
///
/// The worker claims the handles once it accepts them. Until then the offering
/// side can reclaim them, so a failed setup leaves the source intact.
#[derive(Debug, Clone)]
pub struct TransferOffer {
    handles: Arc<Mutex<Option<TransferHandles>>>,
}

impl TransferOffer {
    /// Offer `handles`
    pub fn new(handles: TransferHandles) -> Self {
        Self {
            handles: Arc::new(Mutex::new(Some(handles))),
        }
    }

    /// Take the handles if `check` accepts them
    ///
    /// Rejected handles stay on offer.
    pub fn claim<F>(&self, check: F) -> MediaResult<TransferHandles>
    where
        F: FnOnce(&TransferHandles) -> MediaResult<()>,
    {
        let mut slot = self.handles.lock();
        let handles = slot.take().ok_or_else(|| MediaError::AlreadyTransferred {
            resource: "offered transfer handles".to_string(),
        })?;
        if let Err(e) = check(&handles) {
            *slot = Some(handles);
            return Err(e);
        }
        Ok(handles)
    }

    /// Withdraw the handles unless they were claimed
    pub fn reclaim(&self) -> Option<TransferHandles> {
        self.handles.lock().take()
    }

    /// Whether the handles are still on offer
    pub fn is_pending(&self) -> bool {
        self.handles.lock().is_some()
    }
}

/// Splits a live track into a processing source and a generator sink
#[derive(Debug)]
pub struct FrameSourceAdapter {
    track_id: String,
    source: FrameReader,
    sink: FrameWriter,
    output: FrameReader,
}

impl FrameSourceAdapter {
    /// Take the track's frame source and create the generator channel
    ///
    /// A track's frames can only be taken once; a second attach fails with
    /// [`MediaError::AlreadyTransferred`].
    pub fn attach(track: &dyn TrackLike, capacity: usize) -> MediaResult<Self> {
        let source = track.take_frames()?;
        let (sink, output) = frame_channel(track.kind(), capacity);
        debug!("Attached frame source adapter to {} track {}", track.kind(), track.id());
        Ok(Self {
            track_id: track.id().to_string(),
            source,
            sink,
            output,
        })
    }

    /// Id of the wrapped track
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Consume the adapter, yielding the worker's handles and the output reader
    pub fn transfer(self) -> (TransferHandles, FrameReader) {
        (
            TransferHandles {
                source: self.source,
                sink: self.sink,
            },
            self.output,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioFrame, PixelFormat, VideoFrame};

    fn video(ts: i64) -> MediaFrame {
        MediaFrame::Video(VideoFrame::filled(2, 2, PixelFormat::Gray8, 0, ts))
    }

    fn handles() -> TransferHandles {
        let (_, source) = frame_channel(MediaKind::Video, 1);
        let (sink, _) = frame_channel(MediaKind::Video, 1);
        TransferHandles { source, sink }
    }

    #[test]
    fn test_rejected_claim_leaves_handles_on_offer() {
        let offer = TransferOffer::new(handles());
        let rejected = offer.claim(|_| {
            Err(MediaError::InvalidState {
                message: "not yet".to_string(),
            })
        });
        assert!(matches!(rejected, Err(MediaError::InvalidState { .. })));
        assert!(offer.is_pending());

        assert!(offer.clone().claim(|_| Ok(())).is_ok());
        assert!(offer.reclaim().is_none());
        assert!(matches!(
            offer.claim(|_| Ok(())),
            Err(MediaError::AlreadyTransferred { .. })
        ));
    }

    #[test]
    fn test_reclaimed_handles_cannot_be_claimed() {
        let offer = TransferOffer::new(handles());
        assert!(offer.reclaim().is_some());
        assert!(!offer.is_pending());
        assert!(offer.claim(|_| Ok(())).is_err());
    }

    #[tokio::test]
    async fn test_try_read_reports_empty_and_ended() {
        let (writer, mut reader) = frame_channel(MediaKind::Video, 2);
        assert!(matches!(reader.try_read(), ReadOutcome::Empty));
        writer.push(video(1)).await.unwrap();
        assert!(matches!(reader.try_read(), ReadOutcome::Frame(_)));
        drop(writer);
        assert!(matches!(reader.try_read(), ReadOutcome::Ended));
    }

    #[tokio::test]
    async fn test_push_rejects_wrong_kind() {
        let (writer, _reader) = frame_channel(MediaKind::Video, 2);
        let result = writer.push(MediaFrame::Audio(AudioFrame::default())).await;
        assert!(matches!(result, Err(MediaError::InvalidMediaType { .. })));
    }

    #[tokio::test]
    async fn test_write_to_closed_reader_releases_frame() {
        let ledger = FrameLedger::new();
        let (writer, reader) = frame_channel(MediaKind::Video, 2);
        let writer = writer.with_ledger(ledger.clone());
        drop(reader);
        assert!(writer.push(video(1)).await.is_err());
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.released, 1);
        assert!(snapshot.is_balanced());
    }

    #[tokio::test]
    async fn test_dropping_reader_releases_queued_frames() {
        let ledger = FrameLedger::new();
        let (writer, reader) = frame_channel(MediaKind::Video, 4);
        let writer = writer.with_ledger(ledger.clone());
        writer.push(video(1)).await.unwrap();
        writer.push(video(2)).await.unwrap();
        drop(reader);
        assert!(ledger.snapshot().is_balanced());
        assert_eq!(ledger.snapshot().released, 2);
    }
}
