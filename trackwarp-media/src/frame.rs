//! Media frames and frame buffer accounting
//!
//! A [`Frame`] is single-owner and single-use. Frames created against a
//! [`FrameLedger`] stand for native buffers: each one must be settled exactly
//! once, either released with [`Frame::close`] or handed downstream with
//! [`Frame::forward`]. A tracked frame that is dropped unsettled is counted
//! as leaked, unless it is dropped while unwinding from a panic or inside
//! [`release_dropped`], in which case it is counted as released.

use crate::error::{MediaError, MediaResult};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static RELEASE_ON_DROP: Cell<bool> = const { Cell::new(false) };
}

/// Run `f`, counting tracked frames it drops unsettled as released
pub fn release_dropped<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(bool);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0;
            let _ = RELEASE_ON_DROP.try_with(|flag| flag.set(previous));
        }
    }

    let previous = RELEASE_ON_DROP.with(|flag| flag.replace(true));
    let _restore = Restore(previous);
    f()
}

fn releasing_drops() -> bool {
    std::thread::panicking() || RELEASE_ON_DROP.try_with(Cell::get).unwrap_or(false)
}

/// Media kind of a track or frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio samples
    Audio,
    /// Video pictures
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Pixel layouts carried by [`VideoFrame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// One luma byte per pixel
    Gray8,
    /// Four bytes per pixel, R G B A
    Rgba8,
}

impl PixelFormat {
    /// Bytes used by one pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Raw video picture
///
/// `width`/`height` are the coded dimensions of `data`;
/// `display_width`/`display_height` are what the track reports to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    /// Coded width in pixels
    pub width: u32,
    /// Coded height in pixels
    pub height: u32,
    /// Display width in pixels
    pub display_width: u32,
    /// Display height in pixels
    pub display_height: u32,
    /// Pixel layout of `data`
    pub format: PixelFormat,
    /// Pixel data, row-major
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds
    pub timestamp_us: i64,
    /// Frame duration in microseconds, if known
    pub duration_us: Option<u64>,
    /// Whether this frame is a decoder reference point
    pub is_keyframe: bool,
}

impl VideoFrame {
    /// Create a frame, validating the buffer size
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
        timestamp_us: i64,
    ) -> MediaResult<Self> {
        if width == 0 || height == 0 {
            return Err(MediaError::InvalidConfiguration {
                message: format!("Invalid frame size {}x{}", width, height),
            });
        }
        let expected = Self::expected_len(width, height, format);
        if data.len() != expected {
            return Err(MediaError::InvalidFrameData {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            display_width: width,
            display_height: height,
            format,
            data,
            timestamp_us,
            duration_us: None,
            is_keyframe: false,
        })
    }

    /// Frame with every byte set to `value`
    pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8, timestamp_us: i64) -> Self {
        Self {
            width,
            height,
            display_width: width,
            display_height: height,
            format,
            data: vec![value; Self::expected_len(width, height, format)],
            timestamp_us,
            duration_us: None,
            is_keyframe: false,
        }
    }

    /// Buffer size for the given geometry
    pub fn expected_len(width: u32, height: u32, format: PixelFormat) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }

    /// Whether the coded size is smaller than the display size
    pub fn is_downscaled(&self) -> bool {
        self.width < self.display_width || self.height < self.display_height
    }

    /// Nearest-neighbour resample to a new coded size
    ///
    /// Display dimensions, timestamp and flags are kept. Fails when the buffer
    /// does not match the frame's own geometry.
    pub fn resized(&self, width: u32, height: u32) -> MediaResult<VideoFrame> {
        let expected = Self::expected_len(self.width, self.height, self.format);
        if self.data.len() != expected {
            return Err(MediaError::InvalidFrameData {
                expected,
                actual: self.data.len(),
            });
        }

        let width = width.max(1);
        let height = height.max(1);
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }

        let bpp = self.format.bytes_per_pixel();
        let mut data = Vec::with_capacity(Self::expected_len(width, height, self.format));
        for y in 0..height as u64 {
            let src_y = (y * self.height as u64 / height as u64) as usize;
            for x in 0..width as u64 {
                let src_x = (x * self.width as u64 / width as u64) as usize;
                let offset = (src_y * self.width as usize + src_x) * bpp;
                let pixel = self
                    .data
                    .get(offset..offset + bpp)
                    .ok_or_else(|| MediaError::InvalidFrameData {
                        expected,
                        actual: self.data.len(),
                    })?;
                data.extend_from_slice(pixel);
            }
        }

        Ok(VideoFrame {
            width,
            height,
            data,
            ..self.clone_metadata()
        })
    }

    fn clone_metadata(&self) -> VideoFrame {
        VideoFrame {
            width: self.width,
            height: self.height,
            display_width: self.display_width,
            display_height: self.display_height,
            format: self.format,
            data: Vec::new(),
            timestamp_us: self.timestamp_us,
            duration_us: self.duration_us,
            is_keyframe: self.is_keyframe,
        }
    }
}

/// Interleaved PCM audio
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioFrame {
    /// Interleaved f32 samples
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp of the first sample in microseconds
    pub timestamp_us: i64,
}

impl AudioFrame {
    /// Create a frame, validating its layout
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16, timestamp_us: i64) -> MediaResult<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(MediaError::InvalidConfiguration {
                message: format!(
                    "Invalid audio layout: {} Hz, {} channel(s)",
                    sample_rate, channels
                ),
            });
        }
        if samples.len() % channels as usize != 0 {
            return Err(MediaError::InvalidFrameData {
                expected: samples.len() - samples.len() % channels as usize,
                actual: samples.len(),
            });
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
            timestamp_us,
        })
    }

    /// Number of sample-frames (one sample per channel)
    pub fn number_of_frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Duration covered by the frame
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.number_of_frames() as u64 * 1_000_000 / self.sample_rate as u64
    }

    /// Zero every channel of one sample-frame
    pub fn silence_frame(&mut self, index: usize) {
        let channels = self.channels as usize;
        let start = index * channels;
        if let Some(slot) = self.samples.get_mut(start..start + channels) {
            slot.iter_mut().for_each(|sample| *sample = 0.0);
        }
    }

    /// Whether every sample is zero
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|sample| *sample == 0.0)
    }
}

/// Audio or video payload
#[derive(Debug, Clone, PartialEq)]
pub enum MediaFrame {
    /// Audio frame
    Audio(AudioFrame),
    /// Video frame
    Video(VideoFrame),
}

impl MediaFrame {
    /// Kind of the payload
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaFrame::Audio(_) => MediaKind::Audio,
            MediaFrame::Video(_) => MediaKind::Video,
        }
    }

    /// Presentation timestamp in microseconds
    pub fn timestamp_us(&self) -> i64 {
        match self {
            MediaFrame::Audio(frame) => frame.timestamp_us,
            MediaFrame::Video(frame) => frame.timestamp_us,
        }
    }

    /// Overwrite the presentation timestamp
    pub fn set_timestamp_us(&mut self, timestamp_us: i64) {
        match self {
            MediaFrame::Audio(frame) => frame.timestamp_us = timestamp_us,
            MediaFrame::Video(frame) => frame.timestamp_us = timestamp_us,
        }
    }
}

#[derive(Debug, Default)]
struct LedgerCounters {
    allocated: AtomicU64,
    released: AtomicU64,
    forwarded: AtomicU64,
    leaked: AtomicU64,
}

/// Shared counters for the frames of one source
#[derive(Debug, Clone, Default)]
pub struct FrameLedger {
    counters: Arc<LedgerCounters>,
}

/// Point-in-time copy of a [`FrameLedger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    /// Frames created against the ledger
    pub allocated: u64,
    /// Frames released with `close`
    pub released: u64,
    /// Frames handed downstream with `forward`
    pub forwarded: u64,
    /// Frames dropped without being settled
    pub leaked: u64,
}

impl LedgerSnapshot {
    /// Frames still alive and unsettled
    pub fn outstanding(&self) -> u64 {
        self.allocated
            .saturating_sub(self.released + self.forwarded + self.leaked)
    }

    /// Every allocated frame settled exactly once and none leaked
    pub fn is_balanced(&self) -> bool {
        self.leaked == 0 && self.allocated == self.released + self.forwarded
    }
}

impl FrameLedger {
    /// Fresh ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter values
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            allocated: self.counters.allocated.load(Ordering::Acquire),
            released: self.counters.released.load(Ordering::Acquire),
            forwarded: self.counters.forwarded.load(Ordering::Acquire),
            leaked: self.counters.leaked.load(Ordering::Acquire),
        }
    }

    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Released,
    Forwarded,
}

/// Single-owner handle to one media frame
pub struct Frame {
    id: u64,
    media: MediaFrame,
    captured_at: Instant,
    due: Option<Instant>,
    ledger: Option<FrameLedger>,
    settled: bool,
}

impl Frame {
    /// Untracked frame
    pub fn new(media: MediaFrame) -> Self {
        Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            media,
            captured_at: Instant::now(),
            due: None,
            ledger: None,
            settled: false,
        }
    }

    /// Frame accounted against `ledger`
    pub fn tracked(media: MediaFrame, ledger: &FrameLedger) -> Self {
        FrameLedger::record(&ledger.counters.allocated);
        let mut frame = Self::new(media);
        frame.ledger = Some(ledger.clone());
        frame
    }

    /// New frame in the same ledger, sharing this frame's capture instant
    pub fn derive(&self, media: MediaFrame) -> Frame {
        let mut frame = match &self.ledger {
            Some(ledger) => Frame::tracked(media, ledger),
            None => Frame::new(media),
        };
        frame.captured_at = self.captured_at;
        frame.due = self.due;
        frame
    }

    /// Process-unique frame id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Media kind
    pub fn kind(&self) -> MediaKind {
        self.media.kind()
    }

    /// Payload
    pub fn media(&self) -> &MediaFrame {
        &self.media
    }

    /// Mutable payload
    pub fn media_mut(&mut self) -> &mut MediaFrame {
        &mut self.media
    }

    /// Swap the payload, returning the previous one
    pub fn replace_media(&mut self, media: MediaFrame) -> MediaFrame {
        std::mem::replace(&mut self.media, media)
    }

    /// Video payload, if any
    pub fn as_video(&self) -> Option<&VideoFrame> {
        match &self.media {
            MediaFrame::Video(frame) => Some(frame),
            MediaFrame::Audio(_) => None,
        }
    }

    /// Mutable video payload, if any
    pub fn as_video_mut(&mut self) -> Option<&mut VideoFrame> {
        match &mut self.media {
            MediaFrame::Video(frame) => Some(frame),
            MediaFrame::Audio(_) => None,
        }
    }

    /// Audio payload, if any
    pub fn as_audio(&self) -> Option<&AudioFrame> {
        match &self.media {
            MediaFrame::Audio(frame) => Some(frame),
            MediaFrame::Video(_) => None,
        }
    }

    /// Mutable audio payload, if any
    pub fn as_audio_mut(&mut self) -> Option<&mut AudioFrame> {
        match &mut self.media {
            MediaFrame::Audio(frame) => Some(frame),
            MediaFrame::Video(_) => None,
        }
    }

    /// Presentation timestamp in microseconds
    pub fn timestamp_us(&self) -> i64 {
        self.media.timestamp_us()
    }

    /// When the frame entered the system
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Override the capture instant
    pub fn set_captured_at(&mut self, captured_at: Instant) {
        self.captured_at = captured_at;
    }

    /// Hold the frame until `latency_ms` after capture
    ///
    /// The pipeline waits for the latest hold once every stage has run.
    pub fn hold_for(&mut self, latency_ms: u64) {
        if latency_ms == 0 {
            return;
        }
        let due = self.captured_at + Duration::from_millis(latency_ms);
        self.due = Some(self.due.map_or(due, |held| held.max(due)));
    }

    /// Instant before which the frame must not leave the pipeline
    pub fn due(&self) -> Option<Instant> {
        self.due
    }

    /// Whether the frame is accounted in a ledger
    pub fn is_tracked(&self) -> bool {
        self.ledger.is_some()
    }

    /// Release the frame's buffer
    pub fn close(mut self) {
        self.settle(Settlement::Released);
    }

    /// Hand the frame downstream
    ///
    /// The returned frame is untracked: accounting ends at the pipeline
    /// boundary.
    pub fn forward(mut self) -> Frame {
        self.settle(Settlement::Forwarded);
        Frame {
            id: self.id,
            media: self.take_media(),
            captured_at: self.captured_at,
            due: None,
            ledger: None,
            settled: true,
        }
    }

    /// Consume the frame, keeping only its payload
    pub fn into_media(mut self) -> MediaFrame {
        self.settle(Settlement::Released);
        self.take_media()
    }

    fn take_media(&mut self) -> MediaFrame {
        std::mem::replace(&mut self.media, MediaFrame::Audio(AudioFrame::default()))
    }

    fn settle(&mut self, settlement: Settlement) {
        if self.settled {
            return;
        }
        self.settled = true;
        if let Some(ledger) = &self.ledger {
            match settlement {
                Settlement::Released => FrameLedger::record(&ledger.counters.released),
                Settlement::Forwarded => FrameLedger::record(&ledger.counters.forwarded),
            }
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(ledger) = &self.ledger {
            if releasing_drops() {
                FrameLedger::record(&ledger.counters.released);
                debug!("Frame {} ({}) released on drop", self.id, self.media.kind());
                return;
            }
            FrameLedger::record(&ledger.counters.leaked);
            warn!(
                "Frame {} ({}) dropped without being closed or forwarded",
                self.id,
                self.media.kind()
            );
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("kind", &self.media.kind())
            .field("timestamp_us", &self.media.timestamp_us())
            .field("tracked", &self.ledger.is_some())
            .finish()
    }
}
