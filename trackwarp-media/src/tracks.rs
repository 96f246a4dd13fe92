//! Track abstractions: the live source track and its processed proxy
//!
//! Consumers only see [`TrackLike`]. A [`ProxyTrack`] reports the settings,
//! constraints and capabilities of the track it wraps, with a synthetic
//! device identity, and delegates enable/mute/stop and lifecycle to it.

use crate::error::{MediaError, MediaResult};
use crate::frame::{FrameLedger, MediaKind};
use crate::source::{frame_channel, FrameReader, FrameWriter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Prefix of synthetic device ids
pub const SYNTHETIC_DEVICE_PREFIX: &str = "trackwarp:";
/// Group id reported by every proxy track
pub const SYNTHETIC_GROUP_ID: &str = "trackwarp-virtual-group";

const LIFECYCLE_CHANNEL_CAPACITY: usize = 16;

/// Inclusive numeric range
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NumericRange {
    /// Lower bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Current track settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackSettings {
    /// Device id
    pub device_id: Option<String>,
    /// Device group id
    pub group_id: Option<String>,
    /// Width in pixels
    pub width: Option<u32>,
    /// Height in pixels
    pub height: Option<u32>,
    /// Frames per second
    pub frame_rate: Option<f64>,
    /// Width divided by height
    pub aspect_ratio: Option<f64>,
    /// Audio sample rate
    pub sample_rate: Option<u32>,
    /// Audio channel count
    pub channel_count: Option<u16>,
}

/// Constraints the track was opened with
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackConstraints {
    /// Requested device id
    pub device_id: Option<String>,
    /// Width range
    pub width: Option<NumericRange>,
    /// Height range
    pub height: Option<NumericRange>,
    /// Frame rate range
    pub frame_rate: Option<NumericRange>,
    /// Sample rate range
    pub sample_rate: Option<NumericRange>,
    /// Channel count range
    pub channel_count: Option<NumericRange>,
}

/// What the device could deliver
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackCapabilities {
    /// Device id
    pub device_id: Option<String>,
    /// Device group id
    pub group_id: Option<String>,
    /// Width range
    pub width: Option<NumericRange>,
    /// Height range
    pub height: Option<NumericRange>,
    /// Frame rate range
    pub frame_rate: Option<NumericRange>,
    /// Sample rate range
    pub sample_rate: Option<NumericRange>,
    /// Channel count range
    pub channel_count: Option<NumericRange>,
}

/// Track ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackReadyState {
    /// Producing frames
    Live,
    /// Permanently stopped
    Ended,
}

/// Lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackLifecycleEvent {
    /// Source stopped delivering
    Muted,
    /// Source delivering again
    Unmuted,
    /// Track ended
    Ended,
}

/// Static description of a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDescriptor {
    /// Track id
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Human-readable label
    pub label: String,
    /// Settings
    pub settings: TrackSettings,
    /// Constraints
    pub constraints: TrackConstraints,
    /// Capabilities
    pub capabilities: TrackCapabilities,
}

impl TrackDescriptor {
    /// Descriptor with empty settings
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            settings: TrackSettings::default(),
            constraints: TrackConstraints::default(),
            capabilities: TrackCapabilities::default(),
        }
    }
}

/// Common surface of live and proxy tracks
pub trait TrackLike: Send + Sync + Debug {
    /// Track id
    fn id(&self) -> &str;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Label
    fn label(&self) -> &str;
    /// Current settings
    fn settings(&self) -> TrackSettings;
    /// Constraints
    fn constraints(&self) -> TrackConstraints;
    /// Capabilities
    fn capabilities(&self) -> TrackCapabilities;
    /// Whether frames are delivered to consumers
    fn enabled(&self) -> bool;
    /// Toggle delivery
    fn set_enabled(&self, enabled: bool);
    /// Whether the source is currently muted
    fn muted(&self) -> bool;
    /// Ready state
    fn ready_state(&self) -> TrackReadyState;
    /// End the track
    fn stop(&self);
    /// Lifecycle notifications
    fn subscribe(&self) -> broadcast::Receiver<TrackLifecycleEvent>;
    /// Take the track's frame stream; succeeds once
    fn take_frames(&self) -> MediaResult<FrameReader>;
    /// Give back a frame stream taken with `take_frames`
    fn restore_frames(&self, frames: FrameReader) -> MediaResult<()>;
}

fn put_back(slot: &Mutex<Option<FrameReader>>, frames: FrameReader, kind: MediaKind, id: &str) -> MediaResult<()> {
    if frames.kind() != kind {
        return Err(MediaError::InvalidMediaType {
            expected: kind.to_string(),
            actual: frames.kind().to_string(),
        });
    }
    let mut slot = slot.lock();
    if slot.is_some() {
        return Err(MediaError::InvalidState {
            message: format!("track {} still holds its frames", id),
        });
    }
    *slot = Some(frames);
    debug!("Frames of track {} restored", id);
    Ok(())
}

/// A live capture track
#[derive(Debug)]
pub struct SourceTrack {
    descriptor: TrackDescriptor,
    enabled: AtomicBool,
    muted: AtomicBool,
    ended: AtomicBool,
    events: broadcast::Sender<TrackLifecycleEvent>,
    frames: Mutex<Option<FrameReader>>,
    ledger: FrameLedger,
}

impl SourceTrack {
    /// New live track and the writer its device feeds
    ///
    /// Frames pushed through the writer are accounted in the track's ledger.
    pub fn new(descriptor: TrackDescriptor, capacity: usize) -> (Arc<Self>, FrameWriter) {
        let ledger = FrameLedger::new();
        let (writer, reader) = frame_channel(descriptor.kind, capacity);
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        let track = Arc::new(Self {
            descriptor,
            enabled: AtomicBool::new(true),
            muted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            events,
            frames: Mutex::new(Some(reader)),
            ledger: ledger.clone(),
        });
        (track, writer.with_ledger(ledger))
    }

    /// Ledger of frames produced by this track
    pub fn ledger(&self) -> &FrameLedger {
        &self.ledger
    }

    /// Descriptor
    pub fn descriptor(&self) -> &TrackDescriptor {
        &self.descriptor
    }

    /// Mute or unmute the source
    pub fn set_muted(&self, muted: bool) {
        if self.ended.load(Ordering::Acquire) {
            return;
        }
        if self.muted.swap(muted, Ordering::AcqRel) != muted {
            debug!("Track {} {}", self.descriptor.id, if muted { "muted" } else { "unmuted" });
            let event = if muted {
                TrackLifecycleEvent::Muted
            } else {
                TrackLifecycleEvent::Unmuted
            };
            let _ = self.events.send(event);
        }
    }
}

impl TrackLike for SourceTrack {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn kind(&self) -> MediaKind {
        self.descriptor.kind
    }

    fn label(&self) -> &str {
        &self.descriptor.label
    }

    fn settings(&self) -> TrackSettings {
        self.descriptor.settings.clone()
    }

    fn constraints(&self) -> TrackConstraints {
        self.descriptor.constraints.clone()
    }

    fn capabilities(&self) -> TrackCapabilities {
        self.descriptor.capabilities.clone()
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    fn ready_state(&self) -> TrackReadyState {
        if self.ended.load(Ordering::Acquire) {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }

    fn stop(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Track {} ended", self.descriptor.id);
        // An untaken stream has no consumer left
        self.frames.lock().take();
        let _ = self.events.send(TrackLifecycleEvent::Ended);
    }

    fn subscribe(&self) -> broadcast::Receiver<TrackLifecycleEvent> {
        self.events.subscribe()
    }

    fn take_frames(&self) -> MediaResult<FrameReader> {
        if self.ended.load(Ordering::Acquire) {
            return Err(MediaError::TrackEnded {
                track_id: self.descriptor.id.clone(),
            });
        }
        self.frames.lock().take().ok_or_else(|| MediaError::AlreadyTransferred {
            resource: format!("frame source of track {}", self.descriptor.id),
        })
    }

    fn restore_frames(&self, frames: FrameReader) -> MediaResult<()> {
        if self.ended.load(Ordering::Acquire) {
            return Err(MediaError::TrackEnded {
                track_id: self.descriptor.id.clone(),
            });
        }
        put_back(&self.frames, frames, self.descriptor.kind, &self.descriptor.id)
    }
}

/// Synthetic device id derived from the original one
pub fn synthetic_device_id(original: &str) -> String {
    format!("{}{}", SYNTHETIC_DEVICE_PREFIX, original)
}

/// Whether `device_id` was produced by [`synthetic_device_id`]
pub fn is_synthetic_device_id(device_id: &str) -> bool {
    device_id.starts_with(SYNTHETIC_DEVICE_PREFIX)
}

/// Drop-in replacement for a processed track
#[derive(Debug)]
pub struct ProxyTrack {
    descriptor: TrackDescriptor,
    delegate: Arc<dyn TrackLike>,
    frames: Mutex<Option<FrameReader>>,
}

impl ProxyTrack {
    /// Snapshot `delegate` and serve `output` as the proxy's frames
    pub fn new(delegate: Arc<dyn TrackLike>, output: FrameReader) -> Self {
        let original_device = delegate
            .settings()
            .device_id
            .unwrap_or_else(|| delegate.id().to_string());
        let device_id = synthetic_device_id(&original_device);

        let mut settings = delegate.settings();
        settings.device_id = Some(device_id.clone());
        settings.group_id = Some(SYNTHETIC_GROUP_ID.to_string());

        let mut capabilities = delegate.capabilities();
        capabilities.device_id = Some(device_id.clone());
        capabilities.group_id = Some(SYNTHETIC_GROUP_ID.to_string());

        let mut constraints = delegate.constraints();
        if constraints.device_id.is_some() {
            constraints.device_id = Some(device_id);
        }

        let descriptor = TrackDescriptor {
            id: uuid::Uuid::new_v4().to_string(),
            kind: delegate.kind(),
            label: delegate.label().to_string(),
            settings,
            constraints,
            capabilities,
        };

        Self {
            descriptor,
            delegate,
            frames: Mutex::new(Some(output)),
        }
    }

    /// The wrapped track
    pub fn delegate(&self) -> &Arc<dyn TrackLike> {
        &self.delegate
    }
}

impl TrackLike for ProxyTrack {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn kind(&self) -> MediaKind {
        self.descriptor.kind
    }

    fn label(&self) -> &str {
        &self.descriptor.label
    }

    fn settings(&self) -> TrackSettings {
        self.descriptor.settings.clone()
    }

    fn constraints(&self) -> TrackConstraints {
        self.descriptor.constraints.clone()
    }

    fn capabilities(&self) -> TrackCapabilities {
        self.descriptor.capabilities.clone()
    }

    fn enabled(&self) -> bool {
        self.delegate.enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.delegate.set_enabled(enabled);
    }

    fn muted(&self) -> bool {
        self.delegate.muted()
    }

    fn ready_state(&self) -> TrackReadyState {
        self.delegate.ready_state()
    }

    fn stop(&self) {
        self.frames.lock().take();
        self.delegate.stop();
    }

    fn subscribe(&self) -> broadcast::Receiver<TrackLifecycleEvent> {
        self.delegate.subscribe()
    }

    fn take_frames(&self) -> MediaResult<FrameReader> {
        self.frames.lock().take().ok_or_else(|| MediaError::AlreadyTransferred {
            resource: format!("frame output of proxy {}", self.descriptor.id),
        })
    }

    fn restore_frames(&self, frames: FrameReader) -> MediaResult<()> {
        put_back(&self.frames, frames, self.descriptor.kind, &self.descriptor.id)
    }
}
