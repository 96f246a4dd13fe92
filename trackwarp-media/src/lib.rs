//! # trackwarp media
//!
//! The frame path of trackwarp: frames and their buffer accounting, frame
//! channels and the source adapter, the transform manager and its stages
//! (impairment, substitute source, capture tap), and the track facade that
//! lets a processed track stand in for the original.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod codecs;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod player;
pub mod profile;
pub mod source;
pub mod stages;
pub mod tracks;

// Re-export main types
pub use capture::{capture_session, CaptureCancel, CaptureSession, CaptureSettings, CaptureTap, CapturedFrame};
pub use codecs::{
    default_codec_factory, CodecFactory, CodecInfo, EncodedChunk, QuantizingCodec, VideoCodec,
    VideoCodecConfig,
};
pub use error::{ErrorCategory, MediaError, MediaResult};
pub use frame::{
    release_dropped, AudioFrame, Frame, FrameLedger, LedgerSnapshot, MediaFrame, MediaKind,
    PixelFormat, VideoFrame,
};
pub use pipeline::{PipelineStats, StagePosition, TransformManager};
pub use player::{spawn_player, PlayerConfig, PlayerHandle, PlayerState};
pub use profile::{
    AudioImpairmentProfile, ImpairmentLevel, ImpairmentOverrides, ImpairmentProfile,
    ImpairmentSettings, LatencyPolicy, VideoImpairmentProfile,
};
pub use source::{
    frame_channel, FrameReader, FrameSourceAdapter, FrameWriter, ReadOutcome, TransferHandles,
    TransferOffer,
};
pub use stages::{
    AudioImpairmentStage, AudioImpairmentStats, Backlog, BacklogSlot, FnStage, StageCommand, StageFailure, StageResult,
    SubstituteStage, TransformStage, VideoImpairmentStage, VideoImpairmentStats, CAPTURE_STAGE,
    IMPAIRMENT_STAGE, MAX_PENDING_ENCODES, SUBSTITUTE_STAGE,
};
pub use tracks::{
    is_synthetic_device_id, NumericRange, ProxyTrack, SourceTrack, TrackCapabilities,
    TrackConstraints, TrackDescriptor, TrackLifecycleEvent, TrackLike, TrackReadyState,
    TrackSettings,
};
