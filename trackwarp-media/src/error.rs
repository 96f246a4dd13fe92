//! Media pipeline error types
//!
//! Every failure the frame path can produce is a [`MediaError`]. Per-frame
//! failures are recovered inside the pipeline; lifecycle and transfer failures
//! are fatal for the track and surface through the control plane.

use thiserror::Error;
use trackwarp_core::TrackWarpError;

/// Main error type for media pipeline operations
#[derive(Error, Debug)]
pub enum MediaError {
    /// Settings or profile values rejected
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// Encoding operation failed
    #[error("Encoding failed: {codec} - {reason}")]
    EncodingFailed {
        /// Codec name
        codec: String,
        /// Failure reason
        reason: String,
    },

    /// Decoding operation failed
    #[error("Decoding failed: {codec} - {reason}")]
    DecodingFailed {
        /// Codec name
        codec: String,
        /// Failure reason
        reason: String,
    },

    /// Frame or track of the wrong media kind
    #[error("Invalid media type: expected {expected}, got {actual}")]
    InvalidMediaType {
        /// Expected media type
        expected: String,
        /// Actual media type
        actual: String,
    },

    /// Frame buffer size does not match its dimensions
    #[error("Invalid frame data: expected {expected} bytes, got {actual}")]
    InvalidFrameData {
        /// Expected data size
        expected: usize,
        /// Actual data size
        actual: usize,
    },

    /// A single-transfer resource was acquired twice
    #[error("Already transferred: {resource}")]
    AlreadyTransferred {
        /// Resource description
        resource: String,
    },

    /// Frame channel closed by its peer
    #[error("Channel closed: {channel}")]
    ChannelClosed {
        /// Channel description
        channel: String,
    },

    /// No stage registered under the key
    #[error("Stage not found: {key}")]
    StageNotFound {
        /// Stage key
        key: String,
    },

    /// Stage does not understand the command
    #[error("Stage {stage} does not support {command}")]
    UnsupportedCommand {
        /// Stage name
        stage: String,
        /// Command name
        command: String,
    },

    /// Track already ended
    #[error("Track ended: {track_id}")]
    TrackEnded {
        /// Track identifier
        track_id: String,
    },

    /// Operation not valid in the current state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// State error message
        message: String,
    },

    /// Work was rejected because a bounded queue is full
    #[error("Backpressure: {pending} operations pending")]
    Backpressure {
        /// Operations already queued
        pending: usize,
    },
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// Whether the pipeline can carry on after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            MediaError::EncodingFailed { .. } => true,
            MediaError::DecodingFailed { .. } => true,
            MediaError::InvalidFrameData { .. } => true,
            MediaError::Backpressure { .. } => true,
            MediaError::StageNotFound { .. } => true,
            MediaError::AlreadyTransferred { .. } => false,
            MediaError::ChannelClosed { .. } => false,
            MediaError::TrackEnded { .. } => false,
            _ => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            MediaError::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            MediaError::EncodingFailed { .. } => ErrorCategory::Codec,
            MediaError::DecodingFailed { .. } => ErrorCategory::Codec,
            MediaError::InvalidMediaType { .. } => ErrorCategory::Format,
            MediaError::InvalidFrameData { .. } => ErrorCategory::Data,
            MediaError::AlreadyTransferred { .. } => ErrorCategory::Lifecycle,
            MediaError::ChannelClosed { .. } => ErrorCategory::Lifecycle,
            MediaError::TrackEnded { .. } => ErrorCategory::Lifecycle,
            MediaError::StageNotFound { .. } => ErrorCategory::State,
            MediaError::UnsupportedCommand { .. } => ErrorCategory::State,
            MediaError::InvalidState { .. } => ErrorCategory::State,
            MediaError::Backpressure { .. } => ErrorCategory::Resource,
        }
    }

    pub(crate) fn channel_closed(channel: impl Into<String>) -> Self {
        MediaError::ChannelClosed {
            channel: channel.into(),
        }
    }
}

/// Coarse grouping of media errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration and parameter errors
    Configuration,
    /// Codec-related errors
    Codec,
    /// Format and data structure errors
    Format,
    /// Data validation errors
    Data,
    /// Track and handle lifecycle errors
    Lifecycle,
    /// State management errors
    State,
    /// Bounded queue errors
    Resource,
}

impl From<MediaError> for TrackWarpError {
    fn from(error: MediaError) -> Self {
        match error {
            MediaError::InvalidConfiguration { message } => {
                TrackWarpError::InvalidConfiguration { reason: message }
            }
            MediaError::ChannelClosed { channel } => TrackWarpError::ChannelClosed { channel },
            other => TrackWarpError::MediaProcessing {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let transfer = MediaError::AlreadyTransferred {
            resource: "frame source of cam-1".to_string(),
        };
        assert_eq!(transfer.category(), ErrorCategory::Lifecycle);
        assert!(!transfer.is_recoverable());

        let codec_error = MediaError::EncodingFailed {
            codec: "quantizer".to_string(),
            reason: "not configured".to_string(),
        };
        assert_eq!(codec_error.category(), ErrorCategory::Codec);
        assert!(codec_error.is_recoverable());

        let shed = MediaError::Backpressure { pending: 3 };
        assert_eq!(shed.category(), ErrorCategory::Resource);
        assert!(shed.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = MediaError::InvalidFrameData {
            expected: 1024,
            actual: 512,
        };
        assert_eq!(
            error.to_string(),
            "Invalid frame data: expected 1024 bytes, got 512"
        );
    }

    #[test]
    fn test_conversion_to_control_plane_error() {
        let error: TrackWarpError = MediaError::InvalidConfiguration {
            message: "scale must be in (0, 1]".to_string(),
        }
        .into();
        assert!(matches!(error, TrackWarpError::InvalidConfiguration { .. }));
    }
}
