//! Error types for trackwarp

use std::time::Duration;
use thiserror::Error;

/// Main error type for trackwarp control-plane operations
#[derive(Error, Debug)]
pub enum TrackWarpError {
    /// Initialization error
    #[error("Initialization failed: {reason}")]
    Initialization {
        /// Reason for initialization failure
        reason: String,
    },

    /// Missing configuration error
    #[error("Missing required configuration: {field}")]
    MissingConfiguration {
        /// Missing configuration field
        field: String,
    },

    /// Configuration value rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the value was rejected
        reason: String,
    },

    /// No route between two execution contexts
    #[error("No route from {from} to {to}")]
    NoRoute {
        /// Sending context
        from: String,
        /// Destination context
        to: String,
    },

    /// A control or frame channel was closed by its peer
    #[error("Channel closed: {channel}")]
    ChannelClosed {
        /// Channel description
        channel: String,
    },

    /// Settings store failure
    #[error("Settings error for key {key}: {reason}")]
    Settings {
        /// Settings key involved
        key: String,
        /// Failure reason
        reason: String,
    },

    /// JSON (de)serialization failed
    #[error("Serialization error: {source}")]
    Serialization {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },

    /// I/O error (configuration files)
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Worker context could not be created or rejected its setup
    #[error("Worker setup failed for track {track_id}: {reason}")]
    WorkerSetup {
        /// Track being processed
        track_id: String,
        /// Failure reason
        reason: String,
    },

    /// Worker context terminated unexpectedly
    #[error("Worker for track {track_id} terminated: {reason}")]
    WorkerTerminated {
        /// Track being processed
        track_id: String,
        /// Termination reason
        reason: String,
    },

    /// Media pipeline error surfaced through the control plane
    #[error("Media processing error: {reason}")]
    MediaProcessing {
        /// Reason for media error
        reason: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// Elapsed duration
        duration: Duration,
    },
}

/// Result type alias for trackwarp operations
pub type TrackWarpResult<T> = Result<T, TrackWarpError>;

impl TrackWarpError {
    /// Whether the failure is transient and the caller may carry on
    pub fn is_recoverable(&self) -> bool {
        match self {
            TrackWarpError::Timeout { .. } => true,
            TrackWarpError::NoRoute { .. } => true,
            TrackWarpError::MediaProcessing { .. } => true,
            TrackWarpError::Settings { .. } => true,
            TrackWarpError::WorkerSetup { .. } => false,
            TrackWarpError::WorkerTerminated { .. } => false,
            TrackWarpError::Initialization { .. } => false,
            _ => false,
        }
    }

    /// Whether the error is fatal for the track it concerns
    pub fn is_fatal_for_track(&self) -> bool {
        matches!(
            self,
            TrackWarpError::WorkerSetup { .. } | TrackWarpError::WorkerTerminated { .. }
        )
    }

    /// Shorthand for a closed channel
    pub fn channel_closed(channel: impl Into<String>) -> Self {
        TrackWarpError::ChannelClosed {
            channel: channel.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_errors_are_fatal() {
        let error = TrackWarpError::WorkerSetup {
            track_id: "cam-1".to_string(),
            reason: "handles already transferred".to_string(),
        };
        assert!(error.is_fatal_for_track());
        assert!(!error.is_recoverable());
        assert_eq!(
            error.to_string(),
            "Worker setup failed for track cam-1: handles already transferred"
        );
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse = serde_json::from_str::<u32>("not a number").unwrap_err();
        let error = TrackWarpError::from(parse);
        assert!(matches!(error, TrackWarpError::Serialization { .. }));
    }
}
