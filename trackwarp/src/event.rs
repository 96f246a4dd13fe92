//! Event system for processed-track lifecycle and status

use crate::bridge::BridgeState;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::warn;
use trackwarp_media::MediaKind;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted while tracks are processed
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    /// The worker accepted its frame handles
    SetupComplete {
        /// Processed track id
        track_id: String,
    },
    /// Bridge state changed
    StateChanged {
        /// Processed track id
        track_id: String,
        /// New state
        state: BridgeState,
    },
    /// Impairment settings took effect
    ImpairmentApplied {
        /// Processed track id
        track_id: String,
        /// Media kind
        kind: MediaKind,
        /// Whether frames are now impaired
        active: bool,
    },
    /// Impairment settings were rejected; the previous ones stay
    ImpairmentRejected {
        /// Processed track id
        track_id: String,
        /// Rejection reason
        reason: String,
    },
    /// A stage command failed
    StageError {
        /// Processed track id
        track_id: String,
        /// Stage key
        stage: String,
        /// Failure reason
        reason: String,
    },
    /// The worker failed and the track was torn down
    Errored {
        /// Processed track id
        track_id: String,
        /// Failure reason
        reason: String,
        /// When the teardown happened
        at: DateTime<Utc>,
    },
    /// The track ended and its worker shut down
    Ended {
        /// Processed track id
        track_id: String,
    },
}

impl TrackEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            TrackEvent::SetupComplete { .. } => "setup_complete",
            TrackEvent::StateChanged { .. } => "state_changed",
            TrackEvent::ImpairmentApplied { .. } => "impairment_applied",
            TrackEvent::ImpairmentRejected { .. } => "impairment_rejected",
            TrackEvent::StageError { .. } => "stage_error",
            TrackEvent::Errored { .. } => "errored",
            TrackEvent::Ended { .. } => "ended",
        }
    }

    /// Track the event belongs to
    pub fn track_id(&self) -> &str {
        match self {
            TrackEvent::SetupComplete { track_id }
            | TrackEvent::StateChanged { track_id, .. }
            | TrackEvent::ImpairmentApplied { track_id, .. }
            | TrackEvent::ImpairmentRejected { track_id, .. }
            | TrackEvent::StageError { track_id, .. }
            | TrackEvent::Errored { track_id, .. }
            | TrackEvent::Ended { track_id } => track_id,
        }
    }

    /// Check if this event reports a failure
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            TrackEvent::ImpairmentRejected { .. }
                | TrackEvent::StageError { .. }
                | TrackEvent::Errored { .. }
        )
    }
}

/// Fan-out sender shared by every bridge of one [`TrackWarp`](crate::TrackWarp)
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: broadcast::Sender<TrackEvent>,
}

impl EventSender {
    /// New sender with no subscribers
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event; no subscribers is fine
    pub fn emit(&self, event: TrackEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to subsequent events
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of track events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<TrackEvent>,
}

impl EventStream {
    /// Get the next event, `None` once every sender is gone
    pub async fn next(&mut self) -> Option<TrackEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event stream lagged, {} event(s) skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to get the next event without waiting
    pub fn try_next(&mut self) -> Option<TrackEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for the first event of a track matching `predicate`
    pub async fn wait_for<F>(&mut self, track_id: &str, mut predicate: F) -> Option<TrackEvent>
    where
        F: FnMut(&TrackEvent) -> bool,
    {
        while let Some(event) = self.next().await {
            if event.track_id() == track_id && predicate(&event) {
                return Some(event);
            }
        }
        None
    }
}
