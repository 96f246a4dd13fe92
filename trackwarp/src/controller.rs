//! Impairment configuration distribution
//!
//! An [`ImpairmentController`] follows one media kind's impairment settings,
//! from the settings store and from `IMPAIRMENT_CHANGE` messages on the bus,
//! and forwards them to a track's worker.

use crate::bridge::BridgeState;
use crate::worker::WorkerCommand;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trackwarp_core::{
    keys, ContextKind, Envelope, MessageBus, SettingsChange, SettingsStore, SettingsStoreExt,
    Subscription, Topic,
};
use trackwarp_media::{ImpairmentSettings, MediaKind};

/// Payload of control-plane messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// New impairment settings for every track of `kind`
    Impairment {
        /// Media kind the settings apply to
        kind: MediaKind,
        /// The settings
        settings: ImpairmentSettings,
    },
    /// State report of one processed track
    Status {
        /// Processed track id
        track_id: String,
        /// New state
        state: BridgeState,
    },
}

/// Settings key holding the impairment settings of `kind`
pub fn settings_key(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Video => keys::IMPAIRMENT_VIDEO,
        MediaKind::Audio => keys::IMPAIRMENT_AUDIO,
    }
}

/// Forwards impairment settings of one media kind to a worker
#[derive(Debug)]
pub struct ImpairmentController {
    kind: MediaKind,
    task: JoinHandle<()>,
}

impl ImpairmentController {
    /// Start forwarding
    ///
    /// The stored settings are sent as `ImpairmentSetup` right away; later
    /// store changes and bus messages follow as `ImpairmentChange`. Stops
    /// when the worker's command channel closes.
    pub fn spawn(
        kind: MediaKind,
        commands: mpsc::Sender<WorkerCommand>,
        store: Arc<dyn SettingsStore>,
        bus: &MessageBus<ControlMessage>,
    ) -> Self {
        // Subscribe synchronously so nothing published after spawn is missed
        let changes = store.subscribe();
        let inbox = bus.on(ContextKind::Page, Topic::ImpairmentChange);
        let distributor = Distributor {
            kind,
            key: settings_key(kind),
            commands,
            store,
        };
        Self {
            kind,
            task: tokio::spawn(distributor.run(changes, inbox)),
        }
    }

    /// Media kind this controller follows
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Whether forwarding has stopped
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop forwarding
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ImpairmentController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Wake {
    Store(Result<SettingsChange, broadcast::error::RecvError>),
    Bus(Option<Envelope<ControlMessage>>),
}

struct Distributor {
    kind: MediaKind,
    key: &'static str,
    commands: mpsc::Sender<WorkerCommand>,
    store: Arc<dyn SettingsStore>,
}

impl Distributor {
    async fn run(
        self,
        mut changes: broadcast::Receiver<SettingsChange>,
        mut inbox: Subscription<ControlMessage>,
    ) {
        let initial = self.stored().unwrap_or_default();
        info!("Initial {} impairment: {:?}", self.kind, initial);
        if !self.forward(WorkerCommand::ImpairmentSetup(initial)).await {
            return;
        }

        let mut store_open = true;
        let mut bus_open = true;
        while store_open || bus_open {
            let wake = tokio::select! {
                change = changes.recv(), if store_open => Wake::Store(change),
                message = inbox.recv(), if bus_open => Wake::Bus(message),
            };

            let settings = match wake {
                Wake::Store(Ok(change)) if change.key == self.key => self.stored(),
                Wake::Store(Ok(_)) => None,
                Wake::Store(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!("Settings changes lagged by {}, re-reading {}", skipped, self.key);
                    self.stored()
                }
                Wake::Store(Err(broadcast::error::RecvError::Closed)) => {
                    store_open = false;
                    None
                }
                Wake::Bus(Some(envelope)) => match envelope.payload {
                    ControlMessage::Impairment { kind, settings } if kind == self.kind => {
                        debug!("Impairment change via {:?}", envelope.hops);
                        Some(settings)
                    }
                    _ => None,
                },
                Wake::Bus(None) => {
                    bus_open = false;
                    None
                }
            };

            if let Some(settings) = settings {
                if !self.forward(WorkerCommand::ImpairmentChange(settings)).await {
                    return;
                }
            }
        }
    }

    /// Stored settings; a removed key reads as disabled, an unreadable one as no change
    fn stored(&self) -> Option<ImpairmentSettings> {
        match self.store.get_as::<ImpairmentSettings>(self.key) {
            Ok(Some(settings)) => Some(settings),
            Ok(None) => Some(ImpairmentSettings::disabled()),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", self.key, e);
                None
            }
        }
    }

    async fn forward(&self, command: WorkerCommand) -> bool {
        if self.commands.send(command).await.is_err() {
            debug!("Worker gone, {} impairment forwarding stopped", self.kind);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trackwarp_core::MemorySettingsStore;
    use trackwarp_media::ImpairmentLevel;

    fn settings_of(command: Option<WorkerCommand>) -> ImpairmentSettings {
        match command {
            Some(WorkerCommand::ImpairmentSetup(settings))
            | Some(WorkerCommand::ImpairmentChange(settings)) => settings,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_store_and_bus_changes_are_forwarded() {
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());
        store
            .set_as(keys::IMPAIRMENT_VIDEO, &ImpairmentSettings::at(ImpairmentLevel::Moderate))
            .unwrap();
        let bus = MessageBus::with_default_routes();
        let (tx, mut rx) = mpsc::channel(8);

        let controller = ImpairmentController::spawn(MediaKind::Video, tx, store.clone(), &bus);
        assert_eq!(settings_of(rx.recv().await).level, ImpairmentLevel::Moderate);

        // Other keys and other kinds are not forwarded
        store.set(keys::IMPAIRMENT_AUDIO, json!({"enabled": true, "level": "severe"}));
        bus.send(
            ContextKind::Dashboard,
            ContextKind::Page,
            Topic::ImpairmentChange,
            ControlMessage::Impairment {
                kind: MediaKind::Audio,
                settings: ImpairmentSettings::disabled(),
            },
        )
        .unwrap();

        store.set(keys::IMPAIRMENT_VIDEO, json!({"enabled": true, "level": "severe"}));
        assert_eq!(settings_of(rx.recv().await).level, ImpairmentLevel::Severe);

        bus.send(
            ContextKind::Dashboard,
            ContextKind::Page,
            Topic::ImpairmentChange,
            ControlMessage::Impairment {
                kind: MediaKind::Video,
                settings: ImpairmentSettings::disabled(),
            },
        )
        .unwrap();
        assert!(!settings_of(rx.recv().await).is_active());

        store.remove(keys::IMPAIRMENT_VIDEO);
        assert_eq!(settings_of(rx.recv().await), ImpairmentSettings::disabled());
        assert!(!controller.is_finished());
    }

    #[tokio::test]
    async fn test_unreadable_settings_are_skipped() {
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());
        let bus = MessageBus::with_default_routes();
        let (tx, mut rx) = mpsc::channel(8);

        let _controller = ImpairmentController::spawn(MediaKind::Audio, tx, store.clone(), &bus);
        assert!(!settings_of(rx.recv().await).is_active());

        store.set(keys::IMPAIRMENT_AUDIO, json!({"level": 42}));
        store.set(keys::IMPAIRMENT_AUDIO, json!({"enabled": true, "level": "moderate"}));
        assert_eq!(settings_of(rx.recv().await).level, ImpairmentLevel::Moderate);
    }

    #[tokio::test]
    async fn test_stops_when_worker_gone() {
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());
        let bus = MessageBus::with_default_routes();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let controller = ImpairmentController::spawn(MediaKind::Video, tx, store, &bus);
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !controller.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_control_message_wire_format() {
        let message = ControlMessage::Status {
            track_id: "t1".to_string(),
            state: BridgeState::Running,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value, json!({"type": "status", "track_id": "t1", "state": "running"}));
    }
}
