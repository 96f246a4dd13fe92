//! Persisted settings interface
//!
//! The pipeline only consumes settings through [`SettingsStore`]: a flat
//! key/value store with change notifications. Persistence itself belongs to
//! the host; [`MemorySettingsStore`] is the in-process implementation used by
//! default and in tests.

use crate::error::{TrackWarpError, TrackWarpResult};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use tokio::sync::broadcast;
use tracing::debug;

/// Well-known settings keys
pub mod keys {
    /// Video impairment settings (`ImpairmentSettings` JSON)
    pub const IMPAIRMENT_VIDEO: &str = "impairment.video";
    /// Audio impairment settings (`ImpairmentSettings` JSON)
    pub const IMPAIRMENT_AUDIO: &str = "impairment.audio";
    /// Status field: whether video impairment is currently applied
    pub const IMPAIRMENT_VIDEO_ACTIVE: &str = "impairment.video.active";
    /// Status field: whether audio impairment is currently applied
    pub const IMPAIRMENT_AUDIO_ACTIVE: &str = "impairment.audio.active";

    /// Status field holding the bridge state of one track
    pub fn track_state(track_id: &str) -> String {
        format!("track.{}.state", track_id)
    }
}

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// One settings mutation
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsChange {
    /// Key that changed
    pub key: String,
    /// Value before the change
    pub old_value: Option<Value>,
    /// Value after the change (`None` when removed)
    pub new_value: Option<Value>,
}

/// Key/value settings store with change notifications
pub trait SettingsStore: Send + Sync + Debug {
    /// Current value of `key`
    fn get(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`, notifying subscribers if it changed
    fn set(&self, key: &str, value: Value);

    /// Remove `key`, returning its last value
    fn remove(&self, key: &str) -> Option<Value>;

    /// Subscribe to subsequent changes
    fn subscribe(&self) -> broadcast::Receiver<SettingsChange>;
}

/// Typed helpers over any [`SettingsStore`]
pub trait SettingsStoreExt {
    /// Deserialize the value under `key`
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> TrackWarpResult<Option<T>>;

    /// Serialize `value` under `key`
    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> TrackWarpResult<()>;
}

impl<S: SettingsStore + ?Sized> SettingsStoreExt for S {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> TrackWarpResult<Option<T>> {
        match self.get(key) {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| TrackWarpError::Settings {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> TrackWarpResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }
}

/// In-memory settings store
#[derive(Debug)]
pub struct MemorySettingsStore {
    values: DashMap<String, Value>,
    changes: broadcast::Sender<SettingsChange>,
}

impl MemorySettingsStore {
    /// Empty store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: DashMap::new(),
            changes,
        }
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn notify(&self, change: SettingsChange) {
        debug!("Setting changed: {}", change.key);
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: Value) {
        let old_value = self.values.insert(key.to_string(), value.clone());
        if old_value.as_ref() == Some(&value) {
            return;
        }
        self.notify(SettingsChange {
            key: key.to_string(),
            old_value,
            new_value: Some(value),
        });
    }

    fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.values.remove(key).map(|(_, value)| value);
        if removed.is_some() {
            self.notify(SettingsChange {
                key: key.to_string(),
                old_value: removed.clone(),
                new_value: None,
            });
        }
        removed
    }

    fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_notifies_only_on_change() {
        let store = MemorySettingsStore::new();
        let mut changes = store.subscribe();

        store.set("impairment.video", json!({"enabled": true}));
        store.set("impairment.video", json!({"enabled": true}));
        store.set("impairment.video", json!({"enabled": false}));

        let first = changes.recv().await.unwrap();
        assert_eq!(first.old_value, None);
        let second = changes.recv().await.unwrap();
        assert_eq!(second.new_value, Some(json!({"enabled": false})));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_typed_access() {
        let store = MemorySettingsStore::new();
        store.set_as(keys::IMPAIRMENT_VIDEO_ACTIVE, &true).unwrap();
        assert_eq!(
            store.get_as::<bool>(keys::IMPAIRMENT_VIDEO_ACTIVE).unwrap(),
            Some(true)
        );
        assert!(store.get_as::<u32>(keys::IMPAIRMENT_VIDEO_ACTIVE).is_err());
        assert_eq!(store.get_as::<bool>("missing").unwrap(), None);
    }

    #[test]
    fn test_remove_returns_last_value() {
        let store = MemorySettingsStore::new();
        store.set("k", json!(1));
        assert_eq!(store.remove("k"), Some(json!(1)));
        assert_eq!(store.remove("k"), None);
        assert!(store.is_empty());
    }
}
