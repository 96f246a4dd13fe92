//! # trackwarp core
//!
//! Foundation shared by the media pipeline and the control plane: the error
//! taxonomy, the typed message bus that connects isolated execution contexts,
//! and the settings-store interface configuration is consumed through.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod messaging;
pub mod settings;

// Re-export main types
pub use error::{TrackWarpError, TrackWarpResult};
pub use messaging::{
    ContextKind, Envelope, MessageBus, Route, RoutingTable, Subscription, Topic,
};
pub use settings::{keys, MemorySettingsStore, SettingsChange, SettingsStore, SettingsStoreExt};
