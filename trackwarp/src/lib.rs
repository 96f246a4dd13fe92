//! # trackwarp - Real-Time Media Track Processing
//!
//! trackwarp sits between a capture device and the application consuming its
//! tracks. Every processed track gets its own worker running a transform
//! pipeline (network impairment, substitute playback, frame capture) in an
//! isolated execution context, while the application keeps working with a
//! drop-in proxy track.
//!
//! ## Key Features
//!
//! - **Worker isolation**: one pipeline per track, in its own thread and runtime
//! - **Live impairment**: moderate and severe network profiles, switchable mid-stream
//! - **Graceful degradation**: a track that cannot be processed is passed through
//! - **Frame accounting**: every frame is forwarded or released, never leaked
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trackwarp::{
//!     ImpairmentLevel, ImpairmentSettings, MediaKind, SourceTrack, TrackDescriptor, TrackWarp,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let warp = TrackWarp::init()?;
//!
//!     // A camera track and the writer its driver feeds
//!     let (camera, _device) = SourceTrack::new(TrackDescriptor::new(MediaKind::Video, "Camera"), 8);
//!
//!     let processed = warp.processor(camera).build_or_passthrough().await;
//!     warp.set_impairment(MediaKind::Video, ImpairmentSettings::at(ImpairmentLevel::Severe))?;
//!
//!     let mut events = warp.events();
//!     while let Some(event) = events.next().await {
//!         println!("Track event: {:?}", event);
//!     }
//!     drop(processed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use trackwarp_core::{
    keys, ContextKind, MemorySettingsStore, MessageBus, RoutingTable, SettingsStore,
    SettingsStoreExt, Topic, TrackWarpError, TrackWarpResult,
};

pub use trackwarp_media::{
    is_synthetic_device_id, spawn_player, AudioFrame, CaptureSession, CaptureSettings,
    CapturedFrame, Frame, FrameReader, FrameWriter, ImpairmentLevel, ImpairmentOverrides,
    ImpairmentSettings, LatencyPolicy, MediaError, MediaFrame, MediaKind, PixelFormat,
    PlayerConfig, PlayerHandle, ProxyTrack, SourceTrack, TrackDescriptor, TrackLifecycleEvent,
    TrackLike, TrackReadyState, VideoFrame,
};

// Public API modules
pub mod bridge;
pub mod config;
pub mod controller;
pub mod event;
pub mod logging;
pub mod worker;

// Re-export main API types
pub use bridge::{
    BridgeDeps, BridgeState, ContextHandle, DedicatedThreadContext, ExecutionContext,
    SharedRuntimeContext, TrackBridge,
};
pub use config::{ContextMode, GlobalConfig};
pub use controller::{settings_key, ControlMessage, ImpairmentController};
pub use event::{EventSender, EventStream, TrackEvent};
pub use logging::init_logging;
pub use worker::{TrackWorker, WorkerCommand, WorkerConfig, WorkerReport};

use std::sync::Arc;
use tracing::{debug, warn};
use trackwarp_media::{FrameSourceAdapter, TransferOffer};

/// Main entry point for trackwarp
///
/// One instance is shared by every processed track: it owns the settings
/// store, the message bus and the event channel those tracks report to.
#[derive(Debug, Clone)]
pub struct TrackWarp {
    inner: Arc<TrackWarpInner>,
}

#[derive(Debug, Clone)]
struct TrackWarpInner {
    config: GlobalConfig,
    store: Arc<dyn SettingsStore>,
    bus: MessageBus<ControlMessage>,
    events: EventSender,
    context: Arc<dyn ExecutionContext>,
}

impl TrackWarp {
    /// Initialize with default settings
    ///
    /// # Example
    /// ```rust,no_run
    /// use trackwarp::TrackWarp;
    ///
    /// let warp = TrackWarp::init()?;
    /// # Ok::<(), trackwarp::TrackWarpError>(())
    /// ```
    pub fn init() -> TrackWarpResult<Self> {
        Self::init_with(GlobalConfig::default())
    }

    /// Initialize with custom global configuration
    ///
    /// [`ContextMode::SharedRuntime`] requires a running tokio runtime.
    pub fn init_with(config: GlobalConfig) -> TrackWarpResult<Self> {
        config.validate()?;
        if config.debug_logging {
            init_logging(&config);
        }

        let context: Arc<dyn ExecutionContext> = match config.context_mode {
            ContextMode::DedicatedThread => Arc::new(DedicatedThreadContext::new()),
            ContextMode::SharedRuntime => Arc::new(SharedRuntimeContext::current()?),
        };
        debug!("trackwarp initialized ({:?})", config.context_mode);

        Ok(Self {
            inner: Arc::new(TrackWarpInner {
                config,
                store: Arc::new(MemorySettingsStore::new()),
                bus: MessageBus::with_default_routes(),
                events: EventSender::new(),
                context,
            }),
        })
    }

    /// Use `store` for settings and status fields
    pub fn with_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        Arc::make_mut(&mut self.inner).store = store;
        self
    }

    /// Use `bus` for control messages
    pub fn with_bus(mut self, bus: MessageBus<ControlMessage>) -> Self {
        Arc::make_mut(&mut self.inner).bus = bus;
        self
    }

    /// Run workers in `context`
    pub fn with_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        Arc::make_mut(&mut self.inner).context = context;
        self
    }

    /// Global configuration
    pub fn config(&self) -> &GlobalConfig {
        &self.inner.config
    }

    /// Settings store
    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.inner.store
    }

    /// Control message bus
    pub fn bus(&self) -> &MessageBus<ControlMessage> {
        &self.inner.bus
    }

    /// Subscribe to track events
    pub fn events(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Store impairment settings for every track of `kind`
    pub fn set_impairment(&self, kind: MediaKind, settings: ImpairmentSettings) -> TrackWarpResult<()> {
        self.inner.store.set_as(settings_key(kind), &settings)
    }

    /// Start processing `track`
    pub fn processor(&self, track: Arc<dyn TrackLike>) -> TrackProcessorBuilder {
        TrackProcessorBuilder {
            warp: self.clone(),
            track,
            capacity: self.inner.config.channel_capacity,
        }
    }

    fn deps(&self) -> BridgeDeps {
        BridgeDeps {
            config: self.inner.config.clone(),
            store: self.inner.store.clone(),
            bus: self.inner.bus.clone(),
            events: self.inner.events.clone(),
        }
    }
}

/// Builder wiring one track into a worker-backed pipeline
#[derive(Debug)]
pub struct TrackProcessorBuilder {
    warp: TrackWarp,
    track: Arc<dyn TrackLike>,
    capacity: usize,
}

impl TrackProcessorBuilder {
    /// Frames buffered between pipeline hops
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Build the processed track
    ///
    /// Fails if the track's frames cannot be taken or the worker does not
    /// accept them. When the worker never claimed the frames they are given
    /// back to the track.
    pub async fn build(self) -> TrackWarpResult<ProcessedTrack> {
        let kind = self.track.kind();
        let adapter = FrameSourceAdapter::attach(self.track.as_ref(), self.capacity)?;
        let (handles, output) = adapter.transfer();
        let offer = TransferOffer::new(handles);

        let proxy = Arc::new(ProxyTrack::new(self.track.clone(), output));
        let facade: Arc<dyn TrackLike> = proxy.clone();
        let started = TrackBridge::start(
            facade,
            offer.clone(),
            self.warp.inner.context.as_ref(),
            self.warp.deps(),
        )
        .await;
        let bridge = match started {
            Ok(bridge) => bridge,
            Err(e) => {
                match offer.reclaim() {
                    Some(handles) => match handles.restore_to(self.track.as_ref()) {
                        Ok(()) => debug!("Frames returned to track {}", self.track.id()),
                        Err(restore) => warn!("Frames of track {} lost: {}", self.track.id(), restore),
                    },
                    None => warn!("Worker kept the frames of track {}", self.track.id()),
                }
                return Err(e);
            }
        };

        let controller = ImpairmentController::spawn(
            kind,
            bridge.commands(),
            self.warp.inner.store.clone(),
            &self.warp.inner.bus,
        );

        Ok(ProcessedTrack {
            proxy,
            bridge,
            _controller: controller,
        })
    }

    /// Build the processed track, or hand back the original one on failure
    pub async fn build_or_passthrough(self) -> AlteredTrack {
        let original = self.track.clone();
        match self.build().await {
            Ok(processed) => AlteredTrack::Processed(processed),
            Err(e) => {
                warn!("Processing track {} failed, passing it through: {}", original.id(), e);
                AlteredTrack::Passthrough(original)
            }
        }
    }
}

/// A track running through a worker pipeline
#[derive(Debug)]
pub struct ProcessedTrack {
    proxy: Arc<ProxyTrack>,
    bridge: TrackBridge,
    _controller: ImpairmentController,
}

impl ProcessedTrack {
    /// Id of the processed track
    pub fn id(&self) -> &str {
        self.bridge.track_id()
    }

    /// The proxy the application uses in place of the original track
    pub fn proxy(&self) -> &Arc<ProxyTrack> {
        &self.proxy
    }

    /// The proxy as a plain track
    pub fn track(&self) -> Arc<dyn TrackLike> {
        self.proxy.clone()
    }

    /// The bridge driving the worker
    pub fn bridge(&self) -> &TrackBridge {
        &self.bridge
    }

    /// Current state
    pub fn state(&self) -> BridgeState {
        self.bridge.state()
    }

    /// End the track and its worker
    pub fn stop(&self) {
        self.bridge.stop();
    }
}

/// Outcome of [`TrackProcessorBuilder::build_or_passthrough`]
#[derive(Debug)]
pub enum AlteredTrack {
    /// Processing is running
    Processed(ProcessedTrack),
    /// Processing failed; the original track is used unchanged
    Passthrough(Arc<dyn TrackLike>),
}

impl AlteredTrack {
    /// The track the application should use
    pub fn track(&self) -> Arc<dyn TrackLike> {
        match self {
            AlteredTrack::Processed(processed) => processed.track(),
            AlteredTrack::Passthrough(original) => original.clone(),
        }
    }

    /// Whether processing is running
    pub fn is_processed(&self) -> bool {
        matches!(self, AlteredTrack::Processed(_))
    }

    /// The processed track, if any
    pub fn processed(&self) -> Option<&ProcessedTrack> {
        match self {
            AlteredTrack::Processed(processed) => Some(processed),
            AlteredTrack::Passthrough(_) => None,
        }
    }
}
