//! Typed message passing between execution contexts
//!
//! Contexts (page, content script, background worker, dashboard and the
//! per-track workers) never share memory. Every exchange is an [`Envelope`]
//! addressed by [`Topic`] and routed through a [`RoutingTable`] keyed by the
//! `(sender, receiver)` context pair, so relays are data instead of chained
//! conditionals.

use crate::error::{TrackWarpError, TrackWarpResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Control-channel topics understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    /// Hand frame source/sink ownership to a worker
    WorkerSetup,
    /// Initial impairment configuration for a track
    ImpairmentSetup,
    /// Live impairment reconfiguration
    ImpairmentChange,
    /// Start injecting a substitute source
    PlayerStart,
    /// Pause the substitute source
    PlayerPause,
    /// Resume the substitute source
    PlayerResume,
    /// Stop injecting the substitute source
    PlayerEnd,
    /// Source track muted
    TrackMuted,
    /// Source track unmuted
    TrackUnmuted,
    /// Source track ended
    TrackEnded,
    /// Begin periodic frame capture
    CaptureStart,
    /// Stop periodic frame capture
    CaptureStop,
    /// Status report flowing back to the UI
    Status,
}

impl Topic {
    /// Wire name of the topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::WorkerSetup => "WORKER_SETUP",
            Topic::ImpairmentSetup => "IMPAIRMENT_SETUP",
            Topic::ImpairmentChange => "IMPAIRMENT_CHANGE",
            Topic::PlayerStart => "PLAYER_START",
            Topic::PlayerPause => "PLAYER_PAUSE",
            Topic::PlayerResume => "PLAYER_RESUME",
            Topic::PlayerEnd => "PLAYER_END",
            Topic::TrackMuted => "TRACK_MUTED",
            Topic::TrackUnmuted => "TRACK_UNMUTED",
            Topic::TrackEnded => "TRACK_ENDED",
            Topic::CaptureStart => "CAPTURE_START",
            Topic::CaptureStop => "CAPTURE_STOP",
            Topic::Status => "STATUS",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution contexts taking part in the messaging fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    /// The conferencing page itself
    Page,
    /// Isolated content script
    Content,
    /// Background service worker
    Background,
    /// Iframe dashboard / settings UI
    Dashboard,
    /// Per-track dedicated worker
    Worker,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextKind::Page => "page",
            ContextKind::Content => "content",
            ContextKind::Background => "background",
            ContextKind::Dashboard => "dashboard",
            ContextKind::Worker => "worker",
        };
        f.write_str(name)
    }
}

/// How a message travels between two contexts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Delivered straight to the destination
    Direct,
    /// Relayed through the listed intermediate contexts, in order
    Relay(Vec<ContextKind>),
}

/// Routing table keyed by `(from, to)` context pairs
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<(ContextKind, ContextKind), Route>,
}

impl RoutingTable {
    /// Empty table; only same-context delivery resolves
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay layout of the browser extension: the page only talks to the
    /// content script, the dashboard only to the background worker, and the
    /// per-track workers only to the page that spawned them.
    pub fn extension_default() -> Self {
        use ContextKind::*;

        let mut table = Self::new();
        table.insert_symmetric(Page, Content, Route::Direct);
        table.insert_symmetric(Content, Background, Route::Direct);
        table.insert_symmetric(Background, Dashboard, Route::Direct);
        table.insert_symmetric(Page, Worker, Route::Direct);

        table.insert(Page, Background, Route::Relay(vec![Content]));
        table.insert(Background, Page, Route::Relay(vec![Content]));
        table.insert(Content, Dashboard, Route::Relay(vec![Background]));
        table.insert(Dashboard, Content, Route::Relay(vec![Background]));
        table.insert(Dashboard, Page, Route::Relay(vec![Background, Content]));
        table.insert(Page, Dashboard, Route::Relay(vec![Content, Background]));
        table.insert(Dashboard, Worker, Route::Relay(vec![Background, Content, Page]));
        table.insert(Worker, Dashboard, Route::Relay(vec![Page, Content, Background]));
        table
    }

    /// Insert or replace a route, returning the previous one
    pub fn insert(&mut self, from: ContextKind, to: ContextKind, route: Route) -> Option<Route> {
        self.routes.insert((from, to), route)
    }

    fn insert_symmetric(&mut self, a: ContextKind, b: ContextKind, route: Route) {
        self.routes.insert((a, b), route.clone());
        self.routes.insert((b, a), route);
    }

    /// Route registered for a context pair
    pub fn route(&self, from: ContextKind, to: ContextKind) -> Option<&Route> {
        self.routes.get(&(from, to))
    }

    /// Full hop list from `from` to `to`, destination included
    pub fn resolve(&self, from: ContextKind, to: ContextKind) -> TrackWarpResult<Vec<ContextKind>> {
        if from == to {
            return Ok(vec![to]);
        }
        match self.routes.get(&(from, to)) {
            Some(Route::Direct) => Ok(vec![to]),
            Some(Route::Relay(via)) => {
                let mut hops = via.clone();
                hops.push(to);
                Ok(hops)
            }
            None => Err(TrackWarpError::NoRoute {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    /// Number of registered routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A routed message
#[derive(Debug, Clone)]
pub struct Envelope<P> {
    /// Unique message id
    pub id: Uuid,
    /// Topic the message was sent on
    pub topic: Topic,
    /// Sending context
    pub from: ContextKind,
    /// Destination context
    pub to: ContextKind,
    /// Contexts traversed, destination last
    pub hops: Vec<ContextKind>,
    /// Message body
    pub payload: P,
}

/// Receiving end of an [`MessageBus::on`] registration
#[derive(Debug)]
pub struct Subscription<P> {
    context: ContextKind,
    topic: Topic,
    receiver: mpsc::UnboundedReceiver<Envelope<P>>,
}

impl<P> Subscription<P> {
    /// Wait for the next message
    pub async fn recv(&mut self) -> Option<Envelope<P>> {
        self.receiver.recv().await
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<Envelope<P>> {
        self.receiver.try_recv().ok()
    }

    /// Context this subscription listens in
    pub fn context(&self) -> ContextKind {
        self.context
    }

    /// Topic this subscription listens to
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

type SubscriberMap<P> = DashMap<(ContextKind, Topic), Vec<mpsc::UnboundedSender<Envelope<P>>>>;

struct BusInner<P> {
    routes: RwLock<RoutingTable>,
    subscribers: SubscriberMap<P>,
}

/// Typed pub/sub bus shared by every context of one process
///
/// Constructed once and handed to collaborators; clones share the same
/// routing table and subscriber registry.
pub struct MessageBus<P> {
    inner: Arc<BusInner<P>>,
}

impl<P> Clone for MessageBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> fmt::Debug for MessageBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("routes", &self.inner.routes.read().len())
            .field("subscriptions", &self.inner.subscribers.len())
            .finish()
    }
}

impl<P: Clone + Send + 'static> MessageBus<P> {
    /// Bus with an explicit routing table
    pub fn new(routes: RoutingTable) -> Self {
        Self {
            inner: Arc::new(BusInner {
                routes: RwLock::new(routes),
                subscribers: DashMap::new(),
            }),
        }
    }

    /// Bus with [`RoutingTable::extension_default`]
    pub fn with_default_routes() -> Self {
        Self::new(RoutingTable::extension_default())
    }

    /// Register a handler for `topic` in `context`
    pub fn on(&self, context: ContextKind, topic: Topic) -> Subscription<P> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .entry((context, topic))
            .or_default()
            .push(tx);
        debug!("Subscribed {} to {}", context, topic);
        Subscription {
            context,
            topic,
            receiver: rx,
        }
    }

    /// Route `payload` from `from` to every `topic` handler in `to`
    ///
    /// Returns the number of handlers reached. No handler is not an error;
    /// a missing route is.
    pub fn send(
        &self,
        from: ContextKind,
        to: ContextKind,
        topic: Topic,
        payload: P,
    ) -> TrackWarpResult<usize> {
        let hops = self.inner.routes.read().resolve(from, to)?;
        let envelope = Envelope {
            id: Uuid::new_v4(),
            topic,
            from,
            to,
            hops,
            payload,
        };

        let mut delivered = 0;
        if let Some(mut senders) = self.inner.subscribers.get_mut(&(to, topic)) {
            senders.retain(|tx| {
                if tx.send(envelope.clone()).is_ok() {
                    delivered += 1;
                    true
                } else {
                    false
                }
            });
        }

        if delivered == 0 {
            debug!("No handler for {} in {} (from {})", topic, to, from);
        } else {
            trace!(
                "Delivered {} {} -> {} via {:?} to {} handler(s)",
                topic,
                from,
                to,
                envelope.hops,
                delivered
            );
        }
        Ok(delivered)
    }

    /// Add or replace a route at runtime
    pub fn add_route(&self, from: ContextKind, to: ContextKind, route: Route) {
        self.inner.routes.write().insert(from, to, route);
    }

    /// Live handlers registered for `topic` in `context`
    pub fn subscriber_count(&self, context: ContextKind, topic: Topic) -> usize {
        self.inner
            .subscribers
            .get(&(context, topic))
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}
