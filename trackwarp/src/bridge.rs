//! Execution context bridge
//!
//! Each processed track runs its [`TrackWorker`] inside an isolated
//! [`ExecutionContext`]. The [`TrackBridge`] on the caller's side hands the
//! frame handles over, tracks the worker through its reports, follows the
//! source track's lifecycle and tears everything down when the track ends or
//! the worker fails.

use crate::config::GlobalConfig;
use crate::controller::ControlMessage;
use crate::event::{EventSender, TrackEvent};
use crate::worker::{TrackWorker, WorkerCommand, WorkerConfig, WorkerReport};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use trackwarp_core::{
    keys, ContextKind, MessageBus, SettingsStore, SettingsStoreExt, Topic, TrackWarpError,
    TrackWarpResult,
};
use trackwarp_media::{
    capture_session, CaptureSession, CaptureSettings, FrameReader, ImpairmentSettings, MediaKind,
    TrackLifecycleEvent, TrackLike, TransferOffer,
};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of a processed track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    /// Worker context not spawned yet
    Created,
    /// Handles sent, waiting for the first frames
    SetupPending,
    /// Frames flowing
    Running,
    /// Source muted
    Paused,
    /// Track ended and worker shut down
    Ended,
    /// Worker failed and the track was torn down
    Errored,
}

impl BridgeState {
    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Created => "created",
            BridgeState::SetupPending => "setup_pending",
            BridgeState::Running => "running",
            BridgeState::Paused => "paused",
            BridgeState::Ended => "ended",
            BridgeState::Errored => "errored",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeState::Ended | BridgeState::Errored)
    }

    /// Whether `next` is a legal successor
    pub fn can_transition_to(&self, next: BridgeState) -> bool {
        use BridgeState::*;
        match (self, next) {
            (Created, SetupPending) => true,
            (SetupPending, Running | Paused) => true,
            (Running, Paused) | (Paused, Running) => true,
            (current, Ended | Errored) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Terminator {
    Signal(Option<oneshot::Sender<()>>),
    Abort(AbortHandle),
}

/// Handle on a task running in an execution context
pub struct ContextHandle {
    label: String,
    done: watch::Receiver<bool>,
    terminator: Terminator,
}

impl ContextHandle {
    /// Label the task was spawned with
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the task has finished or was terminated
    pub fn is_finished(&self) -> bool {
        *self.done.borrow() || self.done.has_changed().is_err()
    }

    /// Wait up to `grace` for the task to finish on its own
    pub async fn wait(&mut self, grace: Duration) -> bool {
        if self.is_finished() {
            return true;
        }
        // A closed channel means the task is gone as well
        tokio::time::timeout(grace, self.done.wait_for(|finished| *finished))
            .await
            .is_ok()
    }

    /// Stop the task without waiting for it
    pub fn terminate(&mut self) {
        if self.is_finished() {
            return;
        }
        info!("Terminating context '{}'", self.label);
        match &mut self.terminator {
            Terminator::Signal(kill) => {
                if let Some(kill) = kill.take() {
                    let _ = kill.send(());
                }
            }
            Terminator::Abort(handle) => handle.abort(),
        }
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("label", &self.label)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Somewhere a worker can run in isolation
pub trait ExecutionContext: Send + Sync + fmt::Debug {
    /// Run `task` to completion or termination
    fn spawn(&self, label: &str, task: BoxFuture<'static, ()>) -> TrackWarpResult<ContextHandle>;
}

/// One OS thread with a single-threaded runtime per task
///
/// Dropping the [`ContextHandle`] detaches the thread; only
/// [`ContextHandle::terminate`] stops it early.
#[derive(Debug, Clone)]
pub struct DedicatedThreadContext {
    thread_prefix: String,
}

impl DedicatedThreadContext {
    /// Context naming its threads `trackwarp-<label>`
    pub fn new() -> Self {
        Self {
            thread_prefix: "trackwarp".to_string(),
        }
    }
}

impl Default for DedicatedThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for DedicatedThreadContext {
    fn spawn(&self, label: &str, task: BoxFuture<'static, ()>) -> TrackWarpResult<ContextHandle> {
        let setup_error = |reason: String| TrackWarpError::WorkerSetup {
            track_id: label.to_string(),
            reason,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| setup_error(format!("failed to build worker runtime: {}", e)))?;

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = watch::channel(false);
        let thread_label = label.to_string();

        std::thread::Builder::new()
            .name(format!("{}-{}", self.thread_prefix, label))
            .spawn(move || {
                runtime.block_on(async move {
                    tokio::select! {
                        _ = task => debug!("Context '{}' finished", thread_label),
                        Ok(()) = kill_rx => debug!("Context '{}' killed", thread_label),
                    }
                });
                // Tasks the worker spawned die with its runtime
                runtime.shutdown_background();
                let _ = done_tx.send(true);
            })
            .map_err(|e| setup_error(format!("failed to spawn worker thread: {}", e)))?;

        Ok(ContextHandle {
            label: label.to_string(),
            done: done_rx,
            terminator: Terminator::Signal(Some(kill_tx)),
        })
    }
}

/// Tasks on an existing runtime
#[derive(Debug, Clone)]
pub struct SharedRuntimeContext {
    handle: Handle,
}

impl SharedRuntimeContext {
    /// Context spawning onto `handle`
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Context spawning onto the current runtime
    pub fn current() -> TrackWarpResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| TrackWarpError::Initialization {
                reason: format!("no tokio runtime: {}", e),
            })
    }
}

impl ExecutionContext for SharedRuntimeContext {
    fn spawn(&self, label: &str, task: BoxFuture<'static, ()>) -> TrackWarpResult<ContextHandle> {
        let (done_tx, done_rx) = watch::channel(false);
        let join = self.handle.spawn(async move {
            task.await;
            let _ = done_tx.send(true);
        });
        Ok(ContextHandle {
            label: label.to_string(),
            done: done_rx,
            terminator: Terminator::Abort(join.abort_handle()),
        })
    }
}

/// Shared collaborators of every bridge
#[derive(Debug, Clone)]
pub struct BridgeDeps {
    /// Global configuration
    pub config: GlobalConfig,
    /// Status fields are written here
    pub store: Arc<dyn SettingsStore>,
    /// Status messages are published here
    pub bus: MessageBus<ControlMessage>,
    /// Track events are emitted here
    pub events: EventSender,
}

/// Writes every state change to the watch channel, the store, the bus and the event stream
struct StatusPublisher {
    track_id: String,
    state: watch::Sender<BridgeState>,
    deps: BridgeDeps,
}

impl StatusPublisher {
    fn current(&self) -> BridgeState {
        *self.state.borrow()
    }

    fn transition(&self, next: BridgeState) -> bool {
        let current = self.current();
        if current == next || !current.can_transition_to(next) {
            return false;
        }
        self.state.send_replace(next);
        info!("Track {}: {} -> {}", self.track_id, current, next);

        let key = keys::track_state(&self.track_id);
        if let Err(e) = self.deps.store.set_as(&key, &next) {
            warn!("Could not write {}: {}", key, e);
        }
        let status = ControlMessage::Status {
            track_id: self.track_id.clone(),
            state: next,
        };
        if let Err(e) = self
            .deps
            .bus
            .send(ContextKind::Page, ContextKind::Dashboard, Topic::Status, status)
        {
            debug!("Status of {} not published: {}", self.track_id, e);
        }
        self.deps.events.emit(TrackEvent::StateChanged {
            track_id: self.track_id.clone(),
            state: next,
        });
        true
    }

    fn impairment_status(&self, kind: MediaKind, active: bool) {
        let key = match kind {
            MediaKind::Video => keys::IMPAIRMENT_VIDEO_ACTIVE,
            MediaKind::Audio => keys::IMPAIRMENT_AUDIO_ACTIVE,
        };
        if let Err(e) = self.deps.store.set_as(key, &active) {
            warn!("Could not write {}: {}", key, e);
        }
        self.deps.events.emit(TrackEvent::ImpairmentApplied {
            track_id: self.track_id.clone(),
            kind,
            active,
        });
    }
}

enum Wake {
    Report(Option<WorkerReport>),
    Lifecycle(Result<TrackLifecycleEvent, broadcast::error::RecvError>),
}

enum Flow {
    Continue,
    Exit,
}

struct Supervisor {
    track: Arc<dyn TrackLike>,
    commands: mpsc::Sender<WorkerCommand>,
    context: ContextHandle,
    status: StatusPublisher,
    grace: Duration,
    acked: bool,
    muted: bool,
}

impl Supervisor {
    async fn run(
        mut self,
        mut reports: mpsc::UnboundedReceiver<WorkerReport>,
        mut lifecycle: broadcast::Receiver<TrackLifecycleEvent>,
    ) {
        let mut reports_open = true;
        loop {
            let wake = tokio::select! {
                report = reports.recv(), if reports_open => Wake::Report(report),
                event = lifecycle.recv() => Wake::Lifecycle(event),
            };

            let flow = match wake {
                Wake::Report(Some(report)) => self.on_report(report),
                Wake::Report(None) => {
                    reports_open = false;
                    self.on_failure("worker exited without a report".to_string())
                }
                Wake::Lifecycle(Ok(TrackLifecycleEvent::Muted)) => self.on_mute(true).await,
                Wake::Lifecycle(Ok(TrackLifecycleEvent::Unmuted)) => self.on_mute(false).await,
                Wake::Lifecycle(Ok(TrackLifecycleEvent::Ended))
                | Wake::Lifecycle(Err(broadcast::error::RecvError::Closed)) => self.on_ended().await,
                Wake::Lifecycle(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("Missed {} lifecycle event(s) of {}", skipped, self.status.track_id);
                    let muted = self.track.muted();
                    self.on_mute(muted).await
                }
            };

            if let Flow::Exit = flow {
                break;
            }
        }
        debug!("Supervisor of {} exited", self.status.track_id);
    }

    fn on_report(&mut self, report: WorkerReport) -> Flow {
        let track_id = self.status.track_id.clone();
        match report {
            WorkerReport::FrameAck { frame } => {
                debug!("Track {} acknowledged frame {}", track_id, frame);
                self.acked = true;
                self.refresh();
            }
            WorkerReport::ImpairmentStatus { kind, active } => {
                self.status.impairment_status(kind, active);
            }
            WorkerReport::ImpairmentRejected { reason } => {
                self.status
                    .deps
                    .events
                    .emit(TrackEvent::ImpairmentRejected { track_id, reason });
            }
            WorkerReport::StageError { stage, reason } => {
                self.status.deps.events.emit(TrackEvent::StageError {
                    track_id,
                    stage,
                    reason,
                });
            }
            WorkerReport::Failed { reason } => return self.on_failure(reason),
            WorkerReport::Stopped => {
                info!("Pipeline of {} stopped", track_id);
                self.finish_ended();
                return Flow::Exit;
            }
            WorkerReport::SetupComplete | WorkerReport::SetupFailed { .. } => {
                debug!("Late setup report from {}: {:?}", track_id, report);
            }
        }
        Flow::Continue
    }

    fn on_failure(&mut self, reason: String) -> Flow {
        if self.muted {
            warn!(
                "Worker of muted track {} failed, ignoring: {}",
                self.status.track_id, reason
            );
            return Flow::Continue;
        }

        error!("Worker of track {} failed: {}", self.status.track_id, reason);
        if self.status.transition(BridgeState::Errored) {
            self.status.deps.events.emit(TrackEvent::Errored {
                track_id: self.status.track_id.clone(),
                reason,
                at: Utc::now(),
            });
        }
        self.track.stop();
        self.context.terminate();
        Flow::Exit
    }

    async fn on_mute(&mut self, muted: bool) -> Flow {
        if self.muted == muted {
            return Flow::Continue;
        }
        self.muted = muted;
        let command = if muted {
            WorkerCommand::SourceMuted
        } else {
            WorkerCommand::SourceUnmuted
        };
        if self.commands.send(command).await.is_err() {
            debug!("Worker of {} gone, mute change not delivered", self.status.track_id);
        }
        self.refresh();
        Flow::Continue
    }

    async fn on_ended(&mut self) -> Flow {
        info!("Track {} ended, shutting down its worker", self.status.track_id);
        let shutdown = WorkerCommand::Shutdown { grace: self.grace };
        if self.commands.send(shutdown).await.is_ok() && !self.context.wait(self.grace).await {
            info!(
                "Worker of {} did not stop within {:?}",
                self.status.track_id, self.grace
            );
        }
        self.context.terminate();
        self.finish_ended();
        Flow::Exit
    }

    fn finish_ended(&mut self) {
        if self.status.transition(BridgeState::Ended) {
            self.status.deps.events.emit(TrackEvent::Ended {
                track_id: self.status.track_id.clone(),
            });
        }
    }

    fn refresh(&self) {
        let next = match (self.acked, self.muted) {
            (false, _) => BridgeState::SetupPending,
            (true, false) => BridgeState::Running,
            (true, true) => BridgeState::Paused,
        };
        self.status.transition(next);
    }
}

/// Caller-side half of a processed track
#[derive(Debug)]
pub struct TrackBridge {
    track_id: String,
    kind: MediaKind,
    track: Arc<dyn TrackLike>,
    commands: mpsc::Sender<WorkerCommand>,
    state: watch::Receiver<BridgeState>,
    supervisor: JoinHandle<()>,
}

impl TrackBridge {
    /// Spawn a worker for `track` in `context` and offer it the handles
    ///
    /// `track` is the track the application sees; its lifecycle drives the
    /// bridge and it is stopped if the worker fails. Returns once the worker
    /// claimed the handles. On error the worker is gone and, unless it had
    /// already claimed them, the handles are still on `offer`.
    pub async fn start(
        track: Arc<dyn TrackLike>,
        offer: TransferOffer,
        context: &dyn ExecutionContext,
        deps: BridgeDeps,
    ) -> TrackWarpResult<Self> {
        let track_id = track.id().to_string();
        let kind = track.kind();
        let config = deps.config.clone();

        // Subscribe before anything can happen to the track
        let lifecycle = track.subscribe();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let worker = TrackWorker::new(
            WorkerConfig {
                track_id: track_id.clone(),
                kind,
                setup_ack_frame: config.setup_ack_frame,
                latency: config.latency,
                rng_seed: config.rng_seed,
            },
            report_tx,
        );

        let (state_tx, state_rx) = watch::channel(BridgeState::Created);
        let status = StatusPublisher {
            track_id: track_id.clone(),
            state: state_tx,
            deps,
        };

        let mut context_handle = match context.spawn(&track_id, worker.run(command_rx).boxed()) {
            Ok(handle) => handle,
            Err(e) => {
                status.transition(BridgeState::Errored);
                return Err(e);
            }
        };
        status.transition(BridgeState::SetupPending);

        let setup = async {
            command_tx
                .send(WorkerCommand::Setup { offer })
                .await
                .map_err(|_| TrackWarpError::WorkerTerminated {
                    track_id: track_id.clone(),
                    reason: "worker exited before setup".to_string(),
                })?;

            let timeout = config.setup_timeout();
            match tokio::time::timeout(timeout, report_rx.recv()).await {
                Ok(Some(WorkerReport::SetupComplete)) => Ok(()),
                Ok(Some(WorkerReport::SetupFailed { reason })) => Err(TrackWarpError::WorkerSetup {
                    track_id: track_id.clone(),
                    reason,
                }),
                Ok(Some(other)) => Err(TrackWarpError::WorkerSetup {
                    track_id: track_id.clone(),
                    reason: format!("unexpected report {:?}", other),
                }),
                Ok(None) => Err(TrackWarpError::WorkerTerminated {
                    track_id: track_id.clone(),
                    reason: "worker exited during setup".to_string(),
                }),
                Err(_) => Err(TrackWarpError::Timeout { duration: timeout }),
            }
        };

        if let Err(e) = setup.await {
            warn!("Setup of track {} failed: {}", track_id, e);
            context_handle.terminate();
            status.transition(BridgeState::Errored);
            return Err(e);
        }

        info!("Worker of {} track {} set up", kind, track_id);
        status.deps.events.emit(TrackEvent::SetupComplete {
            track_id: track_id.clone(),
        });

        let mut supervisor = Supervisor {
            track: track.clone(),
            commands: command_tx.clone(),
            context: context_handle,
            status,
            grace: config.teardown_grace(),
            acked: false,
            muted: false,
        };
        if track.muted() {
            supervisor.on_mute(true).await;
        }
        let supervisor = tokio::spawn(supervisor.run(report_rx, lifecycle));

        Ok(Self {
            track_id,
            kind,
            track,
            commands: command_tx,
            state: state_rx,
            supervisor,
        })
    }

    /// Id of the processed track
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Media kind of the processed track
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Current state
    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> BridgeState
    where
        F: FnMut(BridgeState) -> bool,
    {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| predicate(*s)).await.map(|s| *s);
        reached.unwrap_or_else(|_| *state.borrow())
    }

    /// Wait until the bridge ended or errored
    pub async fn wait_terminal(&self) -> BridgeState {
        self.wait_for_state(|s| s.is_terminal()).await
    }

    /// Sender for raw worker commands
    pub fn commands(&self) -> mpsc::Sender<WorkerCommand> {
        self.commands.clone()
    }

    /// Deliver a command to the worker
    pub async fn send(&self, command: WorkerCommand) -> TrackWarpResult<()> {
        let topic = command.topic();
        self.commands
            .send(command)
            .await
            .map_err(|_| TrackWarpError::channel_closed(format!("{} -> worker {}", topic, self.track_id)))
    }

    /// Swap impairment settings
    pub async fn configure_impairment(&self, settings: ImpairmentSettings) -> TrackWarpResult<()> {
        self.send(WorkerCommand::ImpairmentChange(settings)).await
    }

    /// Substitute live frames with frames from `source`
    pub async fn start_player(&self, source: FrameReader) -> TrackWarpResult<()> {
        self.send(WorkerCommand::PlayerStart { source }).await
    }

    /// Pass live frames again, keeping the substitute
    pub async fn pause_player(&self) -> TrackWarpResult<()> {
        self.send(WorkerCommand::PlayerPause).await
    }

    /// Substitute again after a pause
    pub async fn resume_player(&self) -> TrackWarpResult<()> {
        self.send(WorkerCommand::PlayerResume).await
    }

    /// Drop the substitute
    pub async fn end_player(&self) -> TrackWarpResult<()> {
        self.send(WorkerCommand::PlayerEnd).await
    }

    /// Begin capturing processed frames
    pub async fn start_capture(&self, settings: CaptureSettings) -> TrackWarpResult<CaptureSession> {
        let (tap, session) = capture_session(settings);
        self.send(WorkerCommand::CaptureStart { tap }).await?;
        Ok(session)
    }

    /// Remove the capture tap
    pub async fn stop_capture(&self) -> TrackWarpResult<()> {
        self.send(WorkerCommand::CaptureStop).await
    }

    /// End the processed track
    pub fn stop(&self) {
        self.track.stop();
    }

    /// Whether the supervisor has exited
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use BridgeState::*;
        assert!(Created.can_transition_to(SetupPending));
        assert!(SetupPending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Errored));
        assert!(!Created.can_transition_to(Running));
        assert!(!Ended.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Running));
        assert_eq!(serde_json::to_string(&SetupPending).unwrap(), "\"setup_pending\"");
    }

    #[tokio::test]
    async fn test_dedicated_thread_runs_and_terminates() {
        let context = DedicatedThreadContext::new();

        let mut finished = context.spawn("quick", async {}.boxed()).unwrap();
        assert!(finished.wait(Duration::from_secs(5)).await);

        let mut stuck = context
            .spawn("stuck", futures::future::pending::<()>().boxed())
            .unwrap();
        assert!(!stuck.wait(Duration::from_millis(20)).await);
        stuck.terminate();
        assert!(stuck.wait(Duration::from_secs(5)).await);
        assert!(stuck.is_finished());
    }

    #[tokio::test]
    async fn test_shared_runtime_abort() {
        let context = SharedRuntimeContext::current().unwrap();
        let mut stuck = context
            .spawn("stuck", futures::future::pending::<()>().boxed())
            .unwrap();
        assert!(!stuck.is_finished());
        stuck.terminate();
        assert!(stuck.wait(Duration::from_secs(1)).await);
    }
}
