//! Per-track worker
//!
//! A [`TrackWorker`] owns one [`TransformManager`] and the frame handles of a
//! single track. It serves [`WorkerCommand`]s from its bridge and answers with
//! [`WorkerReport`]s; nothing else is shared between the two.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use trackwarp_core::Topic;
use trackwarp_media::{
    AudioImpairmentStage, CaptureTap, FrameReader, ImpairmentProfile, ImpairmentSettings,
    LatencyPolicy, MediaError, MediaKind, MediaResult, StageCommand, StagePosition,
    SubstituteStage, TransferHandles, TransferOffer, TransformManager, TransformStage,
    VideoImpairmentStage, CAPTURE_STAGE, IMPAIRMENT_STAGE, SUBSTITUTE_STAGE,
};

/// Commands a bridge sends to its worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Claim the offered frame handles and start pumping
    ///
    /// Rejected handles are left on offer.
    Setup {
        /// Source and sink of the track
        offer: TransferOffer,
    },
    /// Initial impairment settings
    ImpairmentSetup(ImpairmentSettings),
    /// Live impairment change
    ImpairmentChange(ImpairmentSettings),
    /// Replace live frames with frames from `source`
    PlayerStart {
        /// Substitute frames
        source: FrameReader,
    },
    /// Pass live frames while keeping the substitute
    PlayerPause,
    /// Substitute again after a pause
    PlayerResume,
    /// Drop the substitute
    PlayerEnd,
    /// Insert a capture tap at the end of the pipeline
    CaptureStart {
        /// Tap feeding a capture session
        tap: CaptureTap,
    },
    /// Remove the capture tap
    CaptureStop,
    /// The source track was muted
    SourceMuted,
    /// The source track was unmuted
    SourceUnmuted,
    /// Drain and exit
    Shutdown {
        /// How long the pipeline may take to finish
        grace: Duration,
    },
}

impl WorkerCommand {
    /// Message topic this command corresponds to
    pub fn topic(&self) -> Topic {
        match self {
            WorkerCommand::Setup { .. } => Topic::WorkerSetup,
            WorkerCommand::ImpairmentSetup(_) => Topic::ImpairmentSetup,
            WorkerCommand::ImpairmentChange(_) => Topic::ImpairmentChange,
            WorkerCommand::PlayerStart { .. } => Topic::PlayerStart,
            WorkerCommand::PlayerPause => Topic::PlayerPause,
            WorkerCommand::PlayerResume => Topic::PlayerResume,
            WorkerCommand::PlayerEnd => Topic::PlayerEnd,
            WorkerCommand::CaptureStart { .. } => Topic::CaptureStart,
            WorkerCommand::CaptureStop => Topic::CaptureStop,
            WorkerCommand::SourceMuted => Topic::TrackMuted,
            WorkerCommand::SourceUnmuted => Topic::TrackUnmuted,
            WorkerCommand::Shutdown { .. } => Topic::TrackEnded,
        }
    }
}

/// Reports a worker sends back to its bridge
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    /// Handles accepted, pipeline running
    SetupComplete,
    /// Handles rejected
    SetupFailed {
        /// Why
        reason: String,
    },
    /// The pipeline handled frame number `frame`
    FrameAck {
        /// Zero-based frame index
        frame: u64,
    },
    /// Impairment state after a settings change or mute transition
    ImpairmentStatus {
        /// Media kind of the track
        kind: MediaKind,
        /// Whether frames are impaired now
        active: bool,
    },
    /// Impairment settings rejected, previous ones kept
    ImpairmentRejected {
        /// Why
        reason: String,
    },
    /// A stage command failed
    StageError {
        /// Stage key
        stage: String,
        /// Why
        reason: String,
    },
    /// The pipeline failed
    Failed {
        /// Why
        reason: String,
    },
    /// The pipeline finished
    Stopped,
}

/// Worker parameters
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Track being processed
    pub track_id: String,
    /// Media kind of the track
    pub kind: MediaKind,
    /// Frame index acknowledged to the bridge
    pub setup_ack_frame: u64,
    /// Latency policy for the impairment stage
    pub latency: LatencyPolicy,
    /// Seed for stage randomness
    pub rng_seed: Option<u64>,
}

enum Wake {
    Command(Option<WorkerCommand>),
    PipelineDone(Result<MediaResult<()>, JoinError>),
}

/// Hosts one track's transform pipeline
#[derive(Debug)]
pub struct TrackWorker {
    config: WorkerConfig,
    manager: TransformManager,
    reports: mpsc::UnboundedSender<WorkerReport>,
    pipeline: Option<JoinHandle<MediaResult<()>>>,
    settings: ImpairmentSettings,
    muted: bool,
}

impl TrackWorker {
    /// New worker reporting into `reports`
    pub fn new(config: WorkerConfig, reports: mpsc::UnboundedSender<WorkerReport>) -> Self {
        Self {
            config,
            manager: TransformManager::new(),
            reports,
            pipeline: None,
            settings: ImpairmentSettings::disabled(),
            muted: false,
        }
    }

    /// The worker's pipeline
    pub fn manager(&self) -> &TransformManager {
        &self.manager
    }

    /// Serve commands until shutdown, channel close or pipeline end
    pub async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        info!("Worker for {} track {} started", self.config.kind, self.config.track_id);

        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                result = pipeline_finished(&mut self.pipeline) => Wake::PipelineDone(result),
            };

            match wake {
                Wake::Command(Some(WorkerCommand::Shutdown { grace })) => {
                    self.shutdown(grace).await;
                    break;
                }
                Wake::Command(Some(command)) => self.handle(command).await,
                Wake::Command(None) => {
                    debug!("Command channel of {} closed", self.config.track_id);
                    self.shutdown(Duration::ZERO).await;
                    break;
                }
                Wake::PipelineDone(result) => {
                    self.pipeline = None;
                    self.report_pipeline_end(result);
                    break;
                }
            }
        }

        info!("Worker for track {} exited", self.config.track_id);
    }

    async fn handle(&mut self, command: WorkerCommand) {
        debug!("Worker {} <- {}", self.config.track_id, command.topic());
        match command {
            WorkerCommand::Setup { offer } => self.setup(offer),
            WorkerCommand::ImpairmentSetup(settings) | WorkerCommand::ImpairmentChange(settings) => {
                self.apply_impairment(settings).await
            }
            WorkerCommand::PlayerStart { source } => {
                let stage = Box::new(SubstituteStage::new(source));
                self.manager.add(SUBSTITUTE_STAGE, stage, Some(StagePosition::First));
            }
            WorkerCommand::PlayerPause => self.stage_command(SUBSTITUTE_STAGE, StageCommand::Pause).await,
            WorkerCommand::PlayerResume => self.stage_command(SUBSTITUTE_STAGE, StageCommand::Resume).await,
            WorkerCommand::PlayerEnd => self.remove_stage(SUBSTITUTE_STAGE),
            WorkerCommand::CaptureStart { tap } => {
                self.manager.add(CAPTURE_STAGE, Box::new(tap), Some(StagePosition::End));
            }
            WorkerCommand::CaptureStop => self.remove_stage(CAPTURE_STAGE),
            WorkerCommand::SourceMuted => {
                self.muted = true;
                self.sync_impairment().await;
            }
            WorkerCommand::SourceUnmuted => {
                self.muted = false;
                self.sync_impairment().await;
            }
            WorkerCommand::Shutdown { .. } => {}
        }
    }

    fn setup(&mut self, offer: TransferOffer) {
        let running = self.pipeline.is_some();
        let kind = self.config.kind;
        let claimed = offer.claim(|handles| {
            if running {
                Err(MediaError::InvalidState {
                    message: "worker already set up".to_string(),
                })
            } else if handles.sink.is_closed() {
                Err(MediaError::ChannelClosed {
                    channel: format!("{} frame sink", kind),
                })
            } else if handles.source.kind() != kind {
                Err(MediaError::InvalidMediaType {
                    expected: kind.to_string(),
                    actual: handles.source.kind().to_string(),
                })
            } else {
                Ok(())
            }
        });
        let TransferHandles { source, sink } = match claimed {
            Ok(handles) => handles,
            Err(e) => {
                warn!("Setup of track {} rejected: {}", self.config.track_id, e);
                self.report(WorkerReport::SetupFailed { reason: e.to_string() });
                return;
            }
        };

        let stage = self.impairment_stage();
        self.manager.add(IMPAIRMENT_STAGE, stage, None);

        let manager = self.manager.clone();
        let reports = self.reports.clone();
        let ack_frame = self.config.setup_ack_frame;
        self.pipeline = Some(tokio::spawn(async move {
            manager
                .run(source, sink, move |index| {
                    if index == ack_frame {
                        let _ = reports.send(WorkerReport::FrameAck { frame: index });
                    }
                })
                .await
        }));

        info!("Pipeline of track {} running", self.config.track_id);
        self.report(WorkerReport::SetupComplete);
        if self.settings.is_active() {
            self.report(WorkerReport::ImpairmentStatus {
                kind: self.config.kind,
                active: !self.muted,
            });
        }
    }

    fn impairment_stage(&self) -> Box<dyn TransformStage> {
        let latency = self.config.latency;
        let start = self.settings.is_active() && !self.muted;
        // Settings held from before setup were validated when they arrived
        match self.config.kind {
            MediaKind::Video => {
                let mut stage = VideoImpairmentStage::new(latency);
                if let Some(seed) = self.config.rng_seed {
                    stage = stage.with_seed(seed);
                }
                if let Err(e) = stage.apply(self.settings) {
                    warn!("Held video impairment settings rejected: {}", e);
                } else if start {
                    stage.start();
                }
                Box::new(stage)
            }
            MediaKind::Audio => {
                let mut stage = AudioImpairmentStage::new(latency);
                if let Some(seed) = self.config.rng_seed {
                    stage = stage.with_seed(seed);
                }
                if let Err(e) = stage.apply(self.settings) {
                    warn!("Held audio impairment settings rejected: {}", e);
                } else if start {
                    stage.start();
                }
                Box::new(stage)
            }
        }
    }

    async fn apply_impairment(&mut self, settings: ImpairmentSettings) {
        if !self.manager.has(IMPAIRMENT_STAGE) {
            match ImpairmentProfile::resolve(self.config.kind, &settings) {
                Ok(_) => {
                    debug!("Holding impairment settings until setup of {}", self.config.track_id);
                    self.settings = settings;
                }
                Err(e) => self.reject_impairment(e.to_string()),
            }
            return;
        }

        let command = StageCommand::Configure(settings);
        if let Err(e) = self.manager.command(IMPAIRMENT_STAGE, command).await {
            self.reject_impairment(e.to_string());
            return;
        }
        self.settings = settings;
        self.sync_impairment().await;
    }

    async fn sync_impairment(&mut self) {
        if !self.manager.has(IMPAIRMENT_STAGE) {
            return;
        }
        let active = self.settings.is_active() && !self.muted;
        let command = if active { StageCommand::Start } else { StageCommand::Stop };
        if let Err(e) = self.manager.command(IMPAIRMENT_STAGE, command).await {
            self.report_stage_error(IMPAIRMENT_STAGE, e.to_string());
            return;
        }
        self.report(WorkerReport::ImpairmentStatus {
            kind: self.config.kind,
            active,
        });
    }

    async fn stage_command(&mut self, key: &str, command: StageCommand) {
        if let Err(e) = self.manager.command(key, command).await {
            self.report_stage_error(key, e.to_string());
        }
    }

    fn remove_stage(&mut self, key: &str) {
        if !self.manager.remove(key) {
            self.report_stage_error(key, format!("no '{}' stage", key));
        }
    }

    async fn shutdown(&mut self, grace: Duration) {
        let Some(mut pipeline) = self.pipeline.take() else {
            self.report(WorkerReport::Stopped);
            return;
        };

        match tokio::time::timeout(grace, &mut pipeline).await {
            Ok(result) => self.report_pipeline_end(result),
            Err(_) => {
                warn!(
                    "Pipeline of track {} still busy after {:?}, aborting",
                    self.config.track_id, grace
                );
                pipeline.abort();
                if let Err(e) = self.manager.flush().await {
                    debug!("Flush after abort failed: {}", e);
                }
                self.report(WorkerReport::Stopped);
            }
        }
    }

    fn report_pipeline_end(&self, result: Result<MediaResult<()>, JoinError>) {
        match result {
            Ok(Ok(())) => self.report(WorkerReport::Stopped),
            Ok(Err(e)) => {
                error!("Pipeline of track {} failed: {}", self.config.track_id, e);
                self.report(WorkerReport::Failed {
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                error!("Pipeline task of track {} died: {}", self.config.track_id, e);
                self.report(WorkerReport::Failed {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn reject_impairment(&self, reason: String) {
        warn!(
            "Impairment settings for track {} rejected, keeping previous: {}",
            self.config.track_id, reason
        );
        self.report(WorkerReport::ImpairmentRejected { reason });
    }

    fn report_stage_error(&self, stage: &str, reason: String) {
        warn!("Stage '{}' of track {}: {}", stage, self.config.track_id, reason);
        self.report(WorkerReport::StageError {
            stage: stage.to_string(),
            reason,
        });
    }

    fn report(&self, report: WorkerReport) {
        if self.reports.send(report).is_err() {
            debug!("Bridge of track {} gone, report dropped", self.config.track_id);
        }
    }
}

impl Drop for TrackWorker {
    fn drop(&mut self) {
        // A terminated worker must not leave its pipeline behind
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
    }
}

async fn pipeline_finished(
    pipeline: &mut Option<JoinHandle<MediaResult<()>>>,
) -> Result<MediaResult<()>, JoinError> {
    match pipeline {
        Some(handle) => handle.await,
        None => futures::future::pending().await,
    }
}
