//! The Controller actor.
//!
//! Owns the run state machine, the canonical [`ParameterSet`] and the camera
//! slot. Everything else talks to it through a cloneable [`ControllerHandle`];
//! each request carries a oneshot for the reply, so requests are processed one
//! at a time in arrival order.
//!
//! ```text
//! Idle -> Running -> Stopping -> Idle
//!         Running -> Faulted -> Stopping -> Idle
//! ```
//!
//! Every way back to `Idle` goes through [`Controller::finish_run`], which
//! stops acquisition, drains the relay, flushes the file queue and joins the
//! file worker before the summary is published.

use crate::app_config::PipelineConfig;
use crate::camera::camera_entity::{CameraEntity, CameraState};
use crate::camera_config::HardwareLimits;
use crate::config_loader::MasterConfig;
use crate::core::capture_source::HardwareCamera;
use crate::core::parameters::{CameraParameters, ParameterSet, ParameterUpdate};
use crate::core::run::{AcquisitionRun, RunCounters, RunId, RunOutcome, RunState, RunSummary, ShotPlan};
use crate::core::status::{StatusEvent, StatusKind, TemperatureReading, WorkerKind};
use crate::errors::{ConfigurationError, ControllerError, ProtocolError, UpdateRejection};
use crate::storage::{SinkOpener, SinkTarget};
use crate::workers::acquisition_worker::{self, AcquisitionChannels, AcquisitionHandle, AcquisitionSettings};
use crate::workers::file_worker::{self, FileWorkerReport, FileWorkerSettings};
use crate::workers::frame_relay::{self, RelayReport, RelayStats};
use crate::workers::{AcquisitionCommand, FileCommand};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Everything the Controller needs besides the camera and the sink opener.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub pipeline: PipelineConfig,
    pub limits: HardwareLimits,
    pub initial_parameters: CameraParameters,
}

impl ControllerConfig {
    pub fn from_master(config: &MasterConfig) -> Self {
        ControllerConfig {
            pipeline: config.pipeline.clone(),
            limits: config.camera.limits.clone(),
            initial_parameters: config.camera.defaults.clone(),
        }
    }
}

/// Parameters and destination of a run to start.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub parameters: CameraParameters,
    pub sink_target: SinkTarget,
    /// End the run on its own after this many frames.
    pub max_frames: Option<u64>,
    pub shot_plan: ShotPlan,
}

impl RunRequest {
    pub fn new(parameters: CameraParameters, sink_target: SinkTarget) -> Self {
        RunRequest {
            parameters,
            sink_target,
            max_frames: None,
            shot_plan: ShotPlan::default(),
        }
    }

    pub fn with_max_frames(mut self, max_frames: u64) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    pub fn with_shot_plan(mut self, shot_plan: ShotPlan) -> Self {
        self.shot_plan = shot_plan;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAck {
    pub version: u64,
    /// False when no run was active and only the canonical set changed.
    pub forwarded_to_worker: bool,
}

#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub state: RunState,
    pub active_run: Option<RunId>,
    pub parameters: Arc<ParameterSet>,
    pub counters: RunCounters,
    pub last_summary: Option<RunSummary>,
    pub temperature: Option<TemperatureReading>,
    pub camera: CameraState,
}

#[derive(Debug)]
enum ControllerRequest {
    StartRun {
        request: RunRequest,
        response: oneshot::Sender<Result<RunId, ControllerError>>,
    },
    StopRun {
        response: oneshot::Sender<Option<RunSummary>>,
    },
    ApplyUpdate {
        update: ParameterUpdate,
        response: oneshot::Sender<Result<UpdateAck, UpdateRejection>>,
    },
    Snapshot {
        response: oneshot::Sender<ControllerSnapshot>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

impl ControllerRequest {
    fn start_run(request: RunRequest) -> (Self, oneshot::Receiver<Result<RunId, ControllerError>>) {
        let (response, rx) = oneshot::channel();
        (ControllerRequest::StartRun { request, response }, rx)
    }

    fn stop_run() -> (Self, oneshot::Receiver<Option<RunSummary>>) {
        let (response, rx) = oneshot::channel();
        (ControllerRequest::StopRun { response }, rx)
    }

    fn apply_update(update: ParameterUpdate) -> (Self, oneshot::Receiver<Result<UpdateAck, UpdateRejection>>) {
        let (response, rx) = oneshot::channel();
        (ControllerRequest::ApplyUpdate { update, response }, rx)
    }

    fn snapshot() -> (Self, oneshot::Receiver<ControllerSnapshot>) {
        let (response, rx) = oneshot::channel();
        (ControllerRequest::Snapshot { response }, rx)
    }

    fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (response, rx) = oneshot::channel();
        (ControllerRequest::Shutdown { response }, rx)
    }
}

/// Cloneable client side of the Controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    requests: mpsc::Sender<ControllerRequest>,
    runs: watch::Receiver<Option<RunSummary>>,
    temperature: watch::Receiver<Option<TemperatureReading>>,
}

impl ControllerHandle {
    async fn call<T>(&self, request: ControllerRequest, reply: oneshot::Receiver<T>) -> Result<T, ControllerError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ControllerError::ControllerUnavailable)?;
        reply.await.map_err(|_| ControllerError::ControllerUnavailable)
    }

    pub async fn start_run(&self, parameters: CameraParameters, sink_target: SinkTarget) -> Result<RunId, ControllerError> {
        self.start_run_with(RunRequest::new(parameters, sink_target)).await
    }

    pub async fn start_run_with(&self, request: RunRequest) -> Result<RunId, ControllerError> {
        let (request, reply) = ControllerRequest::start_run(request);
        self.call(request, reply).await?
    }

    /// Returns once the run is fully drained. `None` when nothing was running.
    pub async fn stop_run(&self) -> Result<Option<RunSummary>, ControllerError> {
        let (request, reply) = ControllerRequest::stop_run();
        self.call(request, reply).await
    }

    pub async fn apply_parameter_update(&self, update: ParameterUpdate) -> Result<UpdateAck, UpdateRejection> {
        let (request, reply) = ControllerRequest::apply_update(update);
        match self.call(request, reply).await {
            Ok(result) => result,
            Err(_) => Err(UpdateRejection::ControllerUnavailable),
        }
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot, ControllerError> {
        let (request, reply) = ControllerRequest::snapshot();
        self.call(request, reply).await
    }

    pub async fn current_version(&self) -> Result<u64, ControllerError> {
        Ok(self.snapshot().await?.parameters.version)
    }

    /// Latest finished run; changes every time a run reaches `Idle`.
    pub fn subscribe_runs(&self) -> watch::Receiver<Option<RunSummary>> {
        self.runs.clone()
    }

    pub fn subscribe_temperature(&self) -> watch::Receiver<Option<TemperatureReading>> {
        self.temperature.clone()
    }

    /// Waits until the summary of `run` is published.
    pub async fn wait_for_summary(&self, run: RunId) -> Result<RunSummary, ControllerError> {
        let mut runs = self.subscribe_runs();
        loop {
            if let Some(summary) = runs.borrow_and_update().as_ref() {
                if summary.run_id == run {
                    return Ok(summary.clone());
                }
            }
            runs.changed().await.map_err(|_| ControllerError::ControllerUnavailable)?;
        }
    }

    /// Stops any active run, then ends the actor.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let (request, reply) = ControllerRequest::shutdown();
        self.call(request, reply).await
    }
}

/// Per-run resources held by the Controller while the run is active.
struct ActiveRun {
    run: AcquisitionRun,
    commands: mpsc::Sender<AcquisitionCommand>,
    acquisition: Option<AcquisitionHandle>,
    relay: Option<JoinHandle<RelayReport>>,
    relay_stats: Arc<RelayStats>,
    file_queue: Option<mpsc::Sender<FileCommand>>,
    file_worker: Option<JoinHandle<FileWorkerReport>>,
    counters: RunCounters,
    fault: Option<String>,
    capture_complete: bool,
    acquisition_exited: bool,
}

impl ActiveRun {
    fn needs_drain(&self) -> bool {
        self.fault.is_some() || self.capture_complete || self.acquisition_exited
    }

    fn transition(&mut self, next: RunState) -> bool {
        if !self.run.state.can_transition_to(next) {
            error!("Refusing transition of {} from {} to {}", self.run.id, self.run.state, next);
            return false;
        }
        info!("🔄 {} {} -> {}", self.run.id, self.run.state, next);
        self.run.state = next;
        true
    }

    /// `Running -> Faulted`; the first reason is kept.
    fn fail(&mut self, reason: String) {
        if self.run.state == RunState::Running {
            self.transition(RunState::Faulted);
        }
        self.fault.get_or_insert(reason);
    }

    fn on_acquisition_exit(&mut self) {
        self.acquisition_exited = true;
        if !self.capture_complete && self.fault.is_none() && self.run.state == RunState::Running {
            warn!("Acquisition worker of {} exited without being asked to", self.run.id);
            self.fail("acquisition worker exited unexpectedly".to_string());
        }
    }
}

pub struct Controller {
    config: ControllerConfig,
    camera: CameraEntity,
    sink_opener: Arc<dyn SinkOpener>,
    parameters: Arc<ParameterSet>,
    next_run: u64,
    active: Option<ActiveRun>,
    last_summary: Option<RunSummary>,
    temperature: Option<TemperatureReading>,
    requests: mpsc::Receiver<ControllerRequest>,
    status_tx: mpsc::Sender<StatusEvent>,
    status_rx: mpsc::Receiver<StatusEvent>,
    runs_tx: watch::Sender<Option<RunSummary>>,
    temperature_tx: watch::Sender<Option<TemperatureReading>>,
}

impl Controller {
    /// Spawns the actor on the current runtime.
    pub fn spawn(
        camera: Box<dyn HardwareCamera>,
        sink_opener: Arc<dyn SinkOpener>,
        config: ControllerConfig,
    ) -> ControllerHandle {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(config.pipeline.status_channel_capacity.max(1));
        let (runs_tx, runs_rx) = watch::channel(None);
        let (temperature_tx, temperature_rx) = watch::channel(None);

        let controller = Controller {
            parameters: Arc::new(ParameterSet::initial(config.initial_parameters.clone())),
            config,
            camera: CameraEntity::new(camera),
            sink_opener,
            next_run: 1,
            active: None,
            last_summary: None,
            temperature: None,
            requests: requests_rx,
            status_tx,
            status_rx,
            runs_tx,
            temperature_tx,
        };
        tokio::spawn(controller.run());

        ControllerHandle {
            requests: requests_tx,
            runs: runs_rx,
            temperature: temperature_rx,
        }
    }

    async fn run(mut self) {
        info!("🎛️ Controller started for camera '{}'", self.camera.name());
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(ControllerRequest::Shutdown { response }) => {
                        self.stop_run().await;
                        let _ = response.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        debug!("All controller handles dropped");
                        self.stop_run().await;
                        break;
                    }
                },
                Some(event) = self.status_rx.recv() => self.on_status_event(event).await,
            }
        }
        info!("Controller for camera '{}' shut down", self.camera.name());
    }

    async fn handle_request(&mut self, request: ControllerRequest) {
        match request {
            ControllerRequest::StartRun { request, response } => {
                let result = self.start_run(request).await;
                let _ = response.send(result);
            }
            ControllerRequest::StopRun { response } => {
                let summary = self.stop_run().await;
                let _ = response.send(summary);
            }
            ControllerRequest::ApplyUpdate { update, response } => {
                let _ = response.send(self.apply_parameter_update(update));
            }
            ControllerRequest::Snapshot { response } => {
                let _ = response.send(self.snapshot());
            }
            ControllerRequest::Shutdown { response } => {
                let _ = response.send(());
            }
        }
    }

    async fn start_run(&mut self, request: RunRequest) -> Result<RunId, ControllerError> {
        let start_time = Instant::now();
        if let Some(active) = &self.active {
            return Err(ControllerError::AlreadyRunning(active.run.id));
        }
        request.parameters.validate(&self.config.limits)?;
        request.shot_plan.validate()?;
        self.camera.ensure_available()?;

        let layout = request.parameters.layout();
        let opener = Arc::clone(&self.sink_opener);
        let target = request.sink_target.clone();
        let sink = tokio::task::spawn_blocking(move || opener.open(&target, layout))
            .await
            .map_err(|e| ControllerError::Spawn(format!("sink open task failed: {}", e)))??;

        let parameters = if request.parameters == self.parameters.parameters {
            Arc::clone(&self.parameters)
        } else {
            Arc::new(self.parameters.successor(request.parameters.clone()))
        };
        let run_id = RunId(self.next_run);
        let pipeline = &self.config.pipeline;

        let (command_tx, command_rx) = mpsc::channel(pipeline.command_channel_capacity.max(1));
        let (frame_tx, frame_rx) = mpsc::channel(pipeline.frame_channel_capacity.max(1));
        let (file_tx, file_rx) = mpsc::channel(pipeline.file_queue_capacity.max(1));

        let file_worker = file_worker::spawn(
            run_id,
            sink,
            file_rx,
            self.status_tx.clone(),
            FileWorkerSettings::from_pipeline(pipeline),
        );
        let relay_stats = Arc::new(RelayStats::default());
        let relay = frame_relay::spawn(
            run_id,
            request.shot_plan,
            frame_rx,
            file_tx.clone(),
            Arc::clone(&relay_stats),
        );

        let camera = self.camera.lend(run_id)?;
        let spawned = acquisition_worker::spawn(
            run_id,
            camera,
            Arc::clone(&parameters),
            AcquisitionSettings::from_pipeline(pipeline, request.max_frames, request.shot_plan),
            AcquisitionChannels {
                commands: command_rx,
                frames: frame_tx,
                status: self.status_tx.clone(),
            },
            Handle::current(),
        );
        let acquisition = match spawned {
            Ok(handle) => handle,
            Err((e, camera)) => {
                self.camera.give_back(camera);
                drop(file_tx);
                let _ = relay.await;
                let _ = file_worker.await;
                return Err(ControllerError::Spawn(format!("acquisition thread: {}", e)));
            }
        };

        self.next_run += 1;
        self.parameters = Arc::clone(&parameters);
        let mut active = ActiveRun {
            run: AcquisitionRun {
                id: run_id,
                started_at: Utc::now(),
                parameters,
                sink_target: request.sink_target,
                max_frames: request.max_frames,
                shot_plan: request.shot_plan,
                state: RunState::Idle,
            },
            commands: command_tx,
            acquisition: Some(acquisition),
            relay: Some(relay),
            relay_stats,
            file_queue: Some(file_tx),
            file_worker: Some(file_worker),
            counters: RunCounters::default(),
            fault: None,
            capture_complete: false,
            acquisition_exited: false,
        };
        active.transition(RunState::Running);
        info!(
            "▶️ Started {} with parameter version {} into {} '{}' in {:?}",
            run_id,
            active.run.parameters.version,
            active.run.sink_target.format,
            active.run.sink_target.path.display(),
            start_time.elapsed()
        );
        self.active = Some(active);
        Ok(run_id)
    }

    async fn stop_run(&mut self) -> Option<RunSummary> {
        match self.active.take() {
            Some(active) => Some(self.finish_run(active).await),
            None => {
                debug!("stop_run while idle: nothing to do");
                None
            }
        }
    }

    fn apply_parameter_update(&mut self, update: ParameterUpdate) -> Result<UpdateAck, UpdateRejection> {
        let current = self.parameters.version;
        if update.version <= current {
            return Err(ProtocolError::StaleVersion {
                received: update.version,
                current,
            }
            .into());
        }
        if update.version > current + 1 {
            return Err(ProtocolError::VersionGap {
                received: update.version,
                expected: current + 1,
            }
            .into());
        }
        let candidate = self.parameters.parameters.with_change(update.name, &update.value)?;
        candidate.validate(&self.config.limits)?;
        let next = Arc::new(self.parameters.successor(candidate));

        let forwarded_to_worker = match &self.active {
            None => false,
            Some(active) => {
                if !update.name.is_live() {
                    return Err(ConfigurationError::NotLive(update.name).into());
                }
                if active.run.state != RunState::Running {
                    return Err(UpdateRejection::WorkerUnavailable);
                }
                match active.commands.try_send(AcquisitionCommand::Apply(Arc::clone(&next))) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                        warn!("Command channel of {} unavailable; update {} rejected", active.run.id, next.version);
                        return Err(UpdateRejection::WorkerUnavailable);
                    }
                }
            }
        };

        info!(
            "🔧 Parameter version {}: {} = {}{}",
            next.version,
            update.name,
            update.value,
            if forwarded_to_worker { " (forwarded to acquisition)" } else { "" }
        );
        self.parameters = next;
        Ok(UpdateAck {
            version: self.parameters.version,
            forwarded_to_worker,
        })
    }

    fn snapshot(&self) -> ControllerSnapshot {
        let (state, active_run, counters) = match &self.active {
            Some(active) => {
                let mut counters = active.counters.clone();
                counters.frames_relayed = active.relay_stats.relayed();
                counters.sequence_gaps = active.relay_stats.gaps();
                (active.run.state, Some(active.run.id), counters)
            }
            None => (RunState::Idle, None, RunCounters::default()),
        };
        ControllerSnapshot {
            state,
            active_run,
            parameters: Arc::clone(&self.parameters),
            counters,
            last_summary: self.last_summary.clone(),
            temperature: self.temperature,
            camera: self.camera.state().clone(),
        }
    }

    async fn on_status_event(&mut self, event: StatusEvent) {
        let mut active = match self.active.take() {
            Some(active) => active,
            None => {
                debug!("Ignoring {:?} from {}: no run is active", event.kind, event.run_id);
                return;
            }
        };
        self.record_event(&mut active, event);
        if active.needs_drain() {
            self.finish_run(active).await;
        } else {
            self.active = Some(active);
        }
    }

    fn record_event(&mut self, active: &mut ActiveRun, event: StatusEvent) {
        if event.run_id != active.run.id {
            debug!("Ignoring stale {:?} from {} during {}", event.kind, event.run_id, active.run.id);
            return;
        }
        match event.kind {
            StatusKind::FrameCaptured { .. } => active.counters.frames_captured += 1,
            StatusKind::FrameDropped { .. } => active.counters.frames_dropped += 1,
            StatusKind::ShotCaptured { .. } => active.counters.shots_captured += 1,
            StatusKind::GroupSaved { group, frames_written } => {
                info!("💾 {} saved group {} ({} frames on disk)", active.run.id, group, frames_written);
                active.counters.groups_saved += 1;
            }
            StatusKind::TemperatureReading(reading) => {
                self.temperature = Some(reading);
                self.temperature_tx.send_replace(Some(reading));
            }
            StatusKind::ParametersApplied { version } => {
                debug!("{} now acquiring with parameter version {}", active.run.id, version);
                active.counters.applied_versions.push(version);
            }
            StatusKind::CaptureComplete { frames } => {
                info!("🏁 {} captured its {} frames", active.run.id, frames);
                active.capture_complete = true;
            }
            StatusKind::HardwareFault { reason } => {
                error!("❌ {} hardware fault: {}", active.run.id, reason);
                active.fail(reason);
            }
            StatusKind::PersistenceFault { sequence, reason, fatal } => {
                active.counters.persistence_faults += 1;
                if fatal {
                    error!("❌ {} lost its storage at frame {}: {}", active.run.id, sequence, reason);
                    active.fail(format!("storage unavailable: {}", reason));
                } else {
                    warn!("⚠️ {} could not persist frame {}: {}", active.run.id, sequence, reason);
                }
            }
            StatusKind::WorkerExited { worker } => {
                debug!("{} reported {} exit", active.run.id, worker);
                if worker == WorkerKind::Acquisition {
                    active.on_acquisition_exit();
                }
            }
        }
    }

    /// Runs `fut` to completion while still consuming status events, so no
    /// worker can block on a full status channel during the drain.
    async fn pump_until<F: Future>(&mut self, active: &mut ActiveRun, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                output = &mut fut => return output,
                Some(event) = self.status_rx.recv() => self.record_event(active, event),
            }
        }
    }

    /// The drain-then-stop sequence. The only way a run ends.
    async fn finish_run(&mut self, mut active: ActiveRun) -> RunSummary {
        let start_time = Instant::now();
        let run_id = active.run.id;
        active.transition(RunState::Stopping);
        let stop_timeout = self.config.pipeline.acquisition_stop_timeout();

        if let Some(acquisition) = active.acquisition.take() {
            if !active.acquisition_exited {
                let commands = active.commands.clone();
                let sent = self
                    .pump_until(&mut active, commands.send_timeout(AcquisitionCommand::Stop, stop_timeout))
                    .await;
                if sent.is_err() {
                    debug!("Stop for {} not delivered; worker is already leaving", run_id);
                }
            }

            let returned = self
                .pump_until(&mut active, tokio::time::timeout(stop_timeout, acquisition.camera_return))
                .await;
            match returned {
                Ok(Ok(camera)) => {
                    self.camera.give_back(camera);
                    let thread = acquisition.thread;
                    if let Ok(Err(_)) = tokio::task::spawn_blocking(move || thread.join()).await {
                        error!("Acquisition thread of {} panicked after returning the camera", run_id);
                    }
                }
                Ok(Err(_)) => {
                    self.camera.mark_lost(format!("acquisition worker of {} died holding it", run_id));
                    active.fault.get_or_insert_with(|| "acquisition worker died".to_string());
                }
                Err(_) => {
                    error!("Acquisition worker of {} did not exit within {:?}; detaching it", run_id, stop_timeout);
                    self.camera.mark_lost(format!("acquisition worker of {} did not exit", run_id));
                    active.fault.get_or_insert_with(|| "acquisition worker did not exit".to_string());
                    // A hung worker keeps the frame channel open; the relay would never finish.
                    if let Some(relay) = &active.relay {
                        relay.abort();
                    }
                }
            }
        }

        let relay_report = match active.relay.take() {
            Some(relay) => match self.pump_until(&mut active, relay).await {
                Ok(report) => report,
                Err(e) => {
                    warn!("Relay of {} did not finish cleanly: {}", run_id, e);
                    RelayReport {
                        frames_relayed: active.relay_stats.relayed(),
                        sequence_gaps: active.relay_stats.gaps(),
                        ..RelayReport::default()
                    }
                }
            },
            None => RelayReport::default(),
        };

        if let Some(file_queue) = active.file_queue.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if self
                .pump_until(&mut active, file_queue.send(FileCommand::Flush(ack_tx)))
                .await
                .is_ok()
            {
                match self.pump_until(&mut active, ack_rx).await {
                    Ok(flushed) => debug!("{} flushed: {:?}", run_id, flushed),
                    Err(_) => warn!("File worker of {} exited before acknowledging the flush", run_id),
                }
            }
            // Last sender: the file worker sees the queue close and closes the sink.
            drop(file_queue);
        }

        let file_report = match active.file_worker.take() {
            Some(file_worker) => match self.pump_until(&mut active, file_worker).await {
                Ok(report) => report,
                Err(e) => {
                    error!("File worker of {} failed: {}", run_id, e);
                    active.fault.get_or_insert_with(|| format!("file worker failed: {}", e));
                    FileWorkerReport::default()
                }
            },
            None => FileWorkerReport::default(),
        };
        if let Some(close_error) = &file_report.close_error {
            active.fault.get_or_insert_with(|| format!("sink close failed: {}", close_error));
        }

        while let Ok(event) = self.status_rx.try_recv() {
            self.record_event(&mut active, event);
        }
        active.transition(RunState::Idle);

        let counters = &active.counters;
        let frames_captured = counters
            .frames_captured
            .max(relay_report.frames_relayed + relay_report.frames_lost + counters.frames_dropped);
        let summary = RunSummary {
            run_id,
            started_at: active.run.started_at,
            finished_at: Utc::now(),
            outcome: match active.fault.take() {
                Some(reason) => RunOutcome::Faulted { reason },
                None => RunOutcome::Completed,
            },
            frames_captured,
            frames_written: file_report.frames_written,
            frames_dropped: counters.frames_dropped,
            frames_lost: file_report.frames_lost + relay_report.frames_lost,
            sequence_gaps: relay_report.sequence_gaps,
            persistence_faults: counters.persistence_faults,
            shots_captured: counters
                .shots_captured
                .max(active.run.shot_plan.complete_shots(frames_captured)),
            groups_saved: file_report.groups_saved,
            applied_versions: counters.applied_versions.clone(),
            sink_path: active.run.sink_target.path.display().to_string(),
        };
        info!(
            "⏹️ {} finished ({}): {} captured, {} written, {} dropped, {} lost; drained in {:?}",
            run_id,
            summary.outcome,
            summary.frames_captured,
            summary.frames_written,
            summary.frames_dropped,
            summary.frames_lost,
            start_time.elapsed()
        );
        self.last_summary = Some(summary.clone());
        self.runs_tx.send_replace(Some(summary.clone()));
        summary
    }
}
