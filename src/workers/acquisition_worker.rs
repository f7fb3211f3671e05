//! The acquire loop. Runs on its own named OS thread and owns the camera for
//! the lifetime of one run; the handle comes back, closed, through a oneshot.

use crate::app_config::PipelineConfig;
use crate::core::capture_source::HardwareCamera;
use crate::core::frame::Frame;
use crate::core::parameters::ParameterSet;
use crate::core::run::{RunId, ShotPlan};
use crate::core::status::{StatusEvent, StatusKind, TemperatureReading, WorkerKind};
use crate::errors::CameraFault;
use crate::workers::AcquisitionCommand;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub grab_timeout: Duration,
    pub backpressure_timeout: Duration,
    pub backpressure_retries: u32,
    pub temperature_interval: Duration,
    pub max_frames: Option<u64>,
    pub shot_plan: ShotPlan,
}

impl AcquisitionSettings {
    pub fn from_pipeline(pipeline: &PipelineConfig, max_frames: Option<u64>, shot_plan: ShotPlan) -> Self {
        AcquisitionSettings {
            grab_timeout: pipeline.grab_timeout(),
            backpressure_timeout: pipeline.backpressure_timeout(),
            backpressure_retries: pipeline.backpressure_retries.max(1),
            temperature_interval: pipeline.temperature_interval(),
            max_frames,
            shot_plan,
        }
    }
}

pub struct AcquisitionChannels {
    pub commands: mpsc::Receiver<AcquisitionCommand>,
    pub frames: mpsc::Sender<Frame>,
    pub status: mpsc::Sender<StatusEvent>,
}

/// What the Controller keeps of a running acquisition worker.
pub struct AcquisitionHandle {
    pub camera_return: oneshot::Receiver<Box<dyn HardwareCamera>>,
    pub thread: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    StopRequested,
    CommandsClosed,
    FramesClosed,
    CaptureComplete,
}

enum Delivery {
    Delivered,
    Dropped,
    ChannelClosed,
}

pub struct AcquisitionWorker {
    run_id: RunId,
    camera: Box<dyn HardwareCamera>,
    parameters: Arc<ParameterSet>,
    settings: AcquisitionSettings,
    channels: AcquisitionChannels,
    runtime: Handle,
    next_sequence: u64,
    opened: bool,
    started: bool,
}

/// Starts the worker thread. On failure the camera is handed back in the error.
pub fn spawn(
    run_id: RunId,
    camera: Box<dyn HardwareCamera>,
    parameters: Arc<ParameterSet>,
    settings: AcquisitionSettings,
    channels: AcquisitionChannels,
    runtime: Handle,
) -> Result<AcquisitionHandle, (std::io::Error, Box<dyn HardwareCamera>)> {
    // The camera only crosses into the thread once it is known to exist.
    let (handoff_tx, handoff_rx) = std::sync::mpsc::channel::<Box<dyn HardwareCamera>>();
    let (return_tx, return_rx) = oneshot::channel();

    let spawned = thread::Builder::new()
        .name(format!("acquisition-{}", run_id))
        .spawn(move || {
            let camera = match handoff_rx.recv() {
                Ok(camera) => camera,
                Err(_) => return,
            };
            let worker = AcquisitionWorker {
                run_id,
                camera,
                parameters,
                settings,
                channels,
                runtime,
                next_sequence: 0,
                opened: false,
                started: false,
            };
            let camera = worker.run();
            if return_tx.send(camera).is_err() {
                warn!("Acquisition worker for {} could not return the camera: controller is gone", run_id);
            }
        });

    match spawned {
        Ok(thread) => match handoff_tx.send(camera) {
            Ok(()) => Ok(AcquisitionHandle {
                camera_return: return_rx,
                thread,
            }),
            Err(std::sync::mpsc::SendError(camera)) => Err((
                std::io::Error::new(std::io::ErrorKind::Other, "acquisition thread exited before start"),
                camera,
            )),
        },
        Err(e) => {
            drop(handoff_tx);
            Err((e, camera))
        }
    }
}

impl AcquisitionWorker {
    fn run(mut self) -> Box<dyn HardwareCamera> {
        let start_time = Instant::now();
        info!(
            "🎬 Acquisition worker for {} started on camera '{}' with parameter version {}",
            self.run_id,
            self.camera.name(),
            self.parameters.version
        );

        match self.session() {
            Ok(exit) => info!(
                "Acquisition loop for {} ended ({:?}) after {} frames in {:?}",
                self.run_id,
                exit,
                self.next_sequence,
                start_time.elapsed()
            ),
            Err(fault) => {
                error!("❌ Hardware fault in {}: {}", self.run_id, fault);
                self.emit(StatusKind::HardwareFault {
                    reason: fault.to_string(),
                });
            }
        }

        self.release_camera();
        self.emit(StatusKind::WorkerExited {
            worker: WorkerKind::Acquisition,
        });
        self.camera
    }

    fn session(&mut self) -> Result<LoopExit, CameraFault> {
        self.camera.open()?;
        self.opened = true;
        self.camera.configure(&self.parameters.parameters)?;
        self.camera.start()?;
        self.started = true;
        self.emit(StatusKind::ParametersApplied {
            version: self.parameters.version,
        });

        let mut last_temperature: Option<Instant> = None;
        loop {
            loop {
                match self.channels.commands.try_recv() {
                    Ok(AcquisitionCommand::Stop) => return Ok(LoopExit::StopRequested),
                    Ok(AcquisitionCommand::Apply(set)) => self.apply(set)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(LoopExit::CommandsClosed),
                }
            }

            if last_temperature.map_or(true, |t| t.elapsed() >= self.settings.temperature_interval) {
                let celsius = self.camera.read_temperature()?;
                let reading = TemperatureReading::new(celsius, self.parameters.parameters.target_temperature);
                self.emit_telemetry(StatusKind::TemperatureReading(reading));
                last_temperature = Some(Instant::now());
            }

            let buffer = match self.camera.grab_frame(self.settings.grab_timeout)? {
                Some(buffer) => buffer,
                None => continue,
            };
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            let frame = Frame::new(sequence, Utc::now(), buffer, Arc::clone(&self.parameters));

            match self.deliver(frame) {
                Delivery::Delivered => self.emit_telemetry(StatusKind::FrameCaptured { sequence }),
                Delivery::Dropped => {
                    warn!(
                        "⚠️ Dropped frame {} of {}: frame channel stayed full for {} attempts",
                        sequence, self.run_id, self.settings.backpressure_retries
                    );
                    self.emit(StatusKind::FrameDropped { sequence });
                }
                Delivery::ChannelClosed => return Ok(LoopExit::FramesClosed),
            }
            if self.settings.shot_plan.ends_shot(sequence) {
                let shot = self.settings.shot_plan.shot_of(sequence);
                self.emit_telemetry(StatusKind::ShotCaptured { shot });
            }

            if let Some(max) = self.settings.max_frames {
                if self.next_sequence >= max {
                    self.emit(StatusKind::CaptureComplete {
                        frames: self.next_sequence,
                    });
                    return Ok(LoopExit::CaptureComplete);
                }
            }
        }
    }

    /// stop, configure, start. The new snapshot is stamped on every frame
    /// grabbed after this returns.
    fn apply(&mut self, set: Arc<ParameterSet>) -> Result<(), CameraFault> {
        if set.version <= self.parameters.version {
            error!(
                "Ignoring parameter version {} in {}: version {} is already active",
                set.version, self.run_id, self.parameters.version
            );
            return Ok(());
        }
        let start_time = Instant::now();
        self.camera.stop()?;
        self.started = false;
        self.camera.configure(&set.parameters)?;
        self.camera.start()?;
        self.started = true;
        debug!(
            "Applied parameter version {} to '{}' in {:?}",
            set.version,
            self.camera.name(),
            start_time.elapsed()
        );
        let version = set.version;
        self.parameters = set;
        self.emit(StatusKind::ParametersApplied { version });
        Ok(())
    }

    fn deliver(&mut self, frame: Frame) -> Delivery {
        let mut frame = frame;
        for attempt in 1..=self.settings.backpressure_retries {
            let sent = self
                .runtime
                .block_on(self.channels.frames.send_timeout(frame, self.settings.backpressure_timeout));
            match sent {
                Ok(()) => return Delivery::Delivered,
                Err(SendTimeoutError::Timeout(returned)) => {
                    debug!(
                        "Frame channel full for frame {} (attempt {}/{})",
                        returned.sequence(),
                        attempt,
                        self.settings.backpressure_retries
                    );
                    frame = returned;
                }
                Err(SendTimeoutError::Closed(_)) => return Delivery::ChannelClosed,
            }
        }
        Delivery::Dropped
    }

    /// Stops and closes whatever was opened, exactly once.
    fn release_camera(&mut self) {
        if self.started {
            self.started = false;
            if let Err(e) = self.camera.stop() {
                warn!("Stopping camera '{}' failed: {}", self.camera.name(), e);
            }
        }
        if self.opened {
            self.opened = false;
            if let Err(e) = self.camera.close() {
                warn!("Closing camera '{}' failed: {}", self.camera.name(), e);
            }
        }
    }

    /// Events the Controller must see; waits for room in the status channel.
    fn emit(&self, kind: StatusKind) {
        if self.channels.status.blocking_send(StatusEvent::new(self.run_id, kind)).is_err() {
            debug!("Status channel closed; {} event discarded", self.run_id);
        }
    }

    /// Events that may be skipped when the Controller falls behind.
    fn emit_telemetry(&self, kind: StatusKind) {
        match self.channels.status.try_send(StatusEvent::new(self.run_id, kind)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => debug!("Status channel full, skipped {:?}", event.kind),
        }
    }
}
