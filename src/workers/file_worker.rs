//! Drains the file queue into the run's sink on a blocking task.

use crate::app_config::PipelineConfig;
use crate::core::frame::Frame;
use crate::core::run::RunId;
use crate::core::status::{StatusEvent, StatusKind, WorkerKind};
use crate::errors::SinkError;
use crate::storage::FrameSink;
use crate::workers::{FileCommand, FlushReport};
use log::{debug, error, info, warn};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileWorkerSettings {
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl FileWorkerSettings {
    pub fn from_pipeline(pipeline: &PipelineConfig) -> Self {
        FileWorkerSettings {
            retry_attempts: pipeline.sink_retry_attempts.max(1),
            retry_backoff: pipeline.sink_retry_backoff(),
        }
    }
}

/// Returned when the file queue closes and the sink has been closed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileWorkerReport {
    pub frames_written: u64,
    pub frames_lost: u64,
    pub groups_saved: u64,
    pub last_sequence: Option<u64>,
    pub close_error: Option<String>,
}

struct FileWorker {
    run_id: RunId,
    sink: Box<dyn FrameSink>,
    status: mpsc::Sender<StatusEvent>,
    settings: FileWorkerSettings,
    report: FileWorkerReport,
    medium_lost: bool,
}

pub fn spawn(
    run_id: RunId,
    sink: Box<dyn FrameSink>,
    queue: mpsc::Receiver<FileCommand>,
    status: mpsc::Sender<StatusEvent>,
    settings: FileWorkerSettings,
) -> JoinHandle<FileWorkerReport> {
    let worker = FileWorker {
        run_id,
        sink,
        status,
        settings,
        report: FileWorkerReport::default(),
        medium_lost: false,
    };
    tokio::task::spawn_blocking(move || worker.run(queue))
}

impl FileWorker {
    fn run(mut self, mut queue: mpsc::Receiver<FileCommand>) -> FileWorkerReport {
        let start_time = Instant::now();
        info!("💾 File worker for {} writing to '{}'", self.run_id, self.sink.location().display());

        while let Some(command) = queue.blocking_recv() {
            match command {
                FileCommand::Write(frame) => self.write(frame),
                FileCommand::EndGroup { group, last_sequence } => self.end_group(group, last_sequence),
                FileCommand::Flush(ack) => {
                    let flushed = FlushReport {
                        frames_written: self.report.frames_written,
                        last_sequence: self.report.last_sequence,
                    };
                    debug!("File worker for {} flushed at {:?}", self.run_id, flushed);
                    if ack.send(flushed).is_err() {
                        debug!("Flush requester for {} went away", self.run_id);
                    }
                }
            }
        }

        if let Err(e) = self.sink.close() {
            error!("❌ Closing sink '{}' failed: {}", self.sink.location().display(), e);
            self.report.close_error = Some(e.to_string());
        }
        info!(
            "File worker for {} finished: {} written, {} lost in {:?}",
            self.run_id,
            self.report.frames_written,
            self.report.frames_lost,
            start_time.elapsed()
        );
        // The Controller joins this task directly; the event is informational.
        let _ = self.status.try_send(StatusEvent::new(
            self.run_id,
            StatusKind::WorkerExited {
                worker: WorkerKind::File,
            },
        ));
        self.report
    }

    fn write(&mut self, frame: Frame) {
        let sequence = frame.sequence();
        if let Some(last) = self.report.last_sequence {
            if sequence <= last {
                error!(
                    "Refusing frame {} of {}: frame {} was already written",
                    sequence, self.run_id, last
                );
                return;
            }
        }
        if self.medium_lost {
            debug!("Frame {} of {} lost: storage medium is gone", sequence, self.run_id);
            self.report.frames_lost += 1;
            return;
        }

        match self.append_with_retry(&frame) {
            Ok(()) => {
                self.report.frames_written += 1;
                self.report.last_sequence = Some(sequence);
            }
            Err(e) => {
                error!("❌ Frame {} of {} lost: {}", sequence, self.run_id, e);
                self.report.frames_lost += 1;
                self.report_fault(sequence, &e);
            }
        }
    }

    /// Checkpoints the sink at the end of a repetition group.
    fn end_group(&mut self, group: u64, last_sequence: u64) {
        if self.medium_lost {
            debug!("Group {} of {} not saved: storage medium is gone", group, self.run_id);
            return;
        }
        let start_time = Instant::now();
        match self.sink.checkpoint() {
            Ok(()) => {
                self.report.groups_saved += 1;
                info!(
                    "💾 Group {} of {} saved through frame {} in {:?}",
                    group,
                    self.run_id,
                    last_sequence,
                    start_time.elapsed()
                );
                let saved = StatusEvent::new(
                    self.run_id,
                    StatusKind::GroupSaved {
                        group,
                        frames_written: self.report.frames_written,
                    },
                );
                if self.status.try_send(saved).is_err() {
                    debug!("Status channel busy; group {} of {} saved unannounced", group, self.run_id);
                }
            }
            Err(e) => {
                error!("❌ Group {} of {} could not be saved: {}", group, self.run_id, e);
                self.report_fault(last_sequence, &e);
            }
        }
    }

    fn report_fault(&mut self, sequence: u64, e: &SinkError) {
        let fatal = e.is_medium_unavailable();
        self.medium_lost |= fatal;
        let event = StatusEvent::new(
            self.run_id,
            StatusKind::PersistenceFault {
                sequence,
                reason: e.to_string(),
                fatal,
            },
        );
        if self.status.blocking_send(event).is_err() {
            debug!("Status channel closed; persistence fault of {} not reported", self.run_id);
        }
    }

    fn append_with_retry(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let mut delay = self.settings.retry_backoff;
        let mut attempt = 1;
        loop {
            match self.sink.append(frame) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.settings.retry_attempts => {
                    warn!(
                        "Write of frame {} failed (attempt {}/{}), retrying in {:?}: {}",
                        frame.sequence(),
                        attempt,
                        self.settings.retry_attempts,
                        delay,
                        e
                    );
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
