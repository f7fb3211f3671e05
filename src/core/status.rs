use crate::core::run::RunId;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Acquisition,
    File,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Acquisition => f.write_str("acquisition worker"),
            WorkerKind::File => f.write_str("file worker"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub celsius: f64,
    pub target: f64,
    pub stabilized: bool,
}

impl TemperatureReading {
    /// Within this many degrees of the target the sensor counts as stabilized.
    pub const STABLE_TOLERANCE: f64 = 1.0;

    pub fn new(celsius: f64, target: f64) -> Self {
        TemperatureReading {
            celsius,
            target,
            stabilized: (celsius - target).abs() <= Self::STABLE_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusKind {
    FrameCaptured { sequence: u64 },
    FrameDropped { sequence: u64 },
    TemperatureReading(TemperatureReading),
    ParametersApplied { version: u64 },
    /// The last frame of a shot left the acquisition thread.
    ShotCaptured { shot: u64 },
    /// A repetition group was checkpointed to storage.
    GroupSaved { group: u64, frames_written: u64 },
    CaptureComplete { frames: u64 },
    HardwareFault { reason: String },
    PersistenceFault { sequence: u64, reason: String, fatal: bool },
    WorkerExited { worker: WorkerKind },
}

/// Worker to Controller notification. Consumed at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub run_id: RunId,
    pub kind: StatusKind,
}

impl StatusEvent {
    pub fn new(run_id: RunId, kind: StatusKind) -> Self {
        StatusEvent { run_id, kind }
    }
}
