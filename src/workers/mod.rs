//! Execution units started by the Controller for each run, plus the
//! long-lived connection worker.
//!
//! ```text
//! HardwareCamera -> acquisition thread -> frame channel -> relay
//!     -> file queue -> file worker -> FrameSink
//! ```
//!
//! Workers never return errors to the Controller; they report through
//! [`StatusEvent`](crate::core::status::StatusEvent)s.

pub mod acquisition_worker;
pub mod connection_worker;
pub mod file_worker;
pub mod frame_relay;

use crate::core::frame::Frame;
use crate::core::parameters::ParameterSet;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Controller to acquisition worker.
#[derive(Debug)]
pub enum AcquisitionCommand {
    /// Reconfigure with this snapshot; it applies from the next frame on.
    Apply(Arc<ParameterSet>),
    Stop,
}

/// Relay to file worker, processed strictly in arrival order.
#[derive(Debug)]
pub enum FileCommand {
    Write(Frame),
    /// `last_sequence` closed repetition group `group`; everything written so
    /// far is checkpointed.
    EndGroup { group: u64, last_sequence: u64 },
    /// Acknowledged once every earlier command has been processed.
    Flush(oneshot::Sender<FlushReport>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub frames_written: u64,
    pub last_sequence: Option<u64>,
}
