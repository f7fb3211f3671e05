use crate::core::frame::Frame;
use crate::core::run::{RunId, ShotPlan};
use crate::workers::FileCommand;
use log::{debug, error, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Live relay counters, readable while the run is active.
#[derive(Debug, Default)]
pub struct RelayStats {
    relayed: AtomicU64,
    gaps: AtomicU64,
}

impl RelayStats {
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayReport {
    pub frames_relayed: u64,
    /// Frames that could not be queued because the file worker was gone.
    pub frames_lost: u64,
    pub sequence_gaps: u64,
    pub missing_frames: u64,
    pub groups_closed: u64,
    pub last_sequence: Option<u64>,
}

/// Moves frames from the frame channel to the file queue in arrival order
/// until the acquisition side hangs up. Repetition groups of `plan` are
/// closed behind their last frame, or behind the last frame that arrived
/// when the closing one was dropped.
pub fn spawn(
    run_id: RunId,
    plan: ShotPlan,
    frames: mpsc::Receiver<Frame>,
    file_queue: mpsc::Sender<FileCommand>,
    stats: Arc<RelayStats>,
) -> JoinHandle<RelayReport> {
    tokio::spawn(relay(run_id, plan, frames, file_queue, stats))
}

async fn relay(
    run_id: RunId,
    plan: ShotPlan,
    mut frames: mpsc::Receiver<Frame>,
    file_queue: mpsc::Sender<FileCommand>,
    stats: Arc<RelayStats>,
) -> RelayReport {
    let mut report = RelayReport::default();
    let mut open_group: Option<u64> = None;
    while let Some(frame) = frames.recv().await {
        let sequence = frame.sequence();
        let expected = report.last_sequence.map_or(0, |last| last + 1);
        if sequence < expected {
            error!(
                "Frame {} of {} arrived after frame {}; discarding it",
                sequence,
                run_id,
                expected - 1
            );
            continue;
        }
        if sequence > expected {
            let missing = sequence - expected;
            warn!(
                "⚠️ Sequence gap in {}: expected {}, got {} ({} frames missing)",
                run_id, expected, sequence, missing
            );
            report.sequence_gaps += 1;
            report.missing_frames += missing;
            stats.gaps.fetch_add(1, Ordering::Relaxed);
        }

        let group = plan.group_of(sequence);
        if let (Some(open), Some(previous)) = (open_group, report.last_sequence) {
            if group != Some(open) {
                end_group(run_id, &file_queue, &mut report, open, previous).await;
            }
        }
        open_group = group;
        report.last_sequence = Some(sequence);

        if file_queue.send(FileCommand::Write(frame)).await.is_err() {
            report.frames_lost += 1;
            error!("File queue of {} is closed; frame {} lost", run_id, sequence);
            continue;
        }
        report.frames_relayed += 1;
        stats.relayed.fetch_add(1, Ordering::Relaxed);

        if let Some(group) = open_group.filter(|_| plan.ends_group(sequence)) {
            end_group(run_id, &file_queue, &mut report, group, sequence).await;
            open_group = None;
        }
    }
    debug!("Relay for {} finished: {:?}", run_id, report);
    report
}

async fn end_group(
    run_id: RunId,
    file_queue: &mpsc::Sender<FileCommand>,
    report: &mut RelayReport,
    group: u64,
    last_sequence: u64,
) {
    let command = FileCommand::EndGroup { group, last_sequence };
    if file_queue.send(command).await.is_err() {
        error!("File queue of {} is closed; group {} left open", run_id, group);
        return;
    }
    report.groups_closed += 1;
}
