use crate::core::parameters::ParameterSet;
use crate::errors::ConfigurationError;
use crate::storage::SinkTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{:04}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Faulted,
    Stopping,
}

impl RunState {
    /// Legal edges of the run lifecycle. Every path back to `Idle` goes
    /// through `Stopping`, where the pipeline is drained.
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Idle, RunState::Running)
                | (RunState::Running, RunState::Stopping)
                | (RunState::Running, RunState::Faulted)
                | (RunState::Faulted, RunState::Stopping)
                | (RunState::Stopping, RunState::Idle)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Faulted => "faulted",
            RunState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Faulted { reason: String },
}

impl RunOutcome {
    pub fn is_faulted(&self) -> bool {
        matches!(self, RunOutcome::Faulted { .. })
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::Faulted { reason } => write!(f, "faulted ({})", reason),
        }
    }
}

/// How consecutive frames are grouped. A shot is `frames_per_shot` frames read
/// out together; every `shots_per_group` shots form a repetition group that is
/// checkpointed to storage as a unit. Boundaries follow from the sequence
/// number alone, so dropped frames never shift them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShotPlan {
    pub frames_per_shot: u32,
    pub shots_per_group: Option<u32>,
}

impl Default for ShotPlan {
    fn default() -> Self {
        ShotPlan {
            frames_per_shot: 1,
            shots_per_group: None,
        }
    }
}

impl ShotPlan {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.frames_per_shot == 0 {
            return Err(ConfigurationError::InvalidShotPlan("frames_per_shot must be at least 1".into()));
        }
        if self.shots_per_group == Some(0) {
            return Err(ConfigurationError::InvalidShotPlan("shots_per_group must be at least 1".into()));
        }
        Ok(())
    }

    fn frames_per_shot(&self) -> u64 {
        self.frames_per_shot.max(1) as u64
    }

    pub fn shot_of(&self, sequence: u64) -> u64 {
        sequence / self.frames_per_shot()
    }

    /// True for the last frame of a shot.
    pub fn ends_shot(&self, sequence: u64) -> bool {
        (sequence + 1) % self.frames_per_shot() == 0
    }

    pub fn frames_per_group(&self) -> Option<u64> {
        self.shots_per_group
            .map(|shots| shots.max(1) as u64 * self.frames_per_shot())
    }

    pub fn group_of(&self, sequence: u64) -> Option<u64> {
        self.frames_per_group().map(|frames| sequence / frames)
    }

    /// True for the last frame of a repetition group.
    pub fn ends_group(&self, sequence: u64) -> bool {
        self.frames_per_group()
            .map_or(false, |frames| (sequence + 1) % frames == 0)
    }

    /// Shots fully covered by `frames` captured frames.
    pub fn complete_shots(&self, frames: u64) -> u64 {
        frames / self.frames_per_shot()
    }
}

/// Live counters for the active run, fed by status events and the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunCounters {
    pub frames_captured: u64,
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub sequence_gaps: u64,
    pub persistence_faults: u64,
    pub shots_captured: u64,
    pub groups_saved: u64,
    pub applied_versions: Vec<u64>,
}

/// One logical run from start to stop, owned by the Controller.
#[derive(Debug, Clone)]
pub struct AcquisitionRun {
    pub id: RunId,
    pub started_at: DateTime<Utc>,
    pub parameters: Arc<ParameterSet>,
    pub sink_target: SinkTarget,
    pub max_frames: Option<u64>,
    pub shot_plan: ShotPlan,
    pub state: RunState,
}

/// Terminal record of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub frames_captured: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub frames_lost: u64,
    pub sequence_gaps: u64,
    pub persistence_faults: u64,
    pub shots_captured: u64,
    /// Repetition groups checkpointed to storage; zero without grouping.
    pub groups_saved: u64,
    pub applied_versions: Vec<u64>,
    pub sink_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use RunState::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Faulted));
        assert!(Faulted.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Idle));

        assert!(!Running.can_transition_to(Idle));
        assert!(!Faulted.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Stopping));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn shot_plan_boundaries() {
        let plan = ShotPlan {
            frames_per_shot: 3,
            shots_per_group: Some(2),
        };
        plan.validate().unwrap();
        assert_eq!(plan.frames_per_group(), Some(6));
        let shot_ends: Vec<u64> = (0..12).filter(|&s| plan.ends_shot(s)).collect();
        assert_eq!(shot_ends, vec![2, 5, 8, 11]);
        let group_ends: Vec<u64> = (0..12).filter(|&s| plan.ends_group(s)).collect();
        assert_eq!(group_ends, vec![5, 11]);
        assert_eq!(plan.shot_of(7), 2);
        assert_eq!(plan.group_of(7), Some(1));
        assert_eq!(plan.complete_shots(8), 2);
    }

    #[test]
    fn default_plan_has_single_frame_shots_and_no_groups() {
        let plan = ShotPlan::default();
        assert!((0..5).all(|s| plan.ends_shot(s)));
        assert!(!(0..100).any(|s| plan.ends_group(s)));
        assert_eq!(plan.group_of(3), None);
    }

    #[test]
    fn empty_shots_and_groups_are_invalid() {
        let no_frames = ShotPlan {
            frames_per_shot: 0,
            shots_per_group: None,
        };
        assert!(matches!(no_frames.validate(), Err(ConfigurationError::InvalidShotPlan(_))));
        let no_shots = ShotPlan {
            frames_per_shot: 2,
            shots_per_group: Some(0),
        };
        assert!(no_shots.validate().is_err());
    }

    #[test]
    fn run_id_display() {
        assert_eq!(RunId(7).to_string(), "run-0007");
    }
}
