use crate::message::{AggregatorValues, Gss, JobId, SuperstepStats, WorkerId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseName {
    Initial,
    CreatingWorkers,
    Loading,
    Computing,
    Storing,
    Done,
    Canceled,
    FatalError,
    Recovering,
}

impl PhaseName {
    /// Phases a job never leaves on its own, except for retention expiry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseName::Done | PhaseName::Canceled | PhaseName::FatalError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Initial => "initial",
            PhaseName::CreatingWorkers => "creating-workers",
            PhaseName::Loading => "loading",
            PhaseName::Computing => "computing",
            PhaseName::Storing => "storing",
            PhaseName::Done => "done",
            PhaseName::Canceled => "canceled",
            PhaseName::FatalError => "fatal-error",
            PhaseName::Recovering => "recovering",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a job, published after every event the conductor handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job: JobId,
    pub algorithm: String,
    pub phase: PhaseName,
    pub gss: Gss,
    pub vertex_count: u64,
    pub edge_count: u64,
    /// Messages sent and received over all supersteps.
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_superstep: SuperstepStats,
    pub aggregators: AggregatorValues,
    /// Wall-clock milliseconds spent per phase.
    pub timings: BTreeMap<String, u64>,
    /// Every phase the job entered, in order.
    pub transitions: Vec<PhaseName>,
    pub workers: Vec<WorkerId>,
    /// Cause of a cancel or failure.
    pub message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// True once nothing will change any more: done, failed, or canceled
    /// with every worker cleaned up.
    pub settled: bool,
}

impl JobStatus {
    pub fn passed_through(&self, phase: PhaseName) -> bool {
        self.transitions.contains(&phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(PhaseName::CreatingWorkers.to_string(), "creating-workers");
        assert_eq!(
            serde_json::to_string(&PhaseName::FatalError).unwrap(),
            "\"fatal-error\""
        );
        assert!(PhaseName::Canceled.is_terminal());
        assert!(!PhaseName::Recovering.is_terminal());
    }
}
