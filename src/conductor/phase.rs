//! The phases of a conductor job and the data each one owns.

use super::status::PhaseName;
use crate::aggregate::{Aggregate, AggregateError};
use crate::error::Result;
use crate::message::{
    GraphLoaded, Gss, JobId, SuperstepFinished, SuperstepPrepared, VertexResult, VertexResults,
    WorkerId,
};

use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::warn;

/// One broadcast and the aggregation of its replies. The id lets the
/// conductor ignore deadlines and send failures of earlier rounds.
pub(crate) struct Round<T> {
    pub id: u64,
    pub pending: Aggregate<T>,
}

impl<T: Default + 'static> Round<T> {
    pub fn new(id: u64, pending: Aggregate<T>) -> Self {
        Round { id, pending }
    }

    /// Folds in one reply; returns the combined value once the last expected
    /// reply arrived.
    pub fn accept(&mut self, job: JobId, sender: WorkerId, value: T) -> Option<T> {
        match self.pending.contribute(sender, value) {
            Ok(fired) => fired,
            Err(AggregateError::Duplicate(sender)) => {
                warn!(%job, worker = %sender, round = self.id, "duplicate reply ignored");
                None
            }
            Err(e) => {
                warn!(%job, round = self.id, error = %e, "reply ignored");
                None
            }
        }
    }

    pub fn missing(&self) -> Vec<WorkerId> {
        self.pending.missing()
    }
}

pub(crate) enum StoringStep {
    Store,
    Cleanup,
}

pub(crate) struct Storing {
    pub step: StoringStep,
    pub round: Round<()>,
}

pub(crate) struct ResultWaiter {
    pub with_id: bool,
    pub respond: oneshot::Sender<Result<Vec<VertexResult>>>,
}

/// A collect-results round started by a result request.
pub(crate) struct Collecting {
    pub round: Round<VertexResults>,
    pub waiters: Vec<ResultWaiter>,
}

/// Done and FatalError: the job is finished but kept until it expires.
#[derive(Default)]
pub(crate) struct Retained {
    pub collecting: Option<Collecting>,
}

pub(crate) struct Canceling {
    pub attempt: u32,
    pub started: Instant,
    pub round: Round<()>,
    /// Workers still to confirm, set when an attempt times out.
    pub missing: Vec<WorkerId>,
    pub finished: bool,
}

pub(crate) enum RecoveryStep {
    /// Compensation is not possible; about to cancel.
    Paused,
    Probing {
        round: Round<SuperstepPrepared>,
        lost: BTreeSet<WorkerId>,
    },
    Reloading {
        round: Round<GraphLoaded>,
    },
    Compensating {
        number: u64,
        round: Round<SuperstepFinished>,
    },
}

pub(crate) struct Recovering {
    /// Superstep that was interrupted and is resumed afterwards.
    pub gss: Gss,
    pub step: RecoveryStep,
}

/// Exactly one phase is active per job; a transition replaces it.
pub(crate) enum Phase {
    Initial,
    CreatingWorkers(Round<()>),
    Loading(Round<GraphLoaded>),
    Computing {
        gss: Gss,
        round: Round<SuperstepFinished>,
    },
    Storing(Storing),
    Done(Retained),
    FatalError(Retained),
    Canceled(Canceling),
    Recovering(Recovering),
}

impl Phase {
    pub fn name(&self) -> PhaseName {
        match self {
            Phase::Initial => PhaseName::Initial,
            Phase::CreatingWorkers(_) => PhaseName::CreatingWorkers,
            Phase::Loading(_) => PhaseName::Loading,
            Phase::Computing { .. } => PhaseName::Computing,
            Phase::Storing(_) => PhaseName::Storing,
            Phase::Done(_) => PhaseName::Done,
            Phase::FatalError(_) => PhaseName::FatalError,
            Phase::Canceled(_) => PhaseName::Canceled,
            Phase::Recovering(_) => PhaseName::Recovering,
        }
    }

    /// Id of the round currently waiting for replies, if any.
    pub fn round_id(&self) -> Option<u64> {
        match self {
            Phase::CreatingWorkers(round) => Some(round.id),
            Phase::Loading(round) => Some(round.id),
            Phase::Computing { round, .. } => Some(round.id),
            Phase::Storing(storing) => Some(storing.round.id),
            Phase::Done(retained) | Phase::FatalError(retained) => {
                retained.collecting.as_ref().map(|c| c.round.id)
            }
            Phase::Canceled(canceling) if !canceling.finished => Some(canceling.round.id),
            Phase::Recovering(recovering) => match &recovering.step {
                RecoveryStep::Paused => None,
                RecoveryStep::Probing { round, .. } => Some(round.id),
                RecoveryStep::Reloading { round } => Some(round.id),
                RecoveryStep::Compensating { round, .. } => Some(round.id),
            },
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        match self {
            Phase::Done(_) | Phase::FatalError(_) => true,
            Phase::Canceled(canceling) => canceling.finished,
            _ => false,
        }
    }
}
