//! The conductor: drives one job through its phases.
//!
//! [`ConductorJob`](job::ConductorJob) holds the phase machine and turns
//! events into actions without doing any I/O. [`Conductor`] owns it behind a
//! lock, publishes a [`JobStatus`] after every event and carries out the
//! actions: commands go out as spawned sends, deadlines and backoffs become
//! timers feeding events back in.

mod job;
mod phase;
mod status;

pub(crate) use job::JobSetup;
pub use status::{JobStatus, PhaseName};

use crate::error::{PregelError, Result, TransportError};
use crate::message::{Command, CommandEnvelope, ErrorReply, JobId, Reply, VertexResult, WorkerId};
use crate::registry::JobRegistry;
use crate::transport::Transport;
use job::ConductorJob;

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{trace, warn};

pub(crate) enum Event {
    Reply {
        sender: WorkerId,
        reply: std::result::Result<Reply, ErrorReply>,
    },
    /// A command of `round` could not be delivered.
    SendFailed {
        round: u64,
        worker: WorkerId,
        error: TransportError,
    },
    /// The RPC deadline of `round` passed.
    Deadline { round: u64 },
    /// The backoff after the timed out cleanup `round` passed.
    Retry { round: u64 },
    Results {
        with_id: bool,
        respond: oneshot::Sender<Result<Vec<VertexResult>>>,
    },
}

#[derive(Debug)]
pub(crate) enum Action {
    Send {
        round: u64,
        to: WorkerId,
        command: Command,
    },
    Deadline { round: u64, after: Duration },
    Backoff { round: u64, after: Duration },
    /// Drop the job from the registry.
    Remove,
}

pub struct Conductor {
    id: JobId,
    job: Mutex<ConductorJob>,
    status: watch::Sender<JobStatus>,
    transport: Arc<dyn Transport>,
    registry: Weak<JobRegistry>,
}

impl Conductor {
    pub(crate) fn new(setup: JobSetup, transport: Arc<dyn Transport>, registry: Weak<JobRegistry>) -> Arc<Self> {
        let id = setup.id;
        let job = ConductorJob::new(setup);
        let (status, _) = watch::channel(job.status());
        Arc::new(Conductor {
            id,
            job: Mutex::new(job),
            status,
            transport,
            registry,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.subscribe()
    }

    pub(crate) fn start(self: &Arc<Self>) {
        self.apply(|job| job.start());
    }

    pub(crate) fn handle(self: &Arc<Self>, event: Event) {
        self.apply(|job| job.handle(event));
    }

    pub fn cancel(self: &Arc<Self>, reason: impl Into<String>) -> Result<()> {
        let mut result = Ok(());
        let reason = reason.into();
        self.apply(|job| match job.cancel(reason) {
            Ok(actions) => actions,
            Err(e) => {
                result = Err(e);
                Vec::new()
            }
        });
        result
    }

    /// Vertex results of a finished job, collected from the workers on the
    /// first request and served from the staged copy afterwards.
    pub async fn results(self: &Arc<Self>, with_id: bool) -> Result<Vec<VertexResult>> {
        let (respond, receiver) = oneshot::channel();
        self.handle(Event::Results { with_id, respond });
        receiver
            .await
            .map_err(|_| PregelError::Protocol(format!("job {} dropped a results request", self.id)))?
    }

    pub(crate) fn expired(&self, now: DateTime<Utc>) -> bool {
        self.job.lock().unwrap_or_else(PoisonError::into_inner).expired(now)
    }

    pub(crate) fn release(self: &Arc<Self>) {
        self.apply(|job| job.release());
    }

    fn apply<F>(self: &Arc<Self>, transition: F)
    where
        F: FnOnce(&mut ConductorJob) -> Vec<Action>,
    {
        let actions = {
            let mut job = self.job.lock().unwrap_or_else(PoisonError::into_inner);
            let actions = transition(&mut job);
            // Published under the lock so subscribers see statuses in order.
            let status = job.status();
            self.status.send_if_modified(|current| {
                if *current == status {
                    return false;
                }
                *current = status;
                true
            });
            actions
        };

        for action in actions {
            self.execute(action);
        }
    }

    fn execute(self: &Arc<Self>, action: Action) {
        match action {
            Action::Send { round, to, command } => {
                let conductor = Arc::clone(self);
                let transport = self.transport.clone();
                let envelope = CommandEnvelope { job: self.id, command };
                tokio::spawn(async move {
                    trace!(job = %conductor.id, worker = %to, round, command = envelope.command.tag(), "sending");
                    if let Err(error) = transport.send_command(&to, envelope).await {
                        warn!(job = %conductor.id, worker = %to, error = %error, "command not delivered");
                        conductor.handle(Event::SendFailed {
                            round,
                            worker: to,
                            error,
                        });
                    }
                });
            }
            Action::Deadline { round, after } => self.schedule(after, Event::Deadline { round }),
            Action::Backoff { round, after } => self.schedule(after, Event::Retry { round }),
            Action::Remove => {
                if let Some(registry) = self.registry.upgrade() {
                    registry.remove(self.id);
                }
            }
        }
    }

    fn schedule(self: &Arc<Self>, after: Duration, event: Event) {
        let conductor = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(conductor) = conductor.upgrade() {
                conductor.handle(event);
            }
        });
    }
}
