//! Conductor-side state of one job and its phase transitions.
//!
//! Nothing here performs I/O. Every entry point mutates the job and returns
//! the [`Action`]s the driver has to carry out: sending commands, arming
//! deadlines and backoff timers, dropping the job from the registry.

use super::phase::{
    Canceling, Collecting, Phase, RecoveryStep, Recovering, Retained, ResultWaiter, Round, Storing,
    StoringStep,
};
use super::status::{JobStatus, PhaseName};
use super::{Action, Event};
use crate::aggregate::{Aggregate, Merge};
use crate::aggregator::Aggregators;
use crate::algorithm::{JobInfo, MasterContext, MasterPlan};
use crate::config::{JobOptions, PregelConfig};
use crate::error::{PregelError, Result, TransportError};
use crate::graph::{plan_placement, GraphSource, ShardLocator, ShardPlan};
use crate::message::{
    AggregatorValues, Command, CreateWorker, ErrorReply, GraphLoaded, Gss, JobId, LoadGraph, Reply,
    Routing, RunSuperstep, SuperstepFinished, SuperstepStats, VertexResult, VertexResults, WorkerId,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Everything needed to start a job.
pub(crate) struct JobSetup {
    pub id: JobId,
    pub algorithm: String,
    pub plan: MasterPlan,
    pub source: GraphSource,
    pub locator: Arc<dyn ShardLocator>,
    pub options: JobOptions,
    pub config: PregelConfig,
}

pub(crate) struct ConductorJob {
    id: JobId,
    algorithm: String,
    params: Value,
    options: JobOptions,
    config: PregelConfig,
    source: GraphSource,
    locator: Arc<dyn ShardLocator>,
    master: Box<dyn MasterContext>,
    aggregators: Arc<Aggregators>,
    supports_compensation: bool,
    max_gss: u64,

    phase: Phase,
    rounds: u64,
    epoch: u64,
    gss: Gss,
    roster: BTreeSet<WorkerId>,
    /// Workers lost during recovery. They may still hold the job and get a
    /// cleanup whenever the roster does, but nothing they send counts.
    dropped: BTreeSet<WorkerId>,
    plans: BTreeMap<WorkerId, Vec<ShardPlan>>,
    routing: Routing,
    totals: GraphLoaded,
    expected_messages: BTreeMap<WorkerId, u64>,
    aggregated: AggregatorValues,
    last_stats: SuperstepStats,
    messages_sent: u64,
    messages_received: u64,

    timings: BTreeMap<String, u64>,
    phase_started: Instant,
    transitions: Vec<PhaseName>,
    message: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    results: Option<Vec<VertexResult>>,
    /// Workers have been told to clean up.
    released: bool,
}

fn worker_list(workers: &[WorkerId]) -> String {
    workers
        .iter()
        .map(|w| w.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ConductorJob {
    pub fn new(setup: JobSetup) -> Self {
        let JobSetup {
            id,
            algorithm,
            plan,
            source,
            locator,
            options,
            config,
        } = setup;

        ConductorJob {
            id,
            algorithm,
            params: options.params.clone(),
            max_gss: options.max_gss.unwrap_or(config.max_gss),
            options,
            config,
            source,
            locator,
            master: plan.context,
            aggregators: plan.aggregators,
            supports_compensation: plan.supports_compensation,

            phase: Phase::Initial,
            rounds: 0,
            epoch: 0,
            gss: 0,
            roster: BTreeSet::new(),
            dropped: BTreeSet::new(),
            plans: BTreeMap::new(),
            routing: Routing::default(),
            totals: GraphLoaded::default(),
            expected_messages: BTreeMap::new(),
            aggregated: AggregatorValues::new(),
            last_stats: SuperstepStats::default(),
            messages_sent: 0,
            messages_received: 0,

            timings: BTreeMap::new(),
            phase_started: Instant::now(),
            transitions: vec![PhaseName::Initial],
            message: None,
            expires_at: None,
            results: None,
            released: false,
        }
    }

    /// True once a settled job has outlived its retention.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.phase.is_settled() && self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job: self.id,
            algorithm: self.algorithm.clone(),
            phase: self.phase.name(),
            gss: self.gss,
            vertex_count: self.totals.vertex_count,
            edge_count: self.totals.edge_count,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            last_superstep: self.last_stats.clone(),
            aggregators: self.aggregated.clone(),
            timings: self.timings.clone(),
            transitions: self.transitions.clone(),
            workers: self.roster.iter().cloned().collect(),
            message: self.message.clone(),
            expires_at: self.expires_at,
            settled: self.phase.is_settled(),
        }
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            vertex_count: self.totals.vertex_count,
            edge_count: self.totals.edge_count,
        }
    }

    fn next_round(&mut self) -> u64 {
        self.rounds += 1;
        self.rounds
    }

    /// Sends `command` to every worker of `to` in a new round with the RPC
    /// deadline armed.
    fn broadcast<I>(&mut self, to: I, command: Command, actions: &mut Vec<Action>) -> u64
    where
        I: IntoIterator<Item = WorkerId>,
    {
        let round = self.next_round();
        for worker in to {
            actions.push(Action::Send {
                round,
                to: worker,
                command: command.clone(),
            });
        }
        actions.push(Action::Deadline {
            round,
            after: self.config.rpc_timeout,
        });
        round
    }

    fn set_phase(&mut self, phase: Phase) {
        let previous = self.phase.name();
        let next = phase.name();
        self.phase = phase;

        if previous != next {
            let elapsed = self.phase_started.elapsed().as_millis() as u64;
            *self.timings.entry(previous.to_string()).or_insert(0) += elapsed;
            self.phase_started = Instant::now();
            self.transitions.push(next);
            info!(job = %self.id, from = %previous, to = %next, gss = self.gss, "phase transition");
        }
    }

    /// A retention too large for a timestamp keeps the job forever.
    fn retain(&mut self) {
        self.expires_at = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_add_signed(retention));
    }

    fn fail(&mut self, message: String) -> Vec<Action> {
        error!(job = %self.id, phase = %self.phase.name(), gss = self.gss, "{}", message);
        self.message = Some(message);
        self.retain();
        self.set_phase(Phase::FatalError(Retained::default()));
        Vec::new()
    }

    pub fn start(&mut self) -> Vec<Action> {
        match self.phase {
            Phase::Initial => self.run_creating_workers(),
            _ => Vec::new(),
        }
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Reply { sender, .. } if self.dropped.contains(&sender) => {
                debug!(job = %self.id, worker = %sender, "reply from dropped worker ignored");
                Vec::new()
            }
            Event::SendFailed { worker, .. } if self.dropped.contains(&worker) => Vec::new(),
            Event::Reply { sender, reply } => match reply {
                Ok(reply) => self.receive(sender, reply),
                Err(error) => self.receive_error(sender, error),
            },
            Event::SendFailed { round, worker, error } => {
                if self.phase.round_id() != Some(round) {
                    debug!(job = %self.id, round, worker = %worker, "stale send failure");
                    return Vec::new();
                }
                self.send_failed(worker, error)
            }
            Event::Deadline { round } => {
                if self.phase.round_id() != Some(round) {
                    return Vec::new();
                }
                self.deadline()
            }
            Event::Retry { round } => self.retry_cleanup(round),
            Event::Results { with_id, respond } => self.request_results(ResultWaiter { with_id, respond }),
        }
    }

    /// Explicit cancel request.
    pub fn cancel(&mut self, reason: String) -> Result<Vec<Action>> {
        match self.phase {
            Phase::Done(_) | Phase::FatalError(_) => Err(PregelError::Protocol(format!(
                "job {} is {} and cannot be canceled",
                self.id,
                self.phase.name()
            ))),
            Phase::Canceled(_) => Ok(Vec::new()),
            _ => Ok(self.run_canceled(reason)),
        }
    }

    /// Tells the workers to drop the job, without waiting for them.
    pub fn release(&mut self) -> Vec<Action> {
        if self.released || (self.roster.is_empty() && self.dropped.is_empty()) {
            return Vec::new();
        }
        self.released = true;
        let round = self.next_round();
        debug!(job = %self.id, "releasing workers");
        let mut actions: Vec<Action> = self
            .roster
            .iter()
            .map(|worker| Action::Send {
                round,
                to: worker.clone(),
                command: Command::Cleanup,
            })
            .collect();
        self.release_dropped(round, &mut actions);
        actions
    }

    /// Best-effort cleanup of the dropped workers, riding on `round`.
    /// Nobody waits for their answers.
    fn release_dropped(&self, round: u64, actions: &mut Vec<Action>) {
        actions.extend(self.dropped.iter().map(|worker| Action::Send {
            round,
            to: worker.clone(),
            command: Command::Cleanup,
        }));
    }

    fn run_creating_workers(&mut self) -> Vec<Action> {
        let (routing, plans) = match plan_placement(&self.source, self.locator.as_ref()) {
            Ok(placement) => placement,
            Err(e) => return self.fail(format!("shard placement failed: {}", e)),
        };
        if plans.is_empty() {
            return self.fail("the graph has no shards".to_string());
        }

        self.routing = routing;
        self.plans = plans;
        self.roster = self.plans.keys().cloned().collect();

        let parallelism = self.options.parallelism.unwrap_or(self.config.parallelism);
        let round = self.next_round();
        let mut actions = Vec::with_capacity(self.plans.len() + 1);
        for (worker, shards) in &self.plans {
            actions.push(Action::Send {
                round,
                to: worker.clone(),
                command: Command::CreateWorker(CreateWorker {
                    algorithm: self.algorithm.clone(),
                    params: self.params.clone(),
                    shards: shards.clone(),
                    routing: self.routing.clone(),
                    parallelism,
                    batch_size: self.config.batch_size,
                    result_field: self.options.result_field.clone(),
                }),
            });
        }
        actions.push(Action::Deadline {
            round,
            after: self.config.rpc_timeout,
        });

        let pending = Aggregate::for_senders(self.roster.iter().cloned());
        self.set_phase(Phase::CreatingWorkers(Round::new(round, pending)));
        actions
    }

    fn run_loading(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let command = Command::LoadGraph(LoadGraph {
            compensation: false,
            shards: Vec::new(),
            routing: None,
        });
        let round = self.broadcast(self.roster.clone(), command, &mut actions);
        let pending = Aggregate::for_senders(self.roster.iter().cloned());
        self.set_phase(Phase::Loading(Round::new(round, pending)));
        actions
    }

    fn loaded(&mut self, totals: GraphLoaded) -> Vec<Action> {
        self.totals = totals;
        info!(
            job = %self.id,
            vertices = totals.vertex_count,
            edges = totals.edge_count,
            "graph loaded"
        );
        let info = self.info();
        self.master.pre_application(&info);
        self.aggregated = self.aggregators.identity_values();
        self.run_computing(0)
    }

    /// Aggregate of the superstep reports of the current roster, folding
    /// aggregator contributions with the algorithm's reductions.
    fn superstep_aggregate(&self) -> Aggregate<SuperstepFinished> {
        let aggregators = self.aggregators.clone();
        let mut pending = Aggregate::with_merge(
            0,
            move |acc: &mut SuperstepFinished, other: SuperstepFinished| {
                acc.gss = other.gss;
                acc.epoch = other.epoch;
                acc.compensation = other.compensation;
                acc.stats.merge(other.stats);
                aggregators.reduce_into(&mut acc.aggregators, other.aggregators);
            },
        );
        pending.restrict(self.roster.iter().cloned());
        pending
    }

    fn run_computing(&mut self, gss: Gss) -> Vec<Action> {
        self.gss = gss;
        self.master.pre_global_superstep(gss, &mut self.aggregated);

        let mut actions = Vec::new();
        let command = Command::RunSuperstep(RunSuperstep {
            gss,
            vertex_count: self.totals.vertex_count,
            edge_count: self.totals.edge_count,
            aggregators: self.aggregated.clone(),
            expected_messages: self.expected_messages.clone(),
            compensation: false,
            epoch: self.epoch,
        });
        let round = self.broadcast(self.roster.clone(), command, &mut actions);
        let pending = self.superstep_aggregate();
        self.set_phase(Phase::Computing {
            gss,
            round: Round::new(round, pending),
        });
        debug!(job = %self.id, gss, round, "superstep started");
        actions
    }

    fn superstep_finished(&mut self, total: SuperstepFinished) -> Vec<Action> {
        let gss = self.gss;
        let stats = total.stats;
        self.messages_sent += stats.sent;
        self.messages_received += stats.received;

        let mut values = self.aggregators.next_superstep(&self.aggregated);
        self.aggregators.reduce_into(&mut values, total.aggregators);
        self.aggregated = values;
        self.expected_messages = stats.sent_to.clone();

        info!(
            job = %self.id,
            gss,
            n_active_vertices = stats.active_vertices,
            msg_sent = stats.sent,
            msg_recv = stats.received,
            time_cost = stats.compute_millis,
            "superstep finished"
        );

        let proceed = self
            .master
            .post_global_superstep(gss, &mut self.aggregated, &stats);
        let converged = stats.active_vertices == 0 && stats.sent == 0;
        self.last_stats = stats;

        if proceed && !converged {
            if gss + 1 < self.max_gss {
                return self.run_computing(gss + 1);
            }
            warn!(job = %self.id, gss, max_gss = self.max_gss, "superstep limit reached");
        }

        if self.options.store {
            self.run_storing()
        } else {
            self.run_done()
        }
    }

    fn run_storing(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let round = self.broadcast(self.roster.clone(), Command::Store, &mut actions);
        let pending = Aggregate::for_senders(self.roster.iter().cloned());
        self.set_phase(Phase::Storing(Storing {
            step: StoringStep::Store,
            round: Round::new(round, pending),
        }));
        actions
    }

    fn run_storing_cleanup(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let round = self.broadcast(self.roster.clone(), Command::Cleanup, &mut actions);
        self.release_dropped(round, &mut actions);
        let pending = Aggregate::for_senders(self.roster.iter().cloned());
        self.set_phase(Phase::Storing(Storing {
            step: StoringStep::Cleanup,
            round: Round::new(round, pending),
        }));
        actions
    }

    fn run_done(&mut self) -> Vec<Action> {
        self.master.post_application();
        self.retain();
        self.set_phase(Phase::Done(Retained::default()));
        Vec::new()
    }

    fn receive(&mut self, sender: WorkerId, reply: Reply) -> Vec<Action> {
        let job = self.id;
        let epoch = self.epoch;

        match &mut self.phase {
            Phase::CreatingWorkers(round) => match reply {
                Reply::WorkerCreated => match round.accept(job, sender, ()) {
                    Some(()) => self.run_loading(),
                    None => Vec::new(),
                },
                other => self.unexpected(sender, other),
            },

            Phase::Loading(round) => match reply {
                Reply::GraphLoaded(loaded) => match round.accept(job, sender, loaded) {
                    Some(totals) => self.loaded(totals),
                    None => Vec::new(),
                },
                other => self.unexpected(sender, other),
            },

            Phase::Computing { gss, round } => match reply {
                Reply::SuperstepFinished(finished)
                    if finished.gss == *gss && finished.epoch == epoch && !finished.compensation =>
                {
                    match round.accept(job, sender, finished) {
                        Some(total) => self.superstep_finished(total),
                        None => Vec::new(),
                    }
                }
                other => self.unexpected(sender, other),
            },

            Phase::Storing(storing) => match reply {
                Reply::Stored if matches!(storing.step, StoringStep::Store) => {
                    match storing.round.accept(job, sender, ()) {
                        Some(()) => self.run_storing_cleanup(),
                        None => Vec::new(),
                    }
                }
                Reply::CleanupFinished if matches!(storing.step, StoringStep::Cleanup) => {
                    match storing.round.accept(job, sender, ()) {
                        Some(()) => {
                            self.released = true;
                            self.run_done()
                        }
                        None => Vec::new(),
                    }
                }
                other => self.unexpected(sender, other),
            },

            Phase::Recovering(_) => self.receive_recovering(sender, reply),

            Phase::Canceled(canceling) => match reply {
                Reply::CleanupFinished if !canceling.finished => {
                    match canceling.round.accept(job, sender, ()) {
                        Some(()) => self.canceled(),
                        None => Vec::new(),
                    }
                }
                other => {
                    debug!(%job, worker = %sender, reply = other.tag(), "ignored while canceled");
                    Vec::new()
                }
            },

            Phase::Done(retained) | Phase::FatalError(retained) => match reply {
                Reply::Results(results) => match retained.collecting.as_mut() {
                    Some(collecting) => match collecting.round.accept(job, sender, results) {
                        Some(all) => self.results_collected(all.vertices),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                },
                // Redelivered or late confirmations change nothing here.
                other => {
                    debug!(%job, worker = %sender, reply = other.tag(), "ignored in terminal phase");
                    Vec::new()
                }
            },

            Phase::Initial => Vec::new(),
        }
    }

    /// A reply of the wrong kind for the active phase. Echoes of earlier
    /// rounds are dropped, anything else is a protocol error.
    fn unexpected(&mut self, sender: WorkerId, reply: Reply) -> Vec<Action> {
        match reply {
            Reply::WorkerCreated
            | Reply::GraphLoaded(_)
            | Reply::SuperstepPrepared(_)
            | Reply::SuperstepFinished(_) => {
                warn!(
                    job = %self.id,
                    worker = %sender,
                    phase = %self.phase.name(),
                    reply = reply.tag(),
                    "stale reply ignored"
                );
                Vec::new()
            }
            other => self.fail(format!(
                "protocol error: unexpected {} from {} in phase {}",
                other.tag(),
                sender,
                self.phase.name()
            )),
        }
    }

    fn receive_error(&mut self, sender: WorkerId, error: ErrorReply) -> Vec<Action> {
        let job = self.id;

        match &mut self.phase {
            // A worker that cannot clean up no longer holds the job.
            Phase::Canceled(canceling) if !canceling.finished => {
                debug!(%job, worker = %sender, code = %error.code, "cleanup answered with error");
                match canceling.round.accept(job, sender, ()) {
                    Some(()) => self.canceled(),
                    None => Vec::new(),
                }
            }
            Phase::Canceled(_) => Vec::new(),

            Phase::Done(retained) | Phase::FatalError(retained) => match retained.collecting.as_mut() {
                Some(collecting) => {
                    warn!(%job, worker = %sender, error = %error.message, "results unavailable from worker");
                    match collecting.round.accept(job, sender, VertexResults::default()) {
                        Some(all) => self.results_collected(all.vertices),
                        None => Vec::new(),
                    }
                }
                None => Vec::new(),
            },

            Phase::Recovering(Recovering {
                step: RecoveryStep::Probing { lost, .. },
                ..
            }) => {
                warn!(%job, worker = %sender, error = %error.message, "probe failed, dropping worker");
                lost.insert(sender);
                self.probe_progress()
            }

            _ => {
                let error = PregelError::from_reply(sender, error);
                let message = format!("{} failed: {}", self.phase.name(), error);
                self.fail(message)
            }
        }
    }

    fn send_failed(&mut self, worker: WorkerId, error: TransportError) -> Vec<Action> {
        match &mut self.phase {
            Phase::Computing { gss, .. } => {
                let gss = *gss;
                let cause = format!("worker {} unreachable in superstep {}: {}", worker, gss, error);
                self.run_recovering(gss, cause)
            }
            Phase::Recovering(Recovering {
                step: RecoveryStep::Probing { lost, .. },
                ..
            }) => {
                lost.insert(worker);
                self.probe_progress()
            }
            Phase::Canceled(_) | Phase::Done(_) | Phase::FatalError(_) => {
                debug!(job = %self.id, worker = %worker, error = %error, "send failed, waiting for deadline");
                Vec::new()
            }
            _ => {
                let message = format!(
                    "worker {} unreachable in phase {}: {}",
                    worker,
                    self.phase.name(),
                    error
                );
                self.fail(message)
            }
        }
    }

    fn deadline(&mut self) -> Vec<Action> {
        match &mut self.phase {
            Phase::Computing { gss, round } => {
                let gss = *gss;
                let missing = round.missing();
                let cause = format!("superstep {}: {}", gss, self.timeouts(&missing));
                self.run_recovering(gss, cause)
            }

            Phase::Recovering(Recovering {
                step: RecoveryStep::Probing { round, lost },
                ..
            }) => {
                lost.extend(round.missing());
                self.probe_progress()
            }

            Phase::Canceled(_) => self.cleanup_timed_out(),

            Phase::Done(retained) => {
                if let Some(collecting) = retained.collecting.take() {
                    let missing = collecting.round.missing();
                    warn!(job = %self.id, missing = %worker_list(&missing), "collecting results timed out");
                    for waiter in collecting.waiters {
                        let _ = waiter.respond.send(Err(PregelError::Timeout(format!(
                            "no results from {}",
                            worker_list(&missing)
                        ))));
                    }
                }
                Vec::new()
            }

            // Best effort: whatever arrived is the result.
            Phase::FatalError(retained) => {
                let partial = retained
                    .collecting
                    .as_mut()
                    .and_then(|collecting| collecting.round.pending.take_partial())
                    .unwrap_or_default();
                self.results_collected(partial.vertices)
            }

            _ => {
                let missing = match &self.phase {
                    Phase::CreatingWorkers(round) | Phase::Storing(Storing { round, .. }) => round.missing(),
                    Phase::Loading(round) => round.missing(),
                    Phase::Recovering(Recovering {
                        step: RecoveryStep::Reloading { round },
                        ..
                    }) => round.missing(),
                    Phase::Recovering(Recovering {
                        step: RecoveryStep::Compensating { round, .. },
                        ..
                    }) => round.missing(),
                    _ => Vec::new(),
                };
                let message = format!("{}: {}", self.phase.name(), self.timeouts(&missing));
                self.fail(message)
            }
        }
    }

    /// One transport timeout per worker that let a round deadline pass.
    fn timeouts(&self, missing: &[WorkerId]) -> String {
        let millis = self.config.rpc_timeout.as_millis() as u64;
        missing
            .iter()
            .map(|worker| {
                TransportError::Timeout {
                    worker: worker.clone(),
                    millis,
                }
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn run_canceled(&mut self, reason: String) -> Vec<Action> {
        warn!(job = %self.id, phase = %self.phase.name(), gss = self.gss, reason = %reason, "canceling job");
        self.message = Some(reason);

        let targets: Vec<WorkerId> = self.roster.iter().cloned().collect();
        if targets.is_empty() {
            let mut actions = Vec::new();
            self.release_dropped(self.rounds, &mut actions);
            self.set_phase(Phase::Canceled(Canceling {
                attempt: 0,
                started: Instant::now(),
                round: Round::new(0, Aggregate::new(0)),
                missing: Vec::new(),
                finished: true,
            }));
            actions.extend(self.canceled());
            return actions;
        }

        let round = self.next_round();
        let mut actions: Vec<Action> = targets
            .iter()
            .map(|worker| Action::Send {
                round,
                to: worker.clone(),
                command: Command::Cleanup,
            })
            .collect();
        self.release_dropped(round, &mut actions);
        actions.push(Action::Deadline {
            round,
            after: self.cancel_deadline(Duration::ZERO),
        });

        self.set_phase(Phase::Canceled(Canceling {
            attempt: 1,
            started: Instant::now(),
            round: Round::new(round, Aggregate::for_senders(targets)),
            missing: Vec::new(),
            finished: false,
        }));
        actions
    }

    fn cancel_deadline(&self, elapsed: Duration) -> Duration {
        self.config
            .rpc_timeout
            .min(self.config.cancel_budget.saturating_sub(elapsed))
    }

    /// Every worker confirmed the cleanup.
    fn canceled(&mut self) -> Vec<Action> {
        if let Phase::Canceled(canceling) = &mut self.phase {
            canceling.finished = true;
        }
        self.released = true;
        self.expires_at = Some(Utc::now());
        info!(job = %self.id, "job canceled, workers cleaned up");
        vec![Action::Remove]
    }

    fn cleanup_timed_out(&mut self) -> Vec<Action> {
        let (round, attempt, elapsed, missing) = match &mut self.phase {
            Phase::Canceled(canceling) if !canceling.finished => {
                canceling.missing = canceling.round.missing();
                (
                    canceling.round.id,
                    canceling.attempt,
                    canceling.started.elapsed(),
                    canceling.missing.clone(),
                )
            }
            _ => return Vec::new(),
        };

        let backoff = self.config.cancel_backoff;
        if attempt >= self.config.cancel_attempts || elapsed + backoff >= self.config.cancel_budget {
            return self.fail(format!(
                "cancel did not complete: no cleanup confirmation from {} after {} attempts in {}ms",
                worker_list(&missing),
                attempt,
                elapsed.as_millis()
            ));
        }

        warn!(
            job = %self.id,
            attempt,
            missing = %worker_list(&missing),
            "cleanup timed out, retrying"
        );
        vec![Action::Backoff {
            round,
            after: backoff,
        }]
    }

    fn retry_cleanup(&mut self, timed_out: u64) -> Vec<Action> {
        let (missing, elapsed) = match &mut self.phase {
            Phase::Canceled(canceling) if !canceling.finished && canceling.round.id == timed_out => {
                canceling.attempt += 1;
                (canceling.missing.clone(), canceling.started.elapsed())
            }
            _ => return Vec::new(),
        };

        let round = self.next_round();
        let mut actions: Vec<Action> = missing
            .iter()
            .map(|worker| Action::Send {
                round,
                to: worker.clone(),
                command: Command::Cleanup,
            })
            .collect();
        actions.push(Action::Deadline {
            round,
            after: self.cancel_deadline(elapsed),
        });

        if let Phase::Canceled(canceling) = &mut self.phase {
            canceling.round = Round::new(round, Aggregate::for_senders(missing));
        }
        actions
    }

    fn run_recovering(&mut self, gss: Gss, cause: String) -> Vec<Action> {
        warn!(job = %self.id, gss, cause = %cause, "worker lost");
        self.epoch += 1;

        if !self.supports_compensation {
            self.set_phase(Phase::Recovering(Recovering {
                gss,
                step: RecoveryStep::Paused,
            }));
            return self.run_canceled(format!("{}; {} does not support compensation", cause, self.algorithm));
        }

        self.message = Some(cause);
        let mut actions = Vec::new();
        let round = self.broadcast(self.roster.clone(), Command::PrepareSuperstep { gss }, &mut actions);
        let pending = Aggregate::for_senders(self.roster.iter().cloned());
        self.set_phase(Phase::Recovering(Recovering {
            gss,
            step: RecoveryStep::Probing {
                round: Round::new(round, pending),
                lost: BTreeSet::new(),
            },
        }));
        actions
    }

    fn receive_recovering(&mut self, sender: WorkerId, reply: Reply) -> Vec<Action> {
        let job = self.id;
        let epoch = self.epoch;
        let Phase::Recovering(recovering) = &mut self.phase else {
            return Vec::new();
        };
        let gss = recovering.gss;

        match &mut recovering.step {
            RecoveryStep::Probing { round, .. } => match reply {
                Reply::SuperstepPrepared(prepared) => {
                    debug!(%job, worker = %sender, local_gss = prepared.gss, pending = prepared.pending_messages, "worker alive");
                    round.accept(job, sender, prepared);
                    self.probe_progress()
                }
                other => self.unexpected(sender, other),
            },

            RecoveryStep::Reloading { round } => match reply {
                Reply::GraphLoaded(loaded) => match round.accept(job, sender, loaded) {
                    Some(loaded) => {
                        info!(%job, vertices = loaded.vertex_count, "orphaned shards reloaded");
                        self.run_compensation(0)
                    }
                    None => Vec::new(),
                },
                other => self.unexpected(sender, other),
            },

            RecoveryStep::Compensating { number, round } => match reply {
                Reply::SuperstepFinished(finished)
                    if finished.compensation && finished.epoch == epoch && finished.gss == gss =>
                {
                    let number = *number;
                    match round.accept(job, sender, finished) {
                        Some(total) => self.compensation_finished(number, total),
                        None => Vec::new(),
                    }
                }
                other => self.unexpected(sender, other),
            },

            RecoveryStep::Paused => Vec::new(),
        }
    }

    /// Continues once every probed worker answered or is known lost.
    fn probe_progress(&mut self) -> Vec<Action> {
        let lost = match &mut self.phase {
            Phase::Recovering(Recovering {
                step: RecoveryStep::Probing { round, lost },
                ..
            }) => {
                if round.pending.received() + lost.len() < round.pending.expected() {
                    return Vec::new();
                }
                let mut lost = std::mem::take(lost);
                lost.extend(round.missing());
                lost
            }
            _ => return Vec::new(),
        };

        let survivors: Vec<WorkerId> = self.roster.difference(&lost).cloned().collect();
        let lost: Vec<WorkerId> = lost.into_iter().collect();
        if survivors.is_empty() {
            return self.fail(format!("all workers lost: {}", worker_list(&lost)));
        }

        let info = self.info();
        if !self.master.pre_compensation(&lost, &info) {
            return self.run_canceled(format!("compensation declined after losing {}", worker_list(&lost)));
        }

        // Orphaned shards go round-robin to the survivors.
        let mut assigned: BTreeMap<WorkerId, Vec<ShardPlan>> = BTreeMap::new();
        let mut moved = 0;
        for worker in &lost {
            for plan in self.plans.remove(worker).unwrap_or_default() {
                let to = survivors[moved % survivors.len()].clone();
                moved += 1;
                self.routing.owners.insert(plan.shard.clone(), to.clone());
                self.plans.entry(to.clone()).or_default().push(plan.clone());
                assigned.entry(to).or_default().push(plan);
            }
        }
        self.roster = survivors.iter().cloned().collect();
        self.dropped.extend(lost.iter().cloned());
        info!(job = %self.id, lost = %worker_list(&lost), shards = moved, "reassigning orphaned shards");

        let round = self.next_round();
        let mut actions = Vec::with_capacity(survivors.len() + 1);
        for worker in &survivors {
            actions.push(Action::Send {
                round,
                to: worker.clone(),
                command: Command::LoadGraph(LoadGraph {
                    compensation: true,
                    shards: assigned.remove(worker).unwrap_or_default(),
                    routing: Some(self.routing.clone()),
                }),
            });
        }
        actions.push(Action::Deadline {
            round,
            after: self.config.rpc_timeout,
        });

        if let Phase::Recovering(recovering) = &mut self.phase {
            recovering.step = RecoveryStep::Reloading {
                round: Round::new(round, Aggregate::for_senders(survivors)),
            };
        }
        actions
    }

    fn run_compensation(&mut self, number: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let command = Command::RunSuperstep(RunSuperstep {
            gss: self.gss,
            vertex_count: self.totals.vertex_count,
            edge_count: self.totals.edge_count,
            aggregators: self.aggregated.clone(),
            expected_messages: BTreeMap::new(),
            compensation: true,
            epoch: self.epoch,
        });
        let round = self.broadcast(self.roster.clone(), command, &mut actions);
        let pending = self.superstep_aggregate();
        if let Phase::Recovering(recovering) = &mut self.phase {
            recovering.step = RecoveryStep::Compensating {
                number,
                round: Round::new(round, pending),
            };
        }
        debug!(job = %self.id, gss = self.gss, number, "compensation round started");
        actions
    }

    fn compensation_finished(&mut self, number: u64, total: SuperstepFinished) -> Vec<Action> {
        let mut values = self.aggregators.next_superstep(&self.aggregated);
        self.aggregators.reduce_into(&mut values, total.aggregators);
        let again = self.master.post_compensation(number, &values);
        self.aggregated = values;

        if again && number + 1 < self.max_gss {
            return self.run_compensation(number + 1);
        }

        info!(job = %self.id, gss = self.gss, rounds = number + 1, "compensation finished");
        self.expected_messages.clear();
        self.message = None;
        self.run_computing(self.gss)
    }

    fn request_results(&mut self, waiter: ResultWaiter) -> Vec<Action> {
        let phase = self.phase.name();
        let unavailable = |job| PregelError::ResultsUnavailable {
            job,
            phase: phase.to_string(),
        };

        match &self.phase {
            Phase::Done(_) if self.options.store => {
                let _ = waiter.respond.send(Err(PregelError::ResultsUnavailable {
                    job: self.id,
                    phase: format!("{} (results were stored)", phase),
                }));
                return Vec::new();
            }
            Phase::Done(_) | Phase::FatalError(_) => {}
            _ => {
                let _ = waiter.respond.send(Err(unavailable(self.id)));
                return Vec::new();
            }
        }

        if self.results.is_some() {
            let view = self.results_view(waiter.with_id);
            let _ = waiter.respond.send(Ok(view));
            return Vec::new();
        }
        if self.released {
            let _ = waiter.respond.send(Err(unavailable(self.id)));
            return Vec::new();
        }
        if self.roster.is_empty() {
            self.results = Some(Vec::new());
            let _ = waiter.respond.send(Ok(Vec::new()));
            return Vec::new();
        }

        if let Phase::Done(retained) | Phase::FatalError(retained) = &mut self.phase {
            if let Some(collecting) = retained.collecting.as_mut() {
                collecting.waiters.push(waiter);
                return Vec::new();
            }
        }

        let mut actions = Vec::new();
        let round = self.broadcast(
            self.roster.clone(),
            Command::CollectResults { with_id: true },
            &mut actions,
        );
        let pending: Aggregate<VertexResults> = Aggregate::for_senders(self.roster.iter().cloned());
        if let Phase::Done(retained) | Phase::FatalError(retained) = &mut self.phase {
            retained.collecting = Some(Collecting {
                round: Round::new(round, pending),
                waiters: vec![waiter],
            });
        }
        debug!(job = %self.id, round, "collecting results");
        actions
    }

    fn results_view(&self, with_id: bool) -> Vec<VertexResult> {
        let results = self.results.clone().unwrap_or_default();
        if with_id {
            return results;
        }
        results
            .into_iter()
            .map(|mut result| {
                result.id = None;
                result
            })
            .collect()
    }

    /// Stages the collected results, answers the waiting requests and lets
    /// the workers go.
    fn results_collected(&mut self, vertices: Vec<VertexResult>) -> Vec<Action> {
        let waiters = match &mut self.phase {
            Phase::Done(retained) | Phase::FatalError(retained) => retained
                .collecting
                .take()
                .map(|collecting| collecting.waiters)
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        info!(job = %self.id, vertices = vertices.len(), "results staged");
        self.results = Some(vertices);
        for waiter in waiters {
            let view = self.results_view(waiter.with_id);
            let _ = waiter.respond.send(Ok(view));
        }
        self.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::message::SuperstepPrepared;
    use tokio::sync::oneshot;

    impl ConductorJob {
        fn phase_name(&self) -> PhaseName {
            self.phase.name()
        }
    }

    fn workers(n: usize) -> Vec<WorkerId> {
        (0..n).map(|i| WorkerId::from(format!("node-{}", i))).collect()
    }

    /// Stops the computation after superstep `stop_at`.
    struct StopAt(Gss);

    impl MasterContext for StopAt {
        fn post_global_superstep(
            &mut self,
            gss: Gss,
            _aggregators: &mut AggregatorValues,
            _stats: &SuperstepStats,
        ) -> bool {
            gss < self.0
        }
    }

    struct Compensating;

    impl MasterContext for Compensating {}

    fn job_with(context: Box<dyn MasterContext>, compensation: bool, options: JobOptions) -> ConductorJob {
        let graph = Arc::new(MemoryGraph::new(workers(3), 3));
        graph.create_vertex_collection("v").unwrap();
        graph.create_edge_collection("e").unwrap();

        ConductorJob::new(JobSetup {
            id: JobId(1),
            algorithm: "test".into(),
            plan: MasterPlan {
                context,
                aggregators: Arc::new(Aggregators::new()),
                supports_compensation: compensation,
            },
            source: GraphSource::new(["v"], ["e"]),
            locator: graph,
            options,
            config: PregelConfig::default()
                .with_cancel_policy(3, Duration::from_millis(10), Duration::from_secs(60)),
        })
    }

    fn job(stop_at: Gss) -> ConductorJob {
        job_with(Box::new(StopAt(stop_at)), false, JobOptions::default())
    }

    fn reply(job: &mut ConductorJob, sender: &WorkerId, reply: Reply) -> Vec<Action> {
        job.handle(Event::Reply {
            sender: sender.clone(),
            reply: Ok(reply),
        })
    }

    fn sent(actions: &[Action]) -> Vec<(&WorkerId, &'static str)> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Send { to, command, .. } => Some((to, command.tag())),
                _ => None,
            })
            .collect()
    }

    fn deadline_round(actions: &[Action]) -> u64 {
        actions
            .iter()
            .find_map(|action| match action {
                Action::Deadline { round, .. } => Some(*round),
                _ => None,
            })
            .unwrap()
    }

    fn finished(gss: Gss, active: u64, sent: u64) -> Reply {
        Reply::SuperstepFinished(SuperstepFinished {
            gss,
            stats: SuperstepStats {
                sent,
                active_vertices: active,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    /// Drives a job up to superstep 0 with every worker loading (10, 20).
    fn computing(job: &mut ConductorJob) -> Vec<Action> {
        let actions = job.start();
        assert_eq!(sent(&actions).len(), 3);
        assert!(sent(&actions).iter().all(|(_, tag)| *tag == "create-worker"));

        let mut actions = Vec::new();
        for worker in workers(3) {
            actions = reply(job, &worker, Reply::WorkerCreated);
        }
        assert_eq!(job.phase_name(), PhaseName::Loading);
        assert!(sent(&actions).iter().all(|(_, tag)| *tag == "load-graph"));

        for worker in workers(3) {
            assert_eq!(job.phase_name(), PhaseName::Loading);
            actions = reply(
                job,
                &worker,
                Reply::GraphLoaded(GraphLoaded {
                    vertex_count: 10,
                    edge_count: 20,
                }),
            );
        }
        actions
    }

    #[test]
    fn test_loading_sums_worker_totals() {
        let mut job = job(100);
        let actions = computing(&mut job);

        let status = job.status();
        assert_eq!(status.phase, PhaseName::Computing);
        assert_eq!(status.gss, 0);
        assert_eq!((status.vertex_count, status.edge_count), (30, 60));
        assert!(sent(&actions).iter().all(|(_, tag)| *tag == "run-superstep"));
        assert_eq!(sent(&actions).len(), 3);
    }

    #[test]
    fn test_computing_stops_exactly_when_master_says_so() {
        let mut job = job_with(Box::new(StopAt(5)), false, JobOptions::default().with_store(true));
        computing(&mut job);

        for gss in 0..=5 {
            assert_eq!(job.phase_name(), PhaseName::Computing);
            assert_eq!(job.status().gss, gss);
            let mut actions = Vec::new();
            for worker in workers(3) {
                actions = reply(&mut job, &worker, finished(gss, 1, 1));
            }
            if gss < 5 {
                assert!(sent(&actions).iter().all(|(_, tag)| *tag == "run-superstep"));
            } else {
                assert!(sent(&actions).iter().all(|(_, tag)| *tag == "store"));
            }
        }

        let status = job.status();
        assert_eq!(status.phase, PhaseName::Storing);
        assert_eq!(status.gss, 5);
        assert_eq!(status.messages_sent, 18);
    }

    #[test]
    fn test_stale_superstep_reports_are_ignored() {
        let mut job = job(100);
        computing(&mut job);

        let node0 = WorkerId::from("node-0");
        reply(&mut job, &node0, finished(0, 1, 0));
        // Same worker again and a report for another superstep.
        reply(&mut job, &node0, finished(0, 1, 0));
        reply(&mut job, &WorkerId::from("node-1"), finished(7, 1, 0));
        assert_eq!(job.phase_name(), PhaseName::Computing);
        assert_eq!(job.status().gss, 0);
    }

    #[test]
    fn test_convergence_without_messages_finishes() {
        let mut job = job(100);
        computing(&mut job);
        for worker in workers(3) {
            reply(&mut job, &worker, finished(0, 0, 0));
        }
        let status = job.status();
        assert_eq!(status.phase, PhaseName::Done);
        assert!(status.settled);
        assert!(status.expires_at.is_some());
        assert_eq!((status.vertex_count, status.edge_count), (30, 60));
    }

    #[test]
    fn test_missed_deadline_without_compensation_cancels() {
        let mut job = job(100);
        let actions = computing(&mut job);
        let round = deadline_round(&actions);

        reply(&mut job, &WorkerId::from("node-0"), finished(0, 1, 0));
        reply(&mut job, &WorkerId::from("node-1"), finished(0, 1, 0));
        let actions = job.handle(Event::Deadline { round });

        let status = job.status();
        assert_eq!(status.phase, PhaseName::Canceled);
        let recovering = status
            .transitions
            .iter()
            .position(|p| *p == PhaseName::Recovering)
            .unwrap();
        assert_eq!(status.transitions[recovering + 1], PhaseName::Canceled);
        let message = status.message.unwrap();
        assert!(
            message.contains("superstep 0: request to node-2 timed out after 30000ms"),
            "{}",
            message
        );
        assert_eq!(sent(&actions).len(), 3);
        assert!(sent(&actions).iter().all(|(_, tag)| *tag == "cleanup"));
    }

    #[test]
    fn test_worker_error_fails_the_job() {
        let mut job = job(100);
        computing(&mut job);

        reply(&mut job, &WorkerId::from("node-0"), finished(0, 1, 0));
        job.handle(Event::Reply {
            sender: WorkerId::from("node-1"),
            reply: Err(PregelError::Algorithm("vertex v/a: negative weight".into()).to_reply()),
        });

        let status = job.status();
        assert_eq!(status.phase, PhaseName::FatalError);
        assert!(status.settled);
        assert_eq!(
            status.message.as_deref(),
            Some("computing failed: worker node-1 replied with algorithm: algorithm error: vertex v/a: negative weight")
        );
    }

    #[test]
    fn test_cancel_gives_up_after_attempts() {
        let mut job = job(100);
        computing(&mut job);

        let mut actions = job.cancel("user request".into()).unwrap();
        assert_eq!(job.phase_name(), PhaseName::Canceled);
        reply(&mut job, &WorkerId::from("node-0"), Reply::CleanupFinished);
        reply(&mut job, &WorkerId::from("node-1"), Reply::CleanupFinished);

        for attempt in 1..=3 {
            let round = deadline_round(&actions);
            let after_deadline = job.handle(Event::Deadline { round });
            if attempt == 3 {
                assert!(after_deadline.is_empty());
                break;
            }
            let backoff = match after_deadline.as_slice() {
                [Action::Backoff { round, .. }] => *round,
                other => panic!("expected backoff, got {:?}", other),
            };
            actions = job.handle(Event::Retry { round: backoff });
            assert_eq!(sent(&actions), vec![(&WorkerId::from("node-2"), "cleanup")]);
        }

        let status = job.status();
        assert_eq!(status.phase, PhaseName::FatalError);
        let message = status.message.unwrap();
        assert!(message.contains("cancel did not complete"));
        assert!(message.contains("node-2"));
        assert!(message.contains("3 attempts"));
    }

    #[test]
    fn test_cancel_completes_and_removes_job() {
        let mut job = job(100);
        computing(&mut job);

        job.cancel("user request".into()).unwrap();
        let mut actions = Vec::new();
        for worker in workers(3) {
            actions = reply(&mut job, &worker, Reply::CleanupFinished);
        }
        assert!(matches!(actions.as_slice(), [Action::Remove]));
        assert!(job.status().settled);
        assert!(job.cancel("again".into()).unwrap().is_empty());
    }

    #[test]
    fn test_done_ignores_redelivered_cleanup() {
        let mut job = job_with(Box::new(StopAt(0)), false, JobOptions::default().with_store(true));
        computing(&mut job);
        for worker in workers(3) {
            reply(&mut job, &worker, finished(0, 1, 1));
        }
        for worker in workers(3) {
            reply(&mut job, &worker, Reply::Stored);
        }
        for worker in workers(3) {
            reply(&mut job, &worker, Reply::CleanupFinished);
        }
        assert_eq!(job.phase_name(), PhaseName::Done);

        let before = job.status();
        let actions = reply(&mut job, &WorkerId::from("node-1"), Reply::CleanupFinished);
        assert!(actions.is_empty());
        assert!(job.release().is_empty());
        assert_eq!(job.status(), before);
    }

    #[test]
    fn test_results_are_collected_once() {
        let mut job = job(0);
        computing(&mut job);
        for worker in workers(3) {
            reply(&mut job, &worker, finished(0, 1, 1));
        }
        assert_eq!(job.phase_name(), PhaseName::Done);

        let (tx, mut rx) = oneshot::channel();
        let actions = job.handle(Event::Results { with_id: false, respond: tx });
        assert_eq!(sent(&actions).len(), 3);

        for (i, worker) in workers(3).iter().enumerate() {
            let results = VertexResults {
                vertices: vec![VertexResult {
                    key: format!("k{}", i),
                    id: Some(format!("v/k{}", i)),
                    value: Value::from(i as u64),
                }],
            };
            let actions = reply(&mut job, worker, Reply::Results(results));
            if i == 2 {
                assert!(sent(&actions).iter().all(|(_, tag)| *tag == "cleanup"));
            }
        }

        let results = rx.try_recv().unwrap().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.id.is_none()));

        let (tx, mut rx) = oneshot::channel();
        let actions = job.handle(Event::Results { with_id: true, respond: tx });
        assert!(actions.is_empty());
        let results = rx.try_recv().unwrap().unwrap();
        assert!(results.iter().all(|r| r.id.is_some()));
    }

    #[test]
    fn test_recovery_reassigns_shards_and_resumes() {
        let mut job = job_with(Box::new(Compensating), true, JobOptions::default());
        let actions = computing(&mut job);
        let lost = WorkerId::from("node-2");

        reply(&mut job, &WorkerId::from("node-0"), finished(0, 1, 1));
        let actions = job.handle(Event::SendFailed {
            round: deadline_round(&actions),
            worker: lost.clone(),
            error: TransportError::Unreachable(lost.clone()),
        });
        assert_eq!(job.phase_name(), PhaseName::Recovering);
        assert!(sent(&actions).iter().all(|(_, tag)| *tag == "prepare-superstep"));

        let probe = deadline_round(&actions);
        for worker in ["node-0", "node-1"] {
            reply(
                &mut job,
                &WorkerId::from(worker),
                Reply::SuperstepPrepared(SuperstepPrepared { gss: 0, pending_messages: 0 }),
            );
        }
        let actions = job.handle(Event::SendFailed {
            round: probe,
            worker: lost.clone(),
            error: TransportError::Unreachable(lost.clone()),
        });

        let loads: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Send {
                    to,
                    command: Command::LoadGraph(load),
                    ..
                } => Some((to.clone(), load.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(loads.len(), 2);
        let moved: usize = loads.iter().map(|(_, load)| load.shards.len()).sum();
        assert_eq!(moved, 1);
        for (_, load) in &loads {
            assert!(load.compensation);
            let routing = load.routing.as_ref().unwrap();
            assert!(routing.owners.values().all(|owner| *owner != lost));
        }

        for (worker, _) in &loads {
            reply(&mut job, worker, Reply::GraphLoaded(GraphLoaded::default()));
        }
        for (worker, _) in &loads {
            reply(
                &mut job,
                worker,
                Reply::SuperstepFinished(SuperstepFinished {
                    gss: 0,
                    epoch: 1,
                    compensation: true,
                    ..Default::default()
                }),
            );
        }

        let status = job.status();
        assert_eq!(status.phase, PhaseName::Computing);
        assert_eq!(status.gss, 0);
        assert_eq!(status.workers.len(), 2);
        assert_eq!((status.vertex_count, status.edge_count), (30, 60));

        // The lost worker is out of the job: its late answers count for
        // nothing, but it is still told to clean up.
        let late = job.handle(Event::Reply {
            sender: lost.clone(),
            reply: Err(PregelError::JobNotFound(JobId(1)).to_reply()),
        });
        assert!(late.is_empty());
        assert_eq!(job.phase_name(), PhaseName::Computing);

        let released = job.release();
        let targets: Vec<WorkerId> = sent(&released).into_iter().map(|(to, _)| to.clone()).collect();
        assert_eq!(targets.len(), 3);
        assert!(targets.contains(&lost));
        assert!(sent(&released).iter().all(|(_, tag)| *tag == "cleanup"));
        assert!(job.release().is_empty());
    }
}
