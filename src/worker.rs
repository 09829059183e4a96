//! Per-node side of a job.
//!
//! A [`WorkerJob`] owns the partitions loaded from the shards assigned to its
//! node, the two incoming message buffers and the algorithm's per-worker
//! state. Commands arrive through [`WorkerHandle::dispatch`]; every long
//! operation (loading, computing a superstep, storing) runs as a task and
//! reports back to the conductor on completion.

use crate::aggregator::Aggregators;
use crate::algorithm::{Algorithm, ComputeContext, JobInfo, WorkerContext};
use crate::buffer::{InCache, MessageBuffers, OutCache};
use crate::combine::Combine;
use crate::config::PregelConfig;
use crate::error::{PregelError, Result};
use crate::graph::{split_document_id, GraphStore, ShardPlan};
use crate::message::{
    AggregatorValues, Command, CreateWorker, ErrorReply, Gss, GraphLoaded, JobId, MessageBatch, Reply,
    ReplyEnvelope, Routing, RunSuperstep, ShardId, SuperstepFinished, SuperstepPrepared,
    SuperstepStats, VertexId, VertexResult, VertexResults, WorkerId,
};
use crate::transport::Transport;
use crate::vertex::Vertex;

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Vertices computed between two looks at the cancel flag.
const CANCEL_CHECK_INTERVAL: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initial,
    Loading,
    Loaded,
    Computing,
    Storing,
    Stored,
    ProducingResults,
    ResultsProduced,
    CleaningUp,
    Cleaned,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Initial => "initial",
            WorkerState::Loading => "loading",
            WorkerState::Loaded => "loaded",
            WorkerState::Computing => "computing",
            WorkerState::Storing => "storing",
            WorkerState::Stored => "stored",
            WorkerState::ProducingResults => "producing-results",
            WorkerState::ResultsProduced => "results-produced",
            WorkerState::CleaningUp => "cleaning-up",
            WorkerState::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}

/// Everything a node hands to an algorithm factory to create a worker.
pub struct WorkerSetup {
    pub job: JobId,
    pub me: WorkerId,
    pub create: CreateWorker,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn GraphStore>,
    pub config: PregelConfig,
}

/// Type-erased worker as seen by the node host.
pub trait WorkerHandle: Send + Sync {
    fn job(&self) -> JobId;

    fn algorithm(&self) -> &str;

    fn state(&self) -> WorkerState;

    /// Handles one command from the conductor. Returns immediately; the
    /// reply is sent once the command is done.
    fn dispatch(self: Arc<Self>, command: Command);

    /// Stores a batch of vertex messages sent by a peer.
    fn deliver(&self, batch: MessageBatch) -> Result<()>;
}

struct Partition<V, E> {
    shard: ShardId,
    collection: String,
    vertices: Vec<Vertex<V, E>>,
}

impl<V, E> Partition<V, E> {
    fn n_edges(&self) -> u64 {
        self.vertices.iter().map(|v| v.out_degree() as u64).sum()
    }
}

type SharedPartition<A> =
    Arc<Mutex<Partition<<A as Algorithm>::Vertex, <A as Algorithm>::Edge>>>;

struct Progress {
    state: WorkerState,
    /// Superstep the worker expects to compute next.
    next_gss: Gss,
    running: bool,
    /// Report of superstep `next_gss - 1`, resent on redelivery.
    last_report: Option<SuperstepFinished>,
    /// Set by a compensation round: the next superstep runs on cleared
    /// buffers and must not wait for declared message counts.
    skip_message_check: bool,
}

/// What one compute task produced.
struct TaskOutput<M> {
    n_msg_sent: u64,
    n_active_vertices: u64,
    aggregated_values: AggregatorValues,
    batches: Vec<(WorkerId, Vec<(VertexId, M)>)>,
    sent_to: BTreeMap<WorkerId, u64>,
}

impl<M> Default for TaskOutput<M> {
    fn default() -> Self {
        TaskOutput {
            n_msg_sent: 0,
            n_active_vertices: 0,
            aggregated_values: AggregatorValues::new(),
            batches: Vec::new(),
            sent_to: BTreeMap::new(),
        }
    }
}

pub struct WorkerJob<A: Algorithm> {
    job: JobId,
    me: WorkerId,
    algorithm: Arc<A>,
    algorithm_name: String,
    transport: Arc<dyn Transport>,
    store: Arc<dyn GraphStore>,
    config: PregelConfig,
    plans: Vec<ShardPlan>,
    parallelism: usize,
    batch_size: usize,
    result_field: String,

    routing: RwLock<Arc<Routing>>,
    partitions: RwLock<Vec<SharedPartition<A>>>,
    buffers: MessageBuffers<A::Message>,
    combiner: Option<Arc<dyn Combine<A::Message>>>,
    aggregators: Aggregators,
    context: Mutex<Box<dyn WorkerContext>>,
    progress: Mutex<Progress>,
    arrivals: Notify,
    canceled: AtomicBool,
}

impl<A: Algorithm> WorkerJob<A> {
    pub fn new(algorithm: Arc<A>, setup: WorkerSetup) -> Arc<Self> {
        let WorkerSetup {
            job,
            me,
            create,
            transport,
            store,
            config,
        } = setup;

        let shards: Vec<ShardId> = create.shards.iter().map(|p| p.shard.clone()).collect();
        let combiner = algorithm.combiner();

        Arc::new(WorkerJob {
            job,
            me,
            algorithm_name: create.algorithm.clone(),
            buffers: MessageBuffers::new(&shards, combiner.clone()),
            combiner,
            aggregators: algorithm.aggregators(),
            context: Mutex::new(algorithm.worker_context()),
            algorithm,
            transport,
            store,
            plans: create.shards,
            parallelism: create.parallelism.max(1),
            batch_size: create.batch_size.max(1),
            result_field: create.result_field,
            routing: RwLock::new(Arc::new(create.routing)),
            partitions: RwLock::new(Vec::new()),
            progress: Mutex::new(Progress {
                state: WorkerState::Initial,
                next_gss: 0,
                running: false,
                last_report: None,
                skip_message_check: false,
            }),
            arrivals: Notify::new(),
            canceled: AtomicBool::new(false),
            config,
        })
    }

    pub fn local_n_vertices(&self) -> u64 {
        self.partitions_snapshot()
            .iter()
            .map(|p| p.lock().unwrap_or_else(PoisonError::into_inner).vertices.len() as u64)
            .sum()
    }

    pub fn local_n_edges(&self) -> u64 {
        self.partitions_snapshot()
            .iter()
            .map(|p| p.lock().unwrap_or_else(PoisonError::into_inner).n_edges())
            .sum()
    }

    fn partitions_snapshot(&self) -> Vec<SharedPartition<A>> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn routing(&self) -> Arc<Routing> {
        self.routing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    async fn reply(&self, reply: std::result::Result<Reply, ErrorReply>) {
        let envelope = ReplyEnvelope {
            job: self.job,
            sender: self.me.clone(),
            reply,
        };
        if let Err(e) = self.transport.send_reply(envelope).await {
            warn!(job = %self.job, worker = %self.me, error = %e, "failed to send reply");
        }
    }

    fn spawn_reply(self: &Arc<Self>, reply: std::result::Result<Reply, ErrorReply>) {
        let this = self.clone();
        tokio::spawn(async move { this.reply(reply).await });
    }

    /// Re-dispatches `command` after the configured delay, or gives up with
    /// `on_exhausted` once the attempts are spent.
    fn requeue(self: &Arc<Self>, command: Command, attempt: u32, on_exhausted: PregelError) {
        if attempt >= self.config.max_requeues {
            warn!(
                job = %self.job,
                worker = %self.me,
                command = command.tag(),
                attempts = attempt,
                "giving up on re-queued command"
            );
            self.spawn_reply(Err(on_exhausted.to_reply()));
            return;
        }

        debug!(job = %self.job, worker = %self.me, command = command.tag(), attempt, "re-queue command");
        let this = self.clone();
        let delay = self.config.requeue_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.process(command, attempt + 1);
        });
    }

    fn process(self: &Arc<Self>, command: Command, attempt: u32) {
        let mut progress = self.lock_progress();

        if matches!(progress.state, WorkerState::CleaningUp | WorkerState::Cleaned) {
            drop(progress);
            match command {
                Command::Cleanup => self.spawn_reply(Ok(Reply::CleanupFinished)),
                other => {
                    debug!(job = %self.job, worker = %self.me, command = other.tag(), "command after cleanup");
                    self.spawn_reply(Err(PregelError::Canceled(self.job).to_reply()));
                }
            }
            return;
        }

        match command {
            Command::CreateWorker(_) => {
                drop(progress);
                self.spawn_reply(Err(PregelError::Protocol(format!(
                    "worker for job {} already exists",
                    self.job
                ))
                .to_reply()));
            }

            Command::LoadGraph(load) if !load.compensation => {
                if progress.state != WorkerState::Initial {
                    let state = progress.state;
                    drop(progress);
                    self.spawn_reply(Err(PregelError::Protocol(format!(
                        "load-graph in state {}",
                        state
                    ))
                    .to_reply()));
                    return;
                }
                progress.state = WorkerState::Loading;
                drop(progress);

                let this = self.clone();
                let plans = self.plans.clone();
                tokio::spawn(async move { this.load(plans, None, false).await });
            }

            Command::LoadGraph(load) => {
                if progress.running {
                    drop(progress);
                    self.requeue(
                        Command::LoadGraph(load),
                        attempt,
                        PregelError::Protocol("worker busy, compensation load refused".into()),
                    );
                    return;
                }
                if !matches!(progress.state, WorkerState::Loaded | WorkerState::Computing) {
                    let state = progress.state;
                    drop(progress);
                    self.spawn_reply(Err(PregelError::Protocol(format!(
                        "compensation load in state {}",
                        state
                    ))
                    .to_reply()));
                    return;
                }
                progress.state = WorkerState::Loading;
                drop(progress);

                let this = self.clone();
                tokio::spawn(async move { this.load(load.shards, load.routing, true).await });
            }

            Command::PrepareSuperstep { gss } => {
                let prepared = SuperstepPrepared {
                    gss: progress.next_gss,
                    pending_messages: self.buffers.for_gss(progress.next_gss).pending(),
                };
                drop(progress);
                debug!(job = %self.job, worker = %self.me, gss, local_gss = prepared.gss, "probed");
                self.spawn_reply(Ok(Reply::SuperstepPrepared(prepared)));
            }

            Command::RunSuperstep(run) => {
                if !matches!(progress.state, WorkerState::Loaded | WorkerState::Computing) {
                    let state = progress.state;
                    drop(progress);
                    self.spawn_reply(Err(PregelError::Protocol(format!(
                        "run-superstep {} in state {}",
                        run.gss, state
                    ))
                    .to_reply()));
                    return;
                }

                if run.compensation {
                    if progress.running {
                        drop(progress);
                        self.requeue(
                            Command::RunSuperstep(run),
                            attempt,
                            PregelError::Protocol("worker busy, compensation refused".into()),
                        );
                        return;
                    }
                    progress.state = WorkerState::Computing;
                    progress.running = true;
                    progress.next_gss = run.gss;
                    progress.last_report = None;
                    progress.skip_message_check = true;
                    drop(progress);

                    let this = self.clone();
                    tokio::spawn(async move { this.compute(run).await });
                    return;
                }

                let expected = progress.next_gss;
                if run.gss == expected && !progress.running {
                    progress.state = WorkerState::Computing;
                    progress.running = true;
                    drop(progress);

                    let this = self.clone();
                    tokio::spawn(async move { this.compute(run).await });
                } else if run.gss == expected && progress.running {
                    drop(progress);
                    warn!(job = %self.job, worker = %self.me, gss = run.gss, "duplicate run-superstep while computing");
                } else if run.gss == expected + 1 {
                    drop(progress);
                    let actual = run.gss;
                    self.requeue(
                        Command::RunSuperstep(run),
                        attempt,
                        PregelError::SuperstepMismatch { expected, actual },
                    );
                } else if run.gss + 1 == expected && progress.last_report.is_some() {
                    let report = progress.last_report.clone();
                    drop(progress);
                    debug!(job = %self.job, worker = %self.me, gss = run.gss, "resending superstep report");
                    if let Some(report) = report {
                        self.spawn_reply(Ok(Reply::SuperstepFinished(report)));
                    }
                } else {
                    drop(progress);
                    warn!(job = %self.job, worker = %self.me, expected, actual = run.gss, "superstep mismatch");
                    self.spawn_reply(Err(PregelError::SuperstepMismatch {
                        expected,
                        actual: run.gss,
                    }
                    .to_reply()));
                }
            }

            Command::Store => {
                if progress.running || progress.state == WorkerState::Loading {
                    drop(progress);
                    self.requeue(
                        Command::Store,
                        attempt,
                        PregelError::Protocol("worker busy, store refused".into()),
                    );
                    return;
                }
                if progress.state == WorkerState::Initial {
                    drop(progress);
                    self.spawn_reply(Err(PregelError::Protocol("store before load".into()).to_reply()));
                    return;
                }
                progress.state = WorkerState::Storing;
                drop(progress);

                let this = self.clone();
                tokio::spawn(async move { this.store().await });
            }

            Command::CollectResults { with_id } => {
                if progress.running || progress.state == WorkerState::Loading {
                    drop(progress);
                    self.requeue(
                        Command::CollectResults { with_id },
                        attempt,
                        PregelError::Protocol("worker busy, results refused".into()),
                    );
                    return;
                }
                progress.state = WorkerState::ProducingResults;
                drop(progress);

                let this = self.clone();
                tokio::spawn(async move { this.collect_results(with_id).await });
            }

            Command::Cleanup => {
                progress.state = WorkerState::CleaningUp;
                drop(progress);
                self.canceled.store(true, Ordering::Release);
                self.arrivals.notify_waiters();

                let this = self.clone();
                tokio::spawn(async move { this.cleanup().await });
            }
        }
    }

    async fn load(self: Arc<Self>, plans: Vec<ShardPlan>, routing: Option<Routing>, compensation: bool) {
        let now = Instant::now();
        if let Some(routing) = routing {
            *self.routing.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(routing);
        }

        let result = self.load_partitions(&plans).await;

        if compensation {
            self.buffers.clear();
            for partition in self.partitions_snapshot() {
                let mut partition = partition.lock().unwrap_or_else(PoisonError::into_inner);
                for vertex in partition.vertices.iter_mut() {
                    vertex.activate();
                }
            }
        }

        let reply = {
            let mut progress = self.lock_progress();
            if self.is_canceled() {
                return;
            }
            progress.state = WorkerState::Loaded;
            match result {
                Ok(loaded) => {
                    info!(
                        job = %self.job,
                        worker = %self.me,
                        shards = plans.len(),
                        vertices = loaded.vertex_count,
                        edges = loaded.edge_count,
                        compensation,
                        time_cost = now.elapsed().as_millis() as u64,
                        "graph loaded"
                    );
                    Ok(Reply::GraphLoaded(loaded))
                }
                Err(e) => {
                    error!(job = %self.job, worker = %self.me, error = %e, "loading failed");
                    Err(e.to_reply())
                }
            }
        };
        self.reply(reply).await;
    }

    async fn load_partitions(&self, plans: &[ShardPlan]) -> Result<GraphLoaded> {
        let mut loaded = GraphLoaded::default();
        for plan in plans {
            let shard = self.store.load(plan).await?;
            let partition = self.build_partition(plan, shard)?;

            loaded.vertex_count += partition.vertices.len() as u64;
            loaded.edge_count += partition.n_edges();

            self.buffers.add_shard(&plan.shard);
            self.partitions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::new(Mutex::new(partition)));
        }
        Ok(loaded)
    }

    fn build_partition(
        &self,
        plan: &ShardPlan,
        shard: crate::graph::LoadedShard,
    ) -> Result<Partition<A::Vertex, A::Edge>> {
        let routing = self.routing();
        let mut vertices = Vec::with_capacity(shard.vertices.len());
        let mut index = HashMap::with_capacity(shard.vertices.len());

        for document in shard.vertices {
            let value = self.algorithm.init_vertex(&document.key, &document.data)?;
            index.insert(document.key.clone(), vertices.len());
            vertices.push(Vertex::new(VertexId::new(plan.shard.clone(), document.key), value));
        }

        for edge in shard.edges {
            let Some((_, from_key)) = split_document_id(&edge.from) else {
                warn!(job = %self.job, shard = %plan.shard, from = %edge.from, "edge with invalid source");
                continue;
            };
            let Some(&source) = index.get(from_key) else {
                warn!(job = %self.job, shard = %plan.shard, from = %edge.from, "edge from unknown vertex");
                continue;
            };
            let Some((collection, key)) = split_document_id(&edge.to) else {
                warn!(job = %self.job, shard = %plan.shard, to = %edge.to, "edge with invalid target");
                continue;
            };
            let Some(shard) = routing.shard_for(collection, key) else {
                debug!(job = %self.job, to = %edge.to, "edge leaves the graph");
                continue;
            };

            let target = VertexId::new(shard.clone(), key);
            let vertex = &mut vertices[source];
            if vertex.has_edge_to(&target) {
                warn!(job = %self.job, from = %edge.from, to = %edge.to, "duplicate edge");
                continue;
            }
            let value = self.algorithm.init_edge(&edge.data)?;
            vertex.add_edge(target, value);
        }

        Ok(Partition {
            shard: plan.shard.clone(),
            collection: plan.collection.clone(),
            vertices,
        })
    }

    /// Blocks until `expected` messages for the superstep read from `read`
    /// have arrived.
    async fn wait_for_messages(&self, read: &InCache<A::Message>, expected: u64, gss: Gss) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.message_wait_timeout;
        loop {
            let notified = self.arrivals.notified();
            let received = read.received();
            if received >= expected {
                return Ok(());
            }
            if self.is_canceled() {
                return Err(PregelError::Canceled(self.job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PregelError::Timeout(format!(
                    "worker {} received {} of {} messages for superstep {}",
                    self.me, received, expected, gss
                )));
            }
        }
    }

    async fn compute(self: Arc<Self>, run: RunSuperstep) {
        let gss = run.gss;
        let compensation = run.compensation;
        let result = self.clone().run_superstep(run).await;

        let reply = {
            let mut progress = self.lock_progress();
            progress.running = false;
            if self.is_canceled() {
                return;
            }
            match result {
                Ok(finished) => {
                    if !compensation {
                        progress.next_gss = gss + 1;
                        progress.skip_message_check = false;
                        progress.last_report = Some(finished.clone());
                    }
                    Ok(Reply::SuperstepFinished(finished))
                }
                Err(e) => {
                    error!(job = %self.job, worker = %self.me, gss, error = %e, "superstep failed");
                    Err(e.to_reply())
                }
            }
        };
        self.reply(reply).await;
    }

    async fn run_superstep(self: Arc<Self>, run: RunSuperstep) -> Result<SuperstepFinished> {
        let now = Instant::now();
        let gss = run.gss;
        let epoch = run.epoch;
        let compensation = run.compensation;
        let read = self.buffers.for_gss(gss).clone();

        let skip = self.lock_progress().skip_message_check;
        if !compensation && !skip {
            let expected = run.expected_messages.get(&self.me).copied().unwrap_or(0);
            self.wait_for_messages(&read, expected, gss).await?;
        }
        let n_msg_recv = read.received();

        // Compensation rounds must not feed the regular buffers.
        let write = if compensation {
            Arc::new(InCache::new(std::iter::empty(), None))
        } else {
            self.buffers.for_gss(gss + 1).clone()
        };

        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pre_global_superstep(gss, &run.aggregators);

        let info = JobInfo {
            vertex_count: run.vertex_count,
            edge_count: run.edge_count,
        };
        let global = Arc::new(run.aggregators);
        let partitions = Arc::new(self.partitions_snapshot());
        let routing = self.routing();
        let next = Arc::new(AtomicUsize::new(0));

        let n_tasks = self.parallelism.min(partitions.len()).max(1);
        let tasks = (0..n_tasks).map(|_| {
            let this = self.clone();
            let global = global.clone();
            let partitions = partitions.clone();
            let routing = routing.clone();
            let next = next.clone();
            let read = read.clone();
            let write = write.clone();
            tokio::task::spawn_blocking(move || {
                this.compute_partitions(gss, info, &global, &partitions, &routing, &next, &read, &write, compensation)
            })
        });

        let mut total: TaskOutput<A::Message> = TaskOutput::default();
        for output in futures::future::join_all(tasks).await {
            let output = output.map_err(|e| PregelError::Algorithm(format!("compute task failed: {}", e)))??;
            total.n_msg_sent += output.n_msg_sent;
            total.n_active_vertices += output.n_active_vertices;
            self.aggregators
                .reduce_into(&mut total.aggregated_values, output.aggregated_values);
            total.batches.extend(output.batches);
            for (worker, count) in output.sent_to {
                *total.sent_to.entry(worker).or_insert(0) += count;
            }
        }

        if self.is_canceled() {
            return Err(PregelError::Canceled(self.job));
        }

        // Everything addressed to this superstep has been consumed.
        if !compensation {
            read.clear();
        }

        for (worker, messages) in total.batches {
            let messages = messages
                .into_iter()
                .map(|(target, message)| Ok((target, serde_json::to_value(message)?)))
                .collect::<Result<Vec<(VertexId, Value)>>>()?;
            let batch = MessageBatch {
                job: self.job,
                gss,
                sender: self.me.clone(),
                messages,
            };
            if let Err(e) = self.transport.send_messages(&worker, batch).await {
                warn!(job = %self.job, worker = %self.me, to = %worker, gss, error = %e, "failed to send messages");
            }
        }

        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .post_global_superstep(gss);

        let time_cost = now.elapsed().as_millis() as u64;
        let stats = SuperstepStats {
            sent: total.n_msg_sent,
            received: n_msg_recv,
            active_vertices: total.n_active_vertices,
            vertex_count: self.local_n_vertices(),
            edge_count: self.local_n_edges(),
            sent_to: total.sent_to,
            compute_millis: time_cost,
        };

        debug!(
            job = %self.job,
            worker = %self.me,
            gss,
            compensation,
            n_active_vertices = stats.active_vertices,
            msg_sent = stats.sent,
            msg_recv = stats.received,
            time_cost,
            "superstep computed"
        );

        Ok(SuperstepFinished {
            gss,
            epoch,
            compensation,
            stats,
            aggregators: total.aggregated_values,
        })
    }

    /// Body of one compute task: claims partitions until none is left.
    #[allow(clippy::too_many_arguments)]
    fn compute_partitions(
        &self,
        gss: Gss,
        info: JobInfo,
        global: &AggregatorValues,
        partitions: &[SharedPartition<A>],
        routing: &Arc<Routing>,
        next: &AtomicUsize,
        read: &InCache<A::Message>,
        write: &Arc<InCache<A::Message>>,
        compensation: bool,
    ) -> Result<TaskOutput<A::Message>> {
        let mut output = TaskOutput::default();

        loop {
            let index = next.fetch_add(1, Ordering::AcqRel);
            let Some(partition) = partitions.get(index) else {
                break;
            };
            if self.is_canceled() {
                break;
            }

            let mut partition = partition.lock().unwrap_or_else(PoisonError::into_inner);
            let mut mailbox = if compensation {
                HashMap::new()
            } else {
                read.take_shard(&partition.shard)
            };
            let mut out = OutCache::new(
                self.me.clone(),
                routing.clone(),
                write.clone(),
                self.combiner.clone(),
            );

            for (i, vertex) in partition.vertices.iter_mut().enumerate() {
                if i % CANCEL_CHECK_INTERVAL == 0 && i > 0 && self.is_canceled() {
                    break;
                }

                let messages = mailbox.remove(vertex.key()).unwrap_or_default();
                let mut ctx = ComputeContext::new(
                    gss,
                    info,
                    global,
                    &self.aggregators,
                    &mut output.aggregated_values,
                    &mut out,
                );

                if compensation {
                    self.algorithm.compensate(&mut ctx, vertex)?;
                } else {
                    if !messages.is_empty() {
                        vertex.activate();
                    }
                    if !vertex.active() {
                        continue;
                    }
                    self.algorithm.compute(&mut ctx, vertex, &messages)?;
                }

                if vertex.active() {
                    output.n_active_vertices += 1;
                }
            }

            let orphaned: usize = mailbox.values().map(Vec::len).sum();
            if orphaned > 0 {
                debug!(job = %self.job, shard = %partition.shard, gss, orphaned, "messages for unknown vertices");
            }

            if compensation {
                continue;
            }
            if out.undeliverable() > 0 {
                warn!(job = %self.job, shard = %partition.shard, gss, undeliverable = out.undeliverable(), "messages without owner");
            }

            let (batches, sent_to) = out.finish(self.batch_size);
            for (worker, count) in sent_to {
                output.n_msg_sent += count;
                *output.sent_to.entry(worker).or_insert(0) += count;
            }
            output.batches.extend(batches);
        }

        Ok(output)
    }

    async fn store(self: Arc<Self>) {
        let now = Instant::now();
        let mut result = Ok(());
        for partition in self.partitions_snapshot() {
            let (shard, values) = {
                let partition = partition.lock().unwrap_or_else(PoisonError::into_inner);
                let values: Vec<(String, Value)> = partition
                    .vertices
                    .iter()
                    .map(|v| (v.key().to_string(), self.algorithm.vertex_result(&v.value)))
                    .collect();
                (partition.shard.clone(), values)
            };
            if let Err(e) = self.store.store(&shard, &self.result_field, values).await {
                result = Err(e);
                break;
            }
        }

        let reply = {
            let mut progress = self.lock_progress();
            if self.is_canceled() {
                return;
            }
            progress.state = WorkerState::Stored;
            match result {
                Ok(()) => {
                    info!(job = %self.job, worker = %self.me, time_cost = now.elapsed().as_millis() as u64, "results stored");
                    Ok(Reply::Stored)
                }
                Err(e) => {
                    error!(job = %self.job, worker = %self.me, error = %e, "storing failed");
                    Err(e.to_reply())
                }
            }
        };
        self.reply(reply).await;
    }

    async fn collect_results(self: Arc<Self>, with_id: bool) {
        let mut results = VertexResults::default();
        for partition in self.partitions_snapshot() {
            let partition = partition.lock().unwrap_or_else(PoisonError::into_inner);
            for vertex in &partition.vertices {
                results.vertices.push(VertexResult {
                    key: vertex.key().to_string(),
                    id: with_id.then(|| format!("{}/{}", partition.collection, vertex.key())),
                    value: self.algorithm.vertex_result(&vertex.value),
                });
            }
        }

        {
            let mut progress = self.lock_progress();
            if self.is_canceled() {
                return;
            }
            progress.state = WorkerState::ResultsProduced;
        }
        self.reply(Ok(Reply::Results(results))).await;
    }

    async fn cleanup(self: Arc<Self>) {
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.buffers.clear();
        self.lock_progress().state = WorkerState::Cleaned;
        info!(job = %self.job, worker = %self.me, "worker cleaned up");
        self.reply(Ok(Reply::CleanupFinished)).await;
    }

    #[cfg(test)]
    fn next_gss(&self) -> Gss {
        self.lock_progress().next_gss
    }
}

impl<A: Algorithm> WorkerHandle for WorkerJob<A> {
    fn job(&self) -> JobId {
        self.job
    }

    fn algorithm(&self) -> &str {
        &self.algorithm_name
    }

    fn state(&self) -> WorkerState {
        self.lock_progress().state
    }

    fn dispatch(self: Arc<Self>, command: Command) {
        self.process(command, 0);
    }

    fn deliver(&self, batch: MessageBatch) -> Result<()> {
        if self.is_canceled() {
            return Ok(());
        }

        let next_gss = self.lock_progress().next_gss;
        if batch.gss != next_gss && batch.gss + 1 != next_gss {
            warn!(
                job = %self.job,
                worker = %self.me,
                from = %batch.sender,
                batch_gss = batch.gss,
                next_gss,
                "dropping stale message batch"
            );
            return Ok(());
        }

        let messages = batch
            .messages
            .into_iter()
            .map(|(target, value)| Ok((target, serde_json::from_value::<A::Message>(value)?)))
            .collect::<Result<Vec<_>>>()?;

        let dropped = self.buffers.for_gss(batch.gss + 1).store_batch(messages);
        if dropped > 0 {
            warn!(job = %self.job, worker = %self.me, from = %batch.sender, dropped, "messages for shards not resident here");
        }
        self.arrivals.notify_waiters();
        Ok(())
    }
}
