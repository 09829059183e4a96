//! A cluster node: receives packets and hands them to the worker of the
//! job they belong to.

use crate::algorithm::AlgorithmRegistry;
use crate::config::PregelConfig;
use crate::error::{PregelError, Result};
use crate::graph::GraphStore;
use crate::message::{
    Command, CommandEnvelope, CreateWorker, ErrorReply, JobId, MessageBatch, Reply, ReplyEnvelope,
    WorkerId,
};
use crate::transport::{Packet, Transport};
use crate::worker::{WorkerHandle, WorkerSetup, WorkerState};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct WorkerHost {
    id: WorkerId,
    registry: AlgorithmRegistry,
    transport: Arc<dyn Transport>,
    store: Arc<dyn GraphStore>,
    config: PregelConfig,
    jobs: RwLock<HashMap<JobId, Arc<dyn WorkerHandle>>>,
}

impl WorkerHost {
    pub fn new(
        id: WorkerId,
        registry: AlgorithmRegistry,
        transport: Arc<dyn Transport>,
        store: Arc<dyn GraphStore>,
        config: PregelConfig,
    ) -> Arc<Self> {
        Arc::new(WorkerHost {
            id,
            registry,
            transport,
            store,
            config,
            jobs: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Number of jobs with a live worker on this node.
    pub fn job_count(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn worker_state(&self, job: JobId) -> Option<WorkerState> {
        self.worker(job).map(|w| w.state())
    }

    fn worker(&self, job: JobId) -> Option<Arc<dyn WorkerHandle>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job)
            .cloned()
    }

    /// Serves the node's inbox until the transport drops it.
    pub fn spawn(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Packet>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(packet) = inbox.recv().await {
                self.handle(packet);
            }
            debug!(node = %self.id, "inbox closed");
        })
    }

    pub fn handle(&self, packet: Packet) {
        match packet {
            Packet::Command(envelope) => self.handle_command(envelope),
            Packet::Messages(batch) => self.handle_messages(batch),
        }
    }

    fn handle_command(&self, envelope: CommandEnvelope) {
        let CommandEnvelope { job, command } = envelope;

        match command {
            Command::CreateWorker(create) => {
                let reply = self.create_worker(job, create).map(|_| Reply::WorkerCreated);
                self.reply(job, reply.map_err(|e| e.to_reply()));
            }
            Command::Cleanup => {
                let worker = self
                    .jobs
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&job);
                match worker {
                    Some(worker) => worker.dispatch(Command::Cleanup),
                    // Already gone: acknowledge so cleanup retries settle.
                    None => self.reply(job, Ok(Reply::CleanupFinished)),
                }
            }
            command => match self.worker(job) {
                Some(worker) => worker.dispatch(command),
                None => {
                    debug!(node = %self.id, %job, command = command.tag(), "command for unknown job");
                    self.reply(job, Err(PregelError::JobNotFound(job).to_reply()));
                }
            },
        }
    }

    fn create_worker(&self, job: JobId, create: CreateWorker) -> Result<()> {
        if self.worker(job).is_some() {
            return Err(PregelError::Protocol(format!(
                "worker for job {} already exists on {}",
                job, self.id
            )));
        }

        let factory = self.registry.get(&create.algorithm)?;
        let algorithm = create.algorithm.clone();
        let shards = create.shards.len();
        let worker = factory.worker(WorkerSetup {
            job,
            me: self.id.clone(),
            create,
            transport: self.transport.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
        })?;

        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job, worker);
        info!(node = %self.id, %job, algorithm = %algorithm, shards, "worker created");
        Ok(())
    }

    fn handle_messages(&self, batch: MessageBatch) {
        let Some(worker) = self.worker(batch.job) else {
            debug!(node = %self.id, job = %batch.job, "messages for unknown job");
            return;
        };
        let job = batch.job;
        if let Err(e) = worker.deliver(batch) {
            warn!(node = %self.id, %job, error = %e, "failed to deliver messages");
        }
    }

    fn reply(&self, job: JobId, reply: std::result::Result<Reply, ErrorReply>) {
        let transport = self.transport.clone();
        let envelope = ReplyEnvelope {
            job,
            sender: self.id.clone(),
            reply,
        };
        tokio::spawn(async move {
            if let Err(e) = transport.send_reply(envelope).await {
                warn!(error = %e, "failed to send reply");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::message::{ErrorCode, Routing};
    use crate::transport::LocalTransport;
    use serde_json::json;

    fn host() -> (Arc<WorkerHost>, mpsc::UnboundedReceiver<ReplyEnvelope>) {
        let id = WorkerId::from("node-0");
        let transport = Arc::new(LocalTransport::new(false));
        let replies = transport.connect_conductor();
        let graph = Arc::new(MemoryGraph::new(vec![id.clone()], 1));
        let host = WorkerHost::new(
            id,
            AlgorithmRegistry::with_defaults(),
            transport,
            graph,
            PregelConfig::default(),
        );
        (host, replies)
    }

    fn create(algorithm: &str) -> Command {
        Command::CreateWorker(CreateWorker {
            algorithm: algorithm.into(),
            params: json!({}),
            shards: Vec::new(),
            routing: Routing::default(),
            parallelism: 1,
            batch_size: 10,
            result_field: "result".into(),
        })
    }

    fn envelope(job: u64, command: Command) -> Packet {
        Packet::Command(CommandEnvelope {
            job: JobId(job),
            command,
        })
    }

    #[tokio::test]
    async fn test_create_and_cleanup() {
        let (host, mut replies) = host();

        host.handle(envelope(1, create("pagerank")));
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.reply, Ok(Reply::WorkerCreated));
        assert_eq!(host.job_count(), 1);
        assert_eq!(host.worker_state(JobId(1)), Some(WorkerState::Initial));

        host.handle(envelope(1, create("pagerank")));
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.reply.unwrap_err().code, ErrorCode::Protocol);

        host.handle(envelope(1, Command::Cleanup));
        assert_eq!(replies.recv().await.unwrap().reply, Ok(Reply::CleanupFinished));
        assert_eq!(host.job_count(), 0);

        host.handle(envelope(1, Command::Cleanup));
        assert_eq!(replies.recv().await.unwrap().reply, Ok(Reply::CleanupFinished));
    }

    #[tokio::test]
    async fn test_unknown_algorithm_and_job() {
        let (host, mut replies) = host();

        host.handle(envelope(2, create("no-such-thing")));
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.reply.unwrap_err().code, ErrorCode::BadParameter);

        host.handle(envelope(3, Command::Store));
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.reply.unwrap_err().code, ErrorCode::UnknownJob);
    }
}
