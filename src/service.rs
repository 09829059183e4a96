//! Submission API of a conductor node.
//!
//! [`PregelService`] turns submissions into conductors, routes worker
//! replies to them and reaps expired jobs in the background.

use crate::algorithm::AlgorithmRegistry;
use crate::conductor::{Conductor, Event, JobSetup, JobStatus};
use crate::config::{JobOptions, PregelConfig};
use crate::error::Result;
use crate::graph::{GraphSource, ShardLocator};
use crate::message::{JobId, ReplyEnvelope, VertexResult};
use crate::registry::JobRegistry;
use crate::transport::Transport;

use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct PregelService {
    config: PregelConfig,
    algorithms: AlgorithmRegistry,
    transport: Arc<dyn Transport>,
    locator: Arc<dyn ShardLocator>,
    registry: Arc<JobRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PregelService {
    /// Starts the reply pump on `replies` and the retention reaper. Must be
    /// called inside a tokio runtime.
    pub fn new(
        config: PregelConfig,
        algorithms: AlgorithmRegistry,
        transport: Arc<dyn Transport>,
        locator: Arc<dyn ShardLocator>,
        registry: Arc<JobRegistry>,
        replies: mpsc::UnboundedReceiver<ReplyEnvelope>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let pump = tokio::spawn(pump_replies(registry.clone(), replies));
        let reaper = tokio::spawn(reap_expired(registry.clone(), config.reap_interval));

        Ok(Arc::new(PregelService {
            config,
            algorithms,
            transport,
            locator,
            registry,
            tasks: Mutex::new(vec![pump, reaper]),
        }))
    }

    pub fn config(&self) -> &PregelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn submit(&self, algorithm: &str, source: GraphSource, options: JobOptions) -> Result<JobId> {
        options.validate()?;
        let factory = self.algorithms.get(algorithm)?;
        let plan = factory.master(&options.params)?;

        let id = self.registry.next_id();
        let conductor = Conductor::new(
            JobSetup {
                id,
                algorithm: factory.name().to_string(),
                plan,
                source,
                locator: self.locator.clone(),
                options,
                config: self.config.clone(),
            },
            self.transport.clone(),
            Arc::downgrade(&self.registry),
        );
        self.registry.insert(conductor.clone());
        info!(job = %id, algorithm = factory.name(), "job submitted");

        conductor.start();
        Ok(id)
    }

    pub fn status(&self, job: JobId) -> Result<JobStatus> {
        Ok(self.registry.get(job)?.status())
    }

    pub fn subscribe(&self, job: JobId) -> Result<watch::Receiver<JobStatus>> {
        Ok(self.registry.get(job)?.subscribe())
    }

    /// Waits until the job is settled and returns its final status.
    pub async fn wait(&self, job: JobId) -> Result<JobStatus> {
        let mut status = self.subscribe(job)?;
        loop {
            {
                let current = status.borrow_and_update();
                if current.settled {
                    return Ok(current.clone());
                }
            }
            // A dropped sender means the job was removed; its last status is final.
            if status.changed().await.is_err() {
                return Ok(status.borrow().clone());
            }
        }
    }

    pub fn cancel(&self, job: JobId) -> Result<()> {
        self.registry.get(job)?.cancel("canceled by request")
    }

    pub async fn results(&self, job: JobId, with_id: bool) -> Result<Vec<VertexResult>> {
        let conductor = self.registry.get(job)?;
        conductor.results(with_id).await
    }

    pub fn jobs(&self) -> Vec<JobId> {
        self.registry.jobs()
    }

    /// Reaps expired jobs now instead of waiting for the next sweep.
    pub fn reap(&self) -> Vec<JobId> {
        self.registry.reap(Utc::now())
    }

    /// Stops the background tasks. Jobs stay in the registry.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

impl Drop for PregelService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pump_replies(registry: Arc<JobRegistry>, mut replies: mpsc::UnboundedReceiver<ReplyEnvelope>) {
    while let Some(envelope) = replies.recv().await {
        let ReplyEnvelope { job, sender, reply } = envelope;
        match registry.get(job) {
            Ok(conductor) => conductor.handle(Event::Reply { sender, reply }),
            Err(_) => debug!(%job, worker = %sender, "reply for unknown job"),
        }
    }
    debug!("reply channel closed");
}

async fn reap_expired(registry: Arc<JobRegistry>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let reaped = registry.reap(Utc::now());
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped expired jobs");
        }
    }
}
