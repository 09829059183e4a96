//! An in-process cluster: N worker nodes, one conductor service and a
//! memory graph sharded over the nodes, wired with [`LocalTransport`].

use crate::algorithm::AlgorithmRegistry;
use crate::config::PregelConfig;
use crate::error::{PregelError, Result};
use crate::graph::MemoryGraph;
use crate::message::WorkerId;
use crate::node::WorkerHost;
use crate::registry::JobRegistry;
use crate::service::PregelService;
use crate::transport::LocalTransport;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct LocalClusterBuilder {
    nodes: usize,
    shards: Option<usize>,
    config: PregelConfig,
    algorithms: AlgorithmRegistry,
    registry: Option<Arc<JobRegistry>>,
    wire_encoding: bool,
}

impl Default for LocalClusterBuilder {
    fn default() -> Self {
        LocalClusterBuilder {
            nodes: 3,
            shards: None,
            config: PregelConfig::default(),
            algorithms: AlgorithmRegistry::with_defaults(),
            registry: None,
            wire_encoding: false,
        }
    }
}

impl LocalClusterBuilder {
    pub fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    /// Shards per collection; one per node when not set.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn config(mut self, config: PregelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn algorithms(mut self, algorithms: AlgorithmRegistry) -> Self {
        self.algorithms = algorithms;
        self
    }

    pub fn registry(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Round-trip every envelope through JSON.
    pub fn wire_encoding(mut self, wire_encoding: bool) -> Self {
        self.wire_encoding = wire_encoding;
        self
    }

    /// Starts the nodes and the service. Must be called inside a tokio
    /// runtime.
    pub fn build(self) -> Result<LocalCluster> {
        if self.nodes == 0 {
            return Err(PregelError::Config("a cluster needs at least one node".into()));
        }
        self.config.validate()?;

        let ids: Vec<WorkerId> = (0..self.nodes)
            .map(|i| WorkerId::from(format!("node-{}", i)))
            .collect();
        let graph = Arc::new(MemoryGraph::new(ids.clone(), self.shards.unwrap_or(self.nodes)));
        let transport = Arc::new(LocalTransport::new(self.wire_encoding));

        let mut nodes = Vec::with_capacity(ids.len());
        let mut tasks = Vec::with_capacity(ids.len());
        for id in &ids {
            let inbox = transport.connect_node(id.clone());
            let host = WorkerHost::new(
                id.clone(),
                self.algorithms.clone(),
                transport.clone(),
                graph.clone(),
                self.config.clone(),
            );
            tasks.push(host.clone().spawn(inbox));
            nodes.push(host);
        }

        let replies = transport.connect_conductor();
        let service = PregelService::new(
            self.config,
            self.algorithms,
            transport.clone(),
            graph.clone(),
            self.registry.unwrap_or_else(JobRegistry::new),
            replies,
        )?;
        info!(nodes = ids.len(), wire_encoding = self.wire_encoding, "local cluster started");

        Ok(LocalCluster {
            graph,
            transport,
            service,
            nodes,
            tasks,
        })
    }
}

pub struct LocalCluster {
    graph: Arc<MemoryGraph>,
    transport: Arc<LocalTransport>,
    service: Arc<PregelService>,
    nodes: Vec<Arc<WorkerHost>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    pub fn builder() -> LocalClusterBuilder {
        LocalClusterBuilder::default()
    }

    pub fn graph(&self) -> &Arc<MemoryGraph> {
        &self.graph
    }

    pub fn service(&self) -> &Arc<PregelService> {
        &self.service
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn nodes(&self) -> &[Arc<WorkerHost>] {
        &self.nodes
    }

    pub fn node(&self, id: &WorkerId) -> Option<&Arc<WorkerHost>> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    pub fn node_ids(&self) -> Vec<WorkerId> {
        self.nodes.iter().map(|node| node.id().clone()).collect()
    }

    /// Worker jobs still alive over all nodes.
    pub fn live_workers(&self) -> usize {
        self.nodes.iter().map(|node| node.job_count()).sum()
    }

    pub fn shutdown(&mut self) {
        self.service.shutdown();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
