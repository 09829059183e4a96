//! The pluggable algorithm strategy and the registry mapping algorithm names
//! to factories.

use crate::aggregator::Aggregators;
use crate::buffer::OutCache;
use crate::combine::Combine;
use crate::error::{PregelError, Result};
use crate::message::{AggregatorValues, Gss, SuperstepStats, VertexId, WorkerId};
use crate::vertex::Vertex;
use crate::worker::{WorkerHandle, WorkerJob, WorkerSetup};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Totals known once the graph is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobInfo {
    pub vertex_count: u64,
    pub edge_count: u64,
}

/// What a vertex sees while it is computed.
pub struct ComputeContext<'a, M> {
    gss: Gss,
    info: JobInfo,
    global: &'a AggregatorValues,
    aggregators: &'a Aggregators,
    local: &'a mut AggregatorValues,
    outbox: &'a mut OutCache<M>,
}

impl<'a, M> ComputeContext<'a, M> {
    pub(crate) fn new(
        gss: Gss,
        info: JobInfo,
        global: &'a AggregatorValues,
        aggregators: &'a Aggregators,
        local: &'a mut AggregatorValues,
        outbox: &'a mut OutCache<M>,
    ) -> Self {
        ComputeContext {
            gss,
            info,
            global,
            aggregators,
            local,
            outbox,
        }
    }

    pub fn superstep(&self) -> Gss {
        self.gss
    }

    pub fn num_vertices(&self) -> u64 {
        self.info.vertex_count
    }

    pub fn num_edges(&self) -> u64 {
        self.info.edge_count
    }

    pub fn send_message_to(&mut self, target: &VertexId, message: M) {
        self.outbox.send(target, message);
    }

    /// Reports `value` into the aggregator `name` for this superstep.
    pub fn aggregate(&mut self, name: &str, value: Value) {
        self.aggregators.report(self.local, name, value);
    }

    /// Value of aggregator `name` as of the end of the previous superstep.
    pub fn aggregated_value(&self, name: &str) -> Option<&Value> {
        self.global.get(name)
    }
}

/// Hooks run once per worker around every superstep.
pub trait WorkerContext: Send {
    fn pre_global_superstep(&mut self, _gss: Gss, _aggregators: &AggregatorValues) {}

    fn post_global_superstep(&mut self, _gss: Gss) {}
}

pub struct NoopWorkerContext;

impl WorkerContext for NoopWorkerContext {}

/// Hooks run on the conductor.
pub trait MasterContext: Send {
    /// Called once the graph is loaded and the totals are known.
    fn pre_application(&mut self, _info: &JobInfo) {}

    /// Called before superstep `gss` is broadcast; may set aggregator values
    /// the vertices will read.
    fn pre_global_superstep(&mut self, _gss: Gss, _aggregators: &mut AggregatorValues) {}

    /// Called when every worker has finished `gss`. Returning false ends the
    /// computation.
    fn post_global_superstep(
        &mut self,
        _gss: Gss,
        _aggregators: &mut AggregatorValues,
        _stats: &SuperstepStats,
    ) -> bool {
        true
    }

    /// Called when workers were lost. Returning false cancels the job.
    fn pre_compensation(&mut self, _lost: &[WorkerId], _info: &JobInfo) -> bool {
        true
    }

    /// Called after each compensation round. Returning true runs another
    /// round.
    fn post_compensation(&mut self, _round: u64, _aggregators: &AggregatorValues) -> bool {
        false
    }

    fn post_application(&mut self) {}
}

pub struct DefaultMasterContext;

impl MasterContext for DefaultMasterContext {}

/// A vertex-centric graph algorithm.
pub trait Algorithm: Send + Sync + 'static {
    type Vertex: Clone + Send + Sync + 'static;
    type Edge: Send + Sync + 'static;
    type Message: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;

    fn name(&self) -> &'static str;

    /// Initial vertex value from its stored document.
    fn init_vertex(&self, key: &str, document: &Value) -> Result<Self::Vertex>;

    fn init_edge(&self, document: &Value) -> Result<Self::Edge>;

    /// Value reported in results and written back on store.
    fn vertex_result(&self, vertex: &Self::Vertex) -> Value;

    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, Self::Message>,
        vertex: &mut Vertex<Self::Vertex, Self::Edge>,
        messages: &[Self::Message],
    ) -> Result<()>;

    /// Compensation step run on every vertex after workers were lost.
    fn compensate(
        &self,
        _ctx: &mut ComputeContext<'_, Self::Message>,
        _vertex: &mut Vertex<Self::Vertex, Self::Edge>,
    ) -> Result<()> {
        Ok(())
    }

    fn combiner(&self) -> Option<Arc<dyn Combine<Self::Message>>> {
        None
    }

    fn aggregators(&self) -> Aggregators {
        Aggregators::new()
    }

    fn worker_context(&self) -> Box<dyn WorkerContext> {
        Box::new(NoopWorkerContext)
    }

    fn master_context(&self) -> Box<dyn MasterContext> {
        Box::new(DefaultMasterContext)
    }

    fn supports_compensation(&self) -> bool {
        false
    }
}

/// Conductor-side pieces of an algorithm.
pub struct MasterPlan {
    pub context: Box<dyn MasterContext>,
    pub aggregators: Arc<Aggregators>,
    pub supports_compensation: bool,
}

/// Type-erased constructor of an algorithm's conductor and worker sides.
pub trait AlgorithmFactory: Send + Sync {
    fn name(&self) -> &str;

    fn master(&self, params: &Value) -> Result<MasterPlan>;

    fn worker(&self, setup: WorkerSetup) -> Result<Arc<dyn WorkerHandle>>;
}

struct Registration<A, F> {
    name: String,
    build: F,
    _algorithm: std::marker::PhantomData<fn() -> A>,
}

impl<A, F> AlgorithmFactory for Registration<A, F>
where
    A: Algorithm,
    F: Fn(&Value) -> Result<A> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn master(&self, params: &Value) -> Result<MasterPlan> {
        let algorithm = (self.build)(params)?;
        Ok(MasterPlan {
            context: algorithm.master_context(),
            aggregators: Arc::new(algorithm.aggregators()),
            supports_compensation: algorithm.supports_compensation(),
        })
    }

    fn worker(&self, setup: WorkerSetup) -> Result<Arc<dyn WorkerHandle>> {
        let algorithm = (self.build)(&setup.create.params)?;
        let worker: Arc<dyn WorkerHandle> = WorkerJob::new(Arc::new(algorithm), setup);
        Ok(worker)
    }
}

/// Maps algorithm names to factories. New algorithms are added with
/// [`AlgorithmRegistry::register`]; nothing else needs to know about them.
#[derive(Default, Clone)]
pub struct AlgorithmRegistry {
    factories: BTreeMap<String, Arc<dyn AlgorithmFactory>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        AlgorithmRegistry::default()
    }

    /// Registry with the algorithms shipped in [`crate::algorithms`].
    pub fn with_defaults() -> Self {
        let mut registry = AlgorithmRegistry::new();
        crate::algorithms::register_defaults(&mut registry);
        registry
    }

    pub fn register<A, F>(&mut self, name: impl Into<String>, build: F) -> &mut Self
    where
        A: Algorithm,
        F: Fn(&Value) -> Result<A> + Send + Sync + 'static,
    {
        let name = name.into().to_lowercase();
        self.factories.insert(
            name.clone(),
            Arc::new(Registration {
                name,
                build,
                _algorithm: std::marker::PhantomData,
            }),
        );
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AlgorithmFactory>> {
        self.factories
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| PregelError::UnknownAlgorithm(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }
}

/// Reads an optional parameter from the algorithm parameters object.
pub fn param<T: DeserializeOwned>(params: &Value, name: &str) -> Result<Option<T>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| PregelError::InvalidParameters(format!("{}: {}", name, e))),
    }
}
