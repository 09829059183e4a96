use crate::aggregator::{Aggregators, MaxAggregator};
use crate::algorithm::{param, Algorithm, ComputeContext, JobInfo, MasterContext};
use crate::combine::{Combine, SumCombiner};
use crate::error::{PregelError, Result};
use crate::message::{AggregatorValues, Gss, SuperstepStats, WorkerId};
use crate::vertex::Vertex;

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const CONVERGENCE: &str = "convergence";

/// PageRank over the out-edges of every vertex.
///
/// Parameters: `damping` (0.85), `max_iterations` (30) and `threshold`
/// (0.000002), the largest per-vertex change below which the computation
/// stops early.
#[derive(Debug, Clone)]
pub struct PageRank {
    damping: f64,
    max_iterations: Gss,
    threshold: f64,
}

impl PageRank {
    pub fn from_params(params: &Value) -> Result<Self> {
        let damping = param(params, "damping")?.unwrap_or(0.85);
        if !(0.0..=1.0).contains(&damping) {
            return Err(PregelError::InvalidParameters(format!(
                "damping must be within [0, 1], got {}",
                damping
            )));
        }
        Ok(PageRank {
            damping,
            max_iterations: param(params, "max_iterations")?.unwrap_or(30),
            threshold: param(params, "threshold")?.unwrap_or(0.000_002),
        })
    }
}

impl Algorithm for PageRank {
    type Vertex = f64;
    type Edge = ();
    type Message = f64;

    fn name(&self) -> &'static str {
        "pagerank"
    }

    fn init_vertex(&self, _key: &str, _document: &Value) -> Result<f64> {
        Ok(0.0)
    }

    fn init_edge(&self, _document: &Value) -> Result<()> {
        Ok(())
    }

    fn vertex_result(&self, vertex: &f64) -> Value {
        Value::from(*vertex)
    }

    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, f64>,
        vertex: &mut Vertex<f64, ()>,
        messages: &[f64],
    ) -> Result<()> {
        let n = ctx.num_vertices().max(1) as f64;
        let previous = vertex.value;

        if ctx.superstep() == 0 {
            vertex.value = 1.0 / n;
        } else {
            let sum: f64 = messages.iter().sum();
            vertex.value = (1.0 - self.damping) / n + self.damping * sum;
            ctx.aggregate(CONVERGENCE, Value::from((vertex.value - previous).abs()));
        }

        if ctx.superstep() >= self.max_iterations {
            vertex.deactivate();
            return Ok(());
        }

        let degree = vertex.out_degree();
        if degree > 0 {
            let share = vertex.value / degree as f64;
            let targets: Vec<_> = vertex.edges().iter().map(|e| e.target.clone()).collect();
            for target in &targets {
                ctx.send_message_to(target, share);
            }
        }
        Ok(())
    }

    /// Vertices reloaded from a lost worker start over from the uniform rank.
    fn compensate(&self, ctx: &mut ComputeContext<'_, f64>, vertex: &mut Vertex<f64, ()>) -> Result<()> {
        if vertex.value == 0.0 {
            vertex.value = 1.0 / ctx.num_vertices().max(1) as f64;
        }
        vertex.activate();
        Ok(())
    }

    fn combiner(&self) -> Option<Arc<dyn Combine<f64>>> {
        Some(Arc::new(SumCombiner))
    }

    fn aggregators(&self) -> Aggregators {
        let mut aggregators = Aggregators::new();
        aggregators.register(CONVERGENCE, Box::new(MaxAggregator));
        aggregators
    }

    fn master_context(&self) -> Box<dyn MasterContext> {
        Box::new(PageRankMaster {
            threshold: self.threshold,
        })
    }

    fn supports_compensation(&self) -> bool {
        true
    }
}

struct PageRankMaster {
    threshold: f64,
}

impl MasterContext for PageRankMaster {
    fn pre_application(&mut self, info: &JobInfo) {
        debug!(vertices = info.vertex_count, "pagerank starting");
    }

    fn post_global_superstep(
        &mut self,
        gss: Gss,
        aggregators: &mut AggregatorValues,
        _stats: &SuperstepStats,
    ) -> bool {
        let change = aggregators.get(CONVERGENCE).and_then(Value::as_f64);
        match change {
            Some(change) if gss > 0 && change < self.threshold => {
                info!(gss, change, "pagerank converged");
                false
            }
            _ => true,
        }
    }

    fn pre_compensation(&mut self, lost: &[WorkerId], info: &JobInfo) -> bool {
        info!(lost = lost.len(), vertices = info.vertex_count, "pagerank compensating");
        true
    }
}
