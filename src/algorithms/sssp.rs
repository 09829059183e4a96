use crate::aggregator::{Aggregators, MinAggregator};
use crate::algorithm::{param, Algorithm, ComputeContext};
use crate::combine::{Combine, MinCombiner};
use crate::error::{PregelError, Result};
use crate::graph::split_document_id;
use crate::vertex::Vertex;

use serde_json::Value;
use std::sync::Arc;

const UNREACHED: u64 = u64::MAX;

/// Smallest distance improved in a superstep; null once nothing moves.
pub const FRONTIER: &str = "frontier";

/// Single-source shortest paths with non-negative integer edge weights.
///
/// `source` names the start vertex, either as `collection/key` or as a bare
/// key. Edges carry their weight in `weight` (1 when absent).
#[derive(Debug, Clone)]
pub struct ShortestPath {
    source: String,
}

impl ShortestPath {
    pub fn from_params(params: &Value) -> Result<Self> {
        let source: String = param(params, "source")?
            .ok_or_else(|| PregelError::InvalidParameters("source is required".into()))?;
        let key = match split_document_id(&source) {
            Some((_, key)) => key.to_string(),
            None if !source.is_empty() && !source.contains('/') => source,
            None => {
                return Err(PregelError::InvalidParameters(format!(
                    "invalid source '{}'",
                    source
                )))
            }
        };
        Ok(ShortestPath { source: key })
    }
}

impl Algorithm for ShortestPath {
    type Vertex = u64;
    type Edge = u64;
    type Message = u64;

    fn name(&self) -> &'static str {
        "sssp"
    }

    fn init_vertex(&self, key: &str, _document: &Value) -> Result<u64> {
        Ok(if key == self.source { 0 } else { UNREACHED })
    }

    fn init_edge(&self, document: &Value) -> Result<u64> {
        match document.get("weight") {
            None | Some(Value::Null) => Ok(1),
            Some(weight) => weight
                .as_u64()
                .ok_or_else(|| PregelError::Algorithm(format!("invalid edge weight {}", weight))),
        }
    }

    fn vertex_result(&self, vertex: &u64) -> Value {
        if *vertex == UNREACHED {
            Value::Null
        } else {
            Value::from(*vertex)
        }
    }

    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, u64>,
        vertex: &mut Vertex<u64, u64>,
        messages: &[u64],
    ) -> Result<()> {
        let min = messages.iter().copied().min().unwrap_or(UNREACHED);
        let improved = min < vertex.value;
        if improved {
            vertex.value = min;
            ctx.aggregate(FRONTIER, Value::from(min));
        }

        let start = ctx.superstep() == 0 && vertex.value == 0;
        if improved || start {
            let distance = vertex.value;
            let targets: Vec<_> = vertex
                .edges()
                .iter()
                .map(|e| (e.target.clone(), distance.saturating_add(e.value)))
                .collect();
            for (target, distance) in &targets {
                ctx.send_message_to(target, *distance);
            }
        }

        vertex.deactivate();
        Ok(())
    }

    fn combiner(&self) -> Option<Arc<dyn Combine<u64>>> {
        Some(Arc::new(MinCombiner))
    }

    fn aggregators(&self) -> Aggregators {
        let mut aggregators = Aggregators::new();
        aggregators.register(FRONTIER, Box::new(MinAggregator));
        aggregators
    }
}
