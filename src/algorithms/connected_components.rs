use crate::aggregator::{Aggregators, AnyAggregator};
use crate::algorithm::{Algorithm, ComputeContext};
use crate::error::Result;
use crate::message::VertexId;
use crate::vertex::Vertex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Weakly connected components. Every vertex ends up labeled with the
/// smallest key of its component.
///
/// Edges are directed, so superstep 0 introduces every vertex to its
/// out-neighbours and superstep 1 records the reverse edges; from then on
/// labels spread both ways.
#[derive(Debug, Clone, Default)]
pub struct ConnectedComponents;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Component {
    pub label: String,
    pub reverse: Vec<VertexId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentMessage {
    Hello(VertexId),
    Label(String),
}

impl ConnectedComponents {
    fn spread(ctx: &mut ComputeContext<'_, ComponentMessage>, vertex: &Vertex<Component, ()>) {
        let label = vertex.value.label.clone();
        let targets: Vec<VertexId> = vertex
            .edges()
            .iter()
            .map(|e| e.target.clone())
            .chain(vertex.value.reverse.iter().cloned())
            .collect();
        for target in &targets {
            ctx.send_message_to(target, ComponentMessage::Label(label.clone()));
        }
    }
}

impl Algorithm for ConnectedComponents {
    type Vertex = Component;
    type Edge = ();
    type Message = ComponentMessage;

    fn name(&self) -> &'static str {
        "connectedcomponents"
    }

    fn init_vertex(&self, key: &str, _document: &Value) -> Result<Component> {
        Ok(Component {
            label: key.to_string(),
            reverse: Vec::new(),
        })
    }

    fn init_edge(&self, _document: &Value) -> Result<()> {
        Ok(())
    }

    fn vertex_result(&self, vertex: &Component) -> Value {
        Value::from(vertex.label.as_str())
    }

    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, ComponentMessage>,
        vertex: &mut Vertex<Component, ()>,
        messages: &[ComponentMessage],
    ) -> Result<()> {
        match ctx.superstep() {
            0 => {
                let me = vertex.id().clone();
                let targets: Vec<VertexId> = vertex.edges().iter().map(|e| e.target.clone()).collect();
                for target in &targets {
                    ctx.send_message_to(target, ComponentMessage::Hello(me.clone()));
                }
            }
            1 => {
                for message in messages {
                    if let ComponentMessage::Hello(from) = message {
                        if !vertex.value.reverse.contains(from) && !vertex.has_edge_to(from) {
                            vertex.value.reverse.push(from.clone());
                        }
                    }
                }
                Self::spread(ctx, vertex);
            }
            _ => {
                let smallest = messages
                    .iter()
                    .filter_map(|message| match message {
                        ComponentMessage::Label(label) => Some(label),
                        ComponentMessage::Hello(_) => None,
                    })
                    .min();
                if let Some(label) = smallest {
                    if *label < vertex.value.label {
                        vertex.value.label = label.clone();
                        ctx.aggregate("changed", Value::Bool(true));
                        Self::spread(ctx, vertex);
                    }
                }
            }
        }

        if ctx.superstep() > 0 {
            vertex.deactivate();
        }
        Ok(())
    }

    fn aggregators(&self) -> Aggregators {
        let mut aggregators = Aggregators::new();
        aggregators.register("changed", Box::new(AnyAggregator));
        aggregators
    }
}
