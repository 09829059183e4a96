//! Algorithms shipped with the crate.

mod connected_components;
mod page_rank;
mod sssp;

pub use connected_components::{Component, ComponentMessage, ConnectedComponents};
pub use page_rank::PageRank;
pub use sssp::ShortestPath;

use crate::algorithm::AlgorithmRegistry;

pub fn register_defaults(registry: &mut AlgorithmRegistry) {
    registry
        .register("pagerank", PageRank::from_params)
        .register("sssp", ShortestPath::from_params)
        .register("connectedcomponents", |_: &serde_json::Value| Ok(ConnectedComponents));
}
