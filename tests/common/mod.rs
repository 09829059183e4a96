#![allow(dead_code)]

use pregel_cluster::{JobId, JobStatus, LocalCluster, MemoryGraph, PregelConfig, PregelService, VertexResult};

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub fn config() -> PregelConfig {
    PregelConfig::default()
        .with_rpc_timeout(Duration::from_secs(5))
        .with_message_wait_timeout(Duration::from_secs(5))
        .with_requeue(Duration::from_millis(20), 200)
        .with_parallelism(2)
        .with_batch_size(4)
}

pub fn cluster(config: PregelConfig, wire_encoding: bool) -> LocalCluster {
    LocalCluster::builder()
        .nodes(3)
        .config(config)
        .wire_encoding(wire_encoding)
        .build()
        .unwrap()
}

pub fn collections(graph: &MemoryGraph) {
    graph.create_vertex_collection("v").unwrap();
    graph.create_edge_collection("e").unwrap();
}

pub fn vertex(graph: &MemoryGraph, key: &str) {
    graph.insert_vertex("v", key, json!({})).unwrap();
}

pub fn edge(graph: &MemoryGraph, from: &str, to: &str, data: Value) {
    graph
        .insert_edge("e", &format!("v/{}", from), &format!("v/{}", to), data)
        .unwrap();
}

/// `n` vertices `k0..`, each linked to the next `strides` away.
pub fn ring(graph: &MemoryGraph, n: usize, strides: &[usize]) {
    collections(graph);
    for i in 0..n {
        vertex(graph, &format!("k{}", i));
    }
    for i in 0..n {
        for stride in strides {
            edge(graph, &format!("k{}", i), &format!("k{}", (i + stride) % n), Value::Null);
        }
    }
}

pub async fn settle(service: &PregelService, job: JobId) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(30), service.wait(job))
        .await
        .expect("job did not settle")
        .unwrap()
}

pub fn by_key(results: Vec<VertexResult>) -> BTreeMap<String, Value> {
    results.into_iter().map(|r| (r.key, r.value)).collect()
}

/// Polls `check` until it holds or two seconds passed.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
