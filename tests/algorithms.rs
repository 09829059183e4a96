mod common;

use common::*;
use pregel_cluster::algorithm::ComputeContext;
use pregel_cluster::{
    Algorithm, AlgorithmRegistry, GraphSource, JobOptions, LocalCluster, PhaseName, PregelError, Result, Vertex,
};

use serde_json::{json, Value};
use std::time::Duration;

fn source() -> GraphSource {
    GraphSource::new(["v"], ["e"])
}

async fn pagerank_on_ring(wire_encoding: bool) {
    let cluster = cluster(config(), wire_encoding);
    ring(cluster.graph(), 6, &[1, 2]);
    let service = cluster.service();

    let job = service.submit("PageRank", source(), JobOptions::default()).unwrap();
    let status = settle(service, job).await;
    assert_eq!(status.phase, PhaseName::Done);
    assert_eq!((status.vertex_count, status.edge_count), (6, 12));
    assert!(status.passed_through(PhaseName::Loading));
    assert!(status.messages_sent > 0);

    let ranks = by_key(service.results(job, false).await.unwrap());
    assert_eq!(ranks.len(), 6);
    for rank in ranks.values() {
        assert!((rank.as_f64().unwrap() - 1.0 / 6.0).abs() < 1e-6);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pagerank_in_memory() {
    pagerank_on_ring(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pagerank_over_the_wire() {
    pagerank_on_ring(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shortest_paths() {
    for wire_encoding in [false, true] {
        let cluster = cluster(config(), wire_encoding);
        let graph = cluster.graph();
        collections(graph);
        for key in ["a", "b", "c", "d", "e"] {
            vertex(graph, key);
        }
        edge(graph, "a", "b", json!({ "weight": 1 }));
        edge(graph, "b", "c", json!({ "weight": 2 }));
        edge(graph, "c", "d", json!({ "weight": 3 }));
        edge(graph, "a", "d", json!({ "weight": 10 }));

        let service = cluster.service();
        let options = JobOptions::default().with_params(json!({ "source": "v/a" }));
        let job = service.submit("sssp", source(), options).unwrap();
        let status = settle(service, job).await;
        assert_eq!(status.phase, PhaseName::Done);
        // d is the last vertex to improve, through c.
        assert_eq!(status.aggregators.get("frontier"), Some(&json!(6)));

        let distances = by_key(service.results(job, false).await.unwrap());
        assert_eq!(distances["a"], json!(0));
        assert_eq!(distances["b"], json!(1));
        assert_eq!(distances["c"], json!(3));
        assert_eq!(distances["d"], json!(6));
        assert_eq!(distances["e"], Value::Null);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connected_components() {
    let cluster = cluster(config(), true);
    let graph = cluster.graph();
    collections(graph);
    for key in ["a", "b", "c", "d", "e", "f"] {
        vertex(graph, key);
    }
    edge(graph, "a", "b", Value::Null);
    edge(graph, "c", "b", Value::Null);
    edge(graph, "e", "d", Value::Null);

    let service = cluster.service();
    let job = service.submit("connectedcomponents", source(), JobOptions::default()).unwrap();
    assert_eq!(settle(service, job).await.phase, PhaseName::Done);

    let labels = by_key(service.results(job, false).await.unwrap());
    for key in ["a", "b", "c"] {
        assert_eq!(labels[key], json!("a"));
    }
    assert_eq!(labels["d"], json!("d"));
    assert_eq!(labels["e"], json!("d"));
    assert_eq!(labels["f"], json!("f"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_with_ids_and_release() {
    let cluster = cluster(config(), false);
    ring(cluster.graph(), 9, &[1]);
    let service = cluster.service();

    let job = service.submit("pagerank", source(), JobOptions::default()).unwrap();
    settle(service, job).await;

    let results = service.results(job, true).await.unwrap();
    assert_eq!(results.len(), 9);
    for result in &results {
        assert_eq!(result.id.as_deref(), Some(format!("v/{}", result.key).as_str()));
    }

    // Served from the staged copy once the workers are gone.
    assert!(eventually(|| cluster.live_workers() == 0).await);
    let again = service.results(job, false).await.unwrap();
    assert_eq!(again.len(), 9);
    assert!(again.iter().all(|r| r.id.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_writes_documents() {
    let cluster = cluster(config(), false);
    ring(cluster.graph(), 6, &[1, 2]);
    let service = cluster.service();

    let options = JobOptions::default().with_store(true).with_result_field("rank");
    let job = service.submit("pagerank", source(), options).unwrap();
    let status = settle(service, job).await;
    assert_eq!(status.phase, PhaseName::Done);
    assert!(status.passed_through(PhaseName::Storing));
    assert_eq!(status.vertex_count, 6);

    for i in 0..6 {
        let document = cluster.graph().document("v", &format!("k{}", i)).unwrap();
        assert!((document["rank"].as_f64().unwrap() - 1.0 / 6.0).abs() < 1e-6);
    }
    assert_eq!(cluster.live_workers(), 0);
    assert!(matches!(
        service.results(job, false).await,
        Err(PregelError::ResultsUnavailable { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_gss_limits_the_run() {
    let cluster = cluster(config(), false);
    ring(cluster.graph(), 6, &[1, 2]);
    let service = cluster.service();

    let options = JobOptions::default()
        .with_max_gss(3)
        .with_params(json!({ "threshold": 0.0 }));
    let job = service.submit("pagerank", source(), options).unwrap();
    let status = settle(service, job).await;
    assert_eq!(status.phase, PhaseName::Done);
    assert_eq!(status.gss, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_jobs_are_reaped() {
    let config = config()
        .with_retention(Duration::ZERO)
        .with_reap_interval(Duration::from_millis(20));
    let cluster = cluster(config, false);
    ring(cluster.graph(), 3, &[1]);
    let service = cluster.service();

    let job = service.submit("pagerank", source(), JobOptions::default()).unwrap();
    settle(service, job).await;
    assert!(eventually(|| service.jobs().is_empty()).await);
    assert!(matches!(service.status(job), Err(PregelError::JobNotFound(_))));
    assert!(eventually(|| cluster.live_workers() == 0).await);
}

/// Counts incoming edges.
struct InDegree;

impl Algorithm for InDegree {
    type Vertex = u64;
    type Edge = ();
    type Message = u64;

    fn name(&self) -> &'static str {
        "indegree"
    }

    fn init_vertex(&self, _key: &str, _document: &Value) -> Result<u64> {
        Ok(0)
    }

    fn init_edge(&self, _document: &Value) -> Result<()> {
        Ok(())
    }

    fn vertex_result(&self, vertex: &u64) -> Value {
        Value::from(*vertex)
    }

    fn compute(&self, ctx: &mut ComputeContext<'_, u64>, vertex: &mut Vertex<u64, ()>, messages: &[u64]) -> Result<()> {
        if ctx.superstep() == 0 {
            let targets: Vec<_> = vertex.edges().iter().map(|e| e.target.clone()).collect();
            for target in &targets {
                ctx.send_message_to(target, 1);
            }
        } else {
            vertex.value += messages.iter().sum::<u64>();
        }
        vertex.deactivate();
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registered_algorithm_runs() {
    let mut algorithms = AlgorithmRegistry::with_defaults();
    algorithms.register("indegree", |_: &Value| Ok(InDegree));

    let cluster = LocalCluster::builder()
        .nodes(2)
        .shards(4)
        .config(config())
        .algorithms(algorithms)
        .build()
        .unwrap();
    let graph = cluster.graph();
    collections(graph);
    for key in ["hub", "x", "y", "z"] {
        vertex(graph, key);
    }
    for key in ["x", "y", "z"] {
        edge(graph, key, "hub", Value::Null);
    }
    edge(graph, "hub", "x", Value::Null);

    let service = cluster.service();
    let job = service.submit("InDegree", source(), JobOptions::default()).unwrap();
    assert_eq!(settle(service, job).await.phase, PhaseName::Done);

    let degrees = by_key(service.results(job, false).await.unwrap());
    assert_eq!(degrees["hub"], json!(3));
    assert_eq!(degrees["x"], json!(1));
    assert_eq!(degrees["y"], json!(0));
}
