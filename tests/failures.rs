mod common;

use common::*;
use pregel_cluster::{GraphSource, JobOptions, JobStatus, LinkFault, PhaseName, PregelError, WorkerId};

use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;

fn source() -> GraphSource {
    GraphSource::new(["v"], ["e"])
}

fn node(i: usize) -> WorkerId {
    WorkerId::from(format!("node-{}", i))
}

async fn reach(status: &mut watch::Receiver<JobStatus>, check: impl Fn(&JobStatus) -> bool) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| check(s)))
        .await
        .expect("phase not reached")
        .expect("status closed")
        .clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_worker_cancels_and_cleans_up() {
    let config = config()
        .with_rpc_timeout(Duration::from_millis(300))
        .with_cancel_policy(5, Duration::from_millis(100), Duration::from_secs(10));
    let cluster = cluster(config, false);
    ring(cluster.graph(), 12, &[1]);
    cluster.transport().set_fault_at(node(2), LinkFault::Silent, 1);

    let service = cluster.service();
    let options = JobOptions::default().with_params(json!({ "source": "v/k0" }));
    let job = service.submit("sssp", source(), options).unwrap();

    let mut updates = service.subscribe(job).unwrap();
    let canceled = reach(&mut updates, |s| s.phase == PhaseName::Canceled).await;
    assert!(canceled.passed_through(PhaseName::Recovering));
    assert!(canceled.message.is_some());
    assert!(!canceled.settled);

    // The node comes back; the next cleanup attempt reaches it.
    cluster.transport().clear_fault(&node(2));
    let status = reach(&mut updates, |s| s.settled).await;
    assert_eq!(status.phase, PhaseName::Canceled);

    assert!(eventually(|| service.jobs().is_empty()).await);
    assert!(matches!(service.status(job), Err(PregelError::JobNotFound(_))));
    assert!(eventually(|| cluster.live_workers() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_gives_up_on_a_silent_worker() {
    let config = config()
        .with_rpc_timeout(Duration::from_millis(200))
        .with_cancel_policy(3, Duration::from_millis(50), Duration::from_secs(10));
    let cluster = cluster(config, false);
    ring(cluster.graph(), 12, &[1]);
    cluster.transport().set_fault_at(node(2), LinkFault::Silent, 1);

    let service = cluster.service();
    let options = JobOptions::default().with_params(json!({ "source": "k0" }));
    let job = service.submit("sssp", source(), options).unwrap();

    let status = settle(service, job).await;
    assert_eq!(status.phase, PhaseName::FatalError);
    assert!(status.passed_through(PhaseName::Canceled));
    let message = status.message.unwrap();
    assert!(message.contains("cancel did not complete"), "{}", message);
    assert!(message.contains("node-2"), "{}", message);
    assert!(message.contains("3 attempts"), "{}", message);

    // Failed jobs stay queryable until they expire.
    assert_eq!(service.status(job).unwrap().phase, PhaseName::FatalError);
    assert!(service.cancel(job).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_on_request() {
    let cluster = cluster(config(), false);
    ring(cluster.graph(), 30, &[1, 3]);
    // Holds the job at superstep 3 until it is canceled.
    cluster.transport().set_fault_at(node(1), LinkFault::Silent, 3);

    let service = cluster.service();
    let options = JobOptions::default().with_params(json!({ "threshold": 0.0 }));
    let job = service.submit("pagerank", source(), options).unwrap();

    let mut updates = service.subscribe(job).unwrap();
    reach(&mut updates, |s| s.phase == PhaseName::Computing && s.gss == 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.transport().clear_fault(&node(1));

    service.cancel(job).unwrap();
    // Canceling twice is a no-op, unless the job is already gone.
    assert!(matches!(service.cancel(job), Ok(()) | Err(PregelError::JobNotFound(_))));

    let status = reach(&mut updates, |s| s.settled).await;
    assert_eq!(status.phase, PhaseName::Canceled);
    assert_eq!(status.message.as_deref(), Some("canceled by request"));
    assert!(!status.passed_through(PhaseName::Recovering));
    assert!(eventually(|| cluster.live_workers() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pagerank_recovers_from_a_lost_worker() {
    let config = config()
        .with_rpc_timeout(Duration::from_millis(500))
        .with_message_wait_timeout(Duration::from_millis(500));
    let cluster = cluster(config, true);
    ring(cluster.graph(), 30, &[1, 7]);
    cluster.transport().set_fault_at(node(2), LinkFault::Unreachable, 2);

    let service = cluster.service();
    let options = JobOptions::default()
        .with_max_gss(6)
        .with_params(json!({ "threshold": 0.0 }));
    let job = service.submit("pagerank", source(), options).unwrap();

    let status = settle(service, job).await;
    assert_eq!(status.phase, PhaseName::Done, "{:?}", status.message);
    assert!(status.passed_through(PhaseName::Recovering));
    assert_eq!(status.gss, 5);
    assert_eq!(status.workers.len(), 2);
    assert!(!status.workers.contains(&node(2)));

    // node-2 still holds its copy of the job; it is released along with the
    // survivors once it can be reached again.
    assert!(cluster.node(&node(2)).unwrap().worker_state(job).is_some());
    cluster.transport().clear_fault(&node(2));

    let ranks = by_key(service.results(job, false).await.unwrap());
    assert_eq!(ranks.len(), 30);
    for rank in ranks.values() {
        assert!(rank.as_f64().unwrap() > 0.0);
    }

    assert!(eventually(|| cluster.live_workers() == 0).await);
    assert_eq!(cluster.node(&node(2)).unwrap().worker_state(job), None);
    service.reap();
    assert_eq!(cluster.live_workers(), 0);
}
