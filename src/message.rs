//! Wire protocol between the conductor and the workers of a job.
//!
//! Every message is bound to a [`JobId`]. Commands flow from the conductor to
//! the workers, replies flow back and carry either a payload or an
//! [`ErrorReply`]. At most one request is outstanding per worker and phase,
//! so a reply is correlated by `(job, sender)` alone.
//!
//! Vertex messages travel worker to worker in [`MessageBatch`]es tagged with
//! the superstep they were produced in.

use crate::aggregate::Merge;
use crate::graph::ShardPlan;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Global superstep counter.
pub type Gss = u64;

/// Name of a physical shard, e.g. `s1001`.
pub type ShardId = String;

/// Values of the job-level aggregators, keyed by aggregator name.
pub type AggregatorValues = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server id of a cluster node hosting workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        WorkerId(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        WorkerId(s)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a vertex: the shard holding it plus its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId {
    pub shard: ShardId,
    pub key: String,
}

impl VertexId {
    pub fn new(shard: impl Into<ShardId>, key: impl Into<String>) -> Self {
        VertexId {
            shard: shard.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shard, self.key)
    }
}

/// Routing table of a job: which worker owns which shard, and the ordered
/// shard list of every collection used to place vertex keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    pub owners: BTreeMap<ShardId, WorkerId>,
    pub collections: BTreeMap<String, Vec<ShardId>>,
}

impl Routing {
    pub fn owner(&self, shard: &str) -> Option<&WorkerId> {
        self.owners.get(shard)
    }

    /// Shard of `collection` that holds `key`.
    pub fn shard_for(&self, collection: &str, key: &str) -> Option<&ShardId> {
        let shards = self.collections.get(collection)?;
        if shards.is_empty() {
            return None;
        }
        shards.get(crate::graph::shard_index(key, shards.len()))
    }

    /// Collection a shard belongs to.
    pub fn collection_of(&self, shard: &str) -> Option<&str> {
        self.collections
            .iter()
            .find(|(_, shards)| shards.iter().any(|s| s == shard))
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateWorker {
    pub algorithm: String,
    pub params: Value,
    pub shards: Vec<ShardPlan>,
    pub routing: Routing,
    pub parallelism: usize,
    pub batch_size: usize,
    pub result_field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadGraph {
    /// Set when the load is part of a recovery; `shards` then holds the
    /// shards taken over from lost workers and `routing` the new ownership.
    pub compensation: bool,
    #[serde(default)]
    pub shards: Vec<ShardPlan>,
    #[serde(default)]
    pub routing: Option<Routing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSuperstep {
    pub gss: Gss,
    pub vertex_count: u64,
    pub edge_count: u64,
    pub aggregators: AggregatorValues,
    /// Messages each worker has to hold for `gss` before computing it.
    pub expected_messages: BTreeMap<WorkerId, u64>,
    pub compensation: bool,
    /// Bumped by every recovery; reports echo it so replies from before a
    /// recovery are told apart.
    #[serde(default)]
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    CreateWorker(CreateWorker),
    LoadGraph(LoadGraph),
    PrepareSuperstep { gss: Gss },
    RunSuperstep(RunSuperstep),
    Store,
    Cleanup,
    CollectResults { with_id: bool },
}

impl Command {
    pub fn tag(&self) -> &'static str {
        match self {
            Command::CreateWorker(_) => "create-worker",
            Command::LoadGraph(_) => "load-graph",
            Command::PrepareSuperstep { .. } => "prepare-superstep",
            Command::RunSuperstep(_) => "run-superstep",
            Command::Store => "store",
            Command::Cleanup => "cleanup",
            Command::CollectResults { .. } => "collect-results",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphLoaded {
    pub vertex_count: u64,
    pub edge_count: u64,
}

impl Merge for GraphLoaded {
    fn merge(&mut self, other: Self) {
        self.vertex_count += other.vertex_count;
        self.edge_count += other.edge_count;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperstepPrepared {
    pub gss: Gss,
    pub pending_messages: u64,
}

impl Merge for SuperstepPrepared {
    fn merge(&mut self, other: Self) {
        self.gss = self.gss.max(other.gss);
        self.pending_messages += other.pending_messages;
    }
}

/// Statistics of one worker (or, once merged, of the whole job) for one
/// superstep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperstepStats {
    pub sent: u64,
    pub received: u64,
    pub active_vertices: u64,
    pub vertex_count: u64,
    pub edge_count: u64,
    pub sent_to: BTreeMap<WorkerId, u64>,
    pub compute_millis: u64,
}

impl Merge for SuperstepStats {
    fn merge(&mut self, other: Self) {
        self.sent += other.sent;
        self.received += other.received;
        self.active_vertices += other.active_vertices;
        self.vertex_count += other.vertex_count;
        self.edge_count += other.edge_count;
        for (worker, count) in other.sent_to {
            *self.sent_to.entry(worker).or_insert(0) += count;
        }
        self.compute_millis = self.compute_millis.max(other.compute_millis);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuperstepFinished {
    pub gss: Gss,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub compensation: bool,
    pub stats: SuperstepStats,
    pub aggregators: AggregatorValues,
}

/// One vertex of a job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexResult {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexResults {
    pub vertices: Vec<VertexResult>,
}

impl Merge for VertexResults {
    fn merge(&mut self, mut other: Self) {
        self.vertices.append(&mut other.vertices);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Reply {
    WorkerCreated,
    GraphLoaded(GraphLoaded),
    SuperstepPrepared(SuperstepPrepared),
    SuperstepFinished(SuperstepFinished),
    Stored,
    CleanupFinished,
    Results(VertexResults),
}

impl Reply {
    pub fn tag(&self) -> &'static str {
        match self {
            Reply::WorkerCreated => "worker-created",
            Reply::GraphLoaded(_) => "graph-loaded",
            Reply::SuperstepPrepared(_) => "superstep-prepared",
            Reply::SuperstepFinished(_) => "superstep-finished",
            Reply::Stored => "stored",
            Reply::CleanupFinished => "cleanup-finished",
            Reply::Results(_) => "results",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    UnknownJob,
    BadParameter,
    Io,
    Algorithm,
    SuperstepMismatch,
    Timeout,
    Protocol,
    Transport,
    Canceled,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::UnknownJob => "unknown-job",
            ErrorCode::BadParameter => "bad-parameter",
            ErrorCode::Io => "io",
            ErrorCode::Algorithm => "algorithm",
            ErrorCode::SuperstepMismatch => "superstep-mismatch",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Transport => "transport",
            ErrorCode::Canceled => "canceled",
            ErrorCode::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub job: JobId,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub job: JobId,
    pub sender: WorkerId,
    pub reply: Result<Reply, ErrorReply>,
}

/// Vertex messages produced during `gss` by `sender`, to be consumed in
/// `gss + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub job: JobId,
    pub gss: Gss,
    pub sender: WorkerId,
    pub messages: Vec<(VertexId, Value)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_tags() {
        let envelope = CommandEnvelope {
            job: JobId(7),
            command: Command::CollectResults { with_id: true },
        };
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(encoded["job"], json!(7));
        assert_eq!(encoded["command"]["type"], json!("collect-results"));
        assert_eq!(envelope.command.tag(), "collect-results");
    }

    #[test]
    fn test_error_reply_on_the_wire() {
        let envelope = ReplyEnvelope {
            job: JobId(1),
            sender: WorkerId::from("node-0"),
            reply: Err(ErrorReply {
                code: ErrorCode::SuperstepMismatch,
                message: "expected 2, got 4".into(),
            }),
        };
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(text.contains("superstep-mismatch"));
        let decoded: ReplyEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_stats_merge_sums_destinations() {
        let mut a = SuperstepStats {
            sent: 3,
            active_vertices: 2,
            compute_millis: 5,
            ..Default::default()
        };
        a.sent_to.insert(WorkerId::from("node-1"), 3);

        let mut b = SuperstepStats {
            sent: 4,
            received: 3,
            compute_millis: 9,
            ..Default::default()
        };
        b.sent_to.insert(WorkerId::from("node-1"), 1);
        b.sent_to.insert(WorkerId::from("node-0"), 3);

        a.merge(b);
        assert_eq!(a.sent, 7);
        assert_eq!(a.received, 3);
        assert_eq!(a.compute_millis, 9);
        assert_eq!(a.sent_to[&WorkerId::from("node-1")], 4);
        assert_eq!(a.sent_to[&WorkerId::from("node-0")], 3);
    }

    #[test]
    fn test_routing_places_keys_on_collection_shards() {
        let mut routing = Routing::default();
        routing
            .collections
            .insert("persons".into(), vec!["s1".into(), "s2".into()]);
        routing.owners.insert("s1".into(), WorkerId::from("node-0"));
        routing.owners.insert("s2".into(), WorkerId::from("node-1"));

        let shard = routing.shard_for("persons", "alice").unwrap().clone();
        assert!(shard == "s1" || shard == "s2");
        assert_eq!(routing.shard_for("persons", "alice"), Some(&shard));
        assert_eq!(routing.collection_of(&shard), Some("persons"));
        assert!(routing.shard_for("unknown", "alice").is_none());
    }
}
