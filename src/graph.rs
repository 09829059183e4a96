//! Graph collaborators: the description of a graph, shard placement lookup,
//! graph I/O and an in-memory store implementing both.

use crate::error::{PregelError, Result};
use crate::message::{Routing, ShardId, WorkerId};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Collections making up the graph of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSource {
    pub vertex_collections: Vec<String>,
    pub edge_collections: Vec<String>,
}

impl GraphSource {
    pub fn new<V, E>(vertex_collections: V, edge_collections: E) -> Self
    where
        V: IntoIterator,
        V::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        GraphSource {
            vertex_collections: vertex_collections.into_iter().map(Into::into).collect(),
            edge_collections: edge_collections.into_iter().map(Into::into).collect(),
        }
    }
}

/// Placement of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub collection: String,
    pub shard: ShardId,
    pub server: WorkerId,
}

/// One vertex shard a worker loads, with the edge shards holding the edges
/// leaving its vertices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlan {
    pub collection: String,
    pub shard: ShardId,
    pub edge_shards: Vec<ShardId>,
}

pub trait ShardLocator: Send + Sync {
    /// Shards of `collections`, in shard order within each collection.
    fn locate(&self, collections: &[String]) -> Result<Vec<ShardInfo>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexDocument {
    pub key: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDocument {
    /// `collection/key` of the source vertex.
    pub from: String,
    /// `collection/key` of the target vertex.
    pub to: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedShard {
    pub shard: ShardId,
    pub vertices: Vec<VertexDocument>,
    pub edges: Vec<EdgeDocument>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn load(&self, plan: &ShardPlan) -> Result<LoadedShard>;

    /// Writes `values` (vertex key, result) into attribute `field` of the
    /// vertices of `shard`.
    async fn store(&self, shard: &ShardId, field: &str, values: Vec<(String, Value)>) -> Result<()>;
}

/// Stable FNV-1a hash of a vertex key, so every node agrees on placement.
pub fn shard_index(key: &str, shards: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % shards.max(1) as u64) as usize
}

/// Splits `collection/key` into its parts.
pub fn split_document_id(id: &str) -> Option<(&str, &str)> {
    let (collection, key) = id.split_once('/')?;
    if collection.is_empty() || key.is_empty() {
        return None;
    }
    Some((collection, key))
}

/// Builds the routing table and the per-worker shard plans of a graph. Every
/// edge collection must be sharded like the vertex collections: same shard
/// count, shard `i` on the same server.
pub fn plan_placement(
    source: &GraphSource,
    locator: &dyn ShardLocator,
) -> Result<(Routing, BTreeMap<WorkerId, Vec<ShardPlan>>)> {
    if source.vertex_collections.is_empty() {
        return Err(PregelError::Graph("no vertex collection given".into()));
    }

    let group = |infos: Vec<ShardInfo>| {
        let mut grouped: BTreeMap<String, Vec<ShardInfo>> = BTreeMap::new();
        for info in infos {
            grouped.entry(info.collection.clone()).or_default().push(info);
        }
        grouped
    };

    let vertices = group(locator.locate(&source.vertex_collections)?);
    let edges = group(locator.locate(&source.edge_collections)?);

    let mut routing = Routing::default();
    let mut plans: BTreeMap<WorkerId, Vec<ShardPlan>> = BTreeMap::new();

    for collection in &source.vertex_collections {
        let shards = vertices
            .get(collection)
            .ok_or_else(|| PregelError::Graph(format!("collection '{}' not found", collection)))?;

        for (index, info) in shards.iter().enumerate() {
            let mut edge_shards = Vec::new();
            for edge_collection in &source.edge_collections {
                let edge_infos = edges.get(edge_collection).ok_or_else(|| {
                    PregelError::Graph(format!("collection '{}' not found", edge_collection))
                })?;
                if edge_infos.len() != shards.len() {
                    return Err(PregelError::Graph(format!(
                        "edge collection '{}' has {} shards, '{}' has {}",
                        edge_collection,
                        edge_infos.len(),
                        collection,
                        shards.len()
                    )));
                }
                let edge_info = &edge_infos[index];
                if edge_info.server != info.server {
                    return Err(PregelError::Graph(format!(
                        "shard {} of '{}' is not co-located with shard {} of '{}'",
                        edge_info.shard, edge_collection, info.shard, collection
                    )));
                }
                edge_shards.push(edge_info.shard.clone());
            }

            routing.owners.insert(info.shard.clone(), info.server.clone());
            plans.entry(info.server.clone()).or_default().push(ShardPlan {
                collection: collection.clone(),
                shard: info.shard.clone(),
                edge_shards,
            });
        }

        routing.collections.insert(
            collection.clone(),
            shards.iter().map(|info| info.shard.clone()).collect(),
        );
    }

    Ok((routing, plans))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectionKind {
    Vertex,
    Edge,
}

struct MemoryShard {
    name: ShardId,
    server: WorkerId,
    documents: BTreeMap<String, Value>,
}

struct MemoryCollection {
    kind: CollectionKind,
    shards: Vec<MemoryShard>,
}

struct MemoryState {
    collections: BTreeMap<String, MemoryCollection>,
    next_shard: u64,
    next_edge: u64,
}

/// A graph held in memory, sharded by key over a fixed set of servers.
/// Shard `i` of every collection lives on server `i % servers`.
pub struct MemoryGraph {
    servers: Vec<WorkerId>,
    number_of_shards: usize,
    state: RwLock<MemoryState>,
}

impl MemoryGraph {
    pub fn new(servers: Vec<WorkerId>, number_of_shards: usize) -> Self {
        MemoryGraph {
            servers,
            number_of_shards: number_of_shards.max(1),
            state: RwLock::new(MemoryState {
                collections: BTreeMap::new(),
                next_shard: 1001,
                next_edge: 1,
            }),
        }
    }

    pub fn servers(&self) -> &[WorkerId] {
        &self.servers
    }

    fn create(&self, name: &str, kind: CollectionKind) -> Result<()> {
        if self.servers.is_empty() {
            return Err(PregelError::Graph("no servers to place shards on".into()));
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.collections.contains_key(name) {
            return Err(PregelError::Graph(format!("collection '{}' exists", name)));
        }

        let mut shards = Vec::with_capacity(self.number_of_shards);
        for i in 0..self.number_of_shards {
            shards.push(MemoryShard {
                name: format!("s{}", state.next_shard),
                server: self.servers[i % self.servers.len()].clone(),
                documents: BTreeMap::new(),
            });
            state.next_shard += 1;
        }
        state
            .collections
            .insert(name.to_string(), MemoryCollection { kind, shards });
        Ok(())
    }

    pub fn create_vertex_collection(&self, name: &str) -> Result<()> {
        self.create(name, CollectionKind::Vertex)
    }

    pub fn create_edge_collection(&self, name: &str) -> Result<()> {
        self.create(name, CollectionKind::Edge)
    }

    pub fn insert_vertex(&self, collection: &str, key: &str, data: Value) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let target = state
            .collections
            .get_mut(collection)
            .filter(|c| c.kind == CollectionKind::Vertex)
            .ok_or_else(|| PregelError::Graph(format!("no vertex collection '{}'", collection)))?;

        let index = shard_index(key, target.shards.len());
        target.shards[index].documents.insert(key.to_string(), data);
        Ok(())
    }

    /// Inserts an edge `from -> to`, both given as `collection/key`. The edge
    /// is placed in the shard matching its source vertex.
    pub fn insert_edge(&self, collection: &str, from: &str, to: &str, data: Value) -> Result<()> {
        let (_, from_key) = split_document_id(from)
            .ok_or_else(|| PregelError::Graph(format!("invalid _from '{}'", from)))?;
        if split_document_id(to).is_none() {
            return Err(PregelError::Graph(format!("invalid _to '{}'", to)));
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let key = format!("e{}", state.next_edge);
        state.next_edge += 1;

        let target = state
            .collections
            .get_mut(collection)
            .filter(|c| c.kind == CollectionKind::Edge)
            .ok_or_else(|| PregelError::Graph(format!("no edge collection '{}'", collection)))?;

        let mut document = match data {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        document.insert("_from".into(), Value::from(from));
        document.insert("_to".into(), Value::from(to));

        let index = shard_index(from_key, target.shards.len());
        target.shards[index].documents.insert(key, Value::Object(document));
        Ok(())
    }

    /// Stored document of a vertex.
    pub fn document(&self, collection: &str, key: &str) -> Option<Value> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let target = state.collections.get(collection)?;
        let index = shard_index(key, target.shards.len());
        target.shards[index].documents.get(key).cloned()
    }

    fn find_shard<'a>(state: &'a MemoryState, shard: &str) -> Option<(&'a str, &'a MemoryShard)> {
        state.collections.iter().find_map(|(name, collection)| {
            collection
                .shards
                .iter()
                .find(|s| s.name == shard)
                .map(|s| (name.as_str(), s))
        })
    }
}

impl ShardLocator for MemoryGraph {
    fn locate(&self, collections: &[String]) -> Result<Vec<ShardInfo>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos = Vec::new();
        for name in collections {
            let collection = state
                .collections
                .get(name)
                .ok_or_else(|| PregelError::Graph(format!("collection '{}' not found", name)))?;
            for shard in &collection.shards {
                infos.push(ShardInfo {
                    collection: name.clone(),
                    shard: shard.name.clone(),
                    server: shard.server.clone(),
                });
            }
        }
        Ok(infos)
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn load(&self, plan: &ShardPlan) -> Result<LoadedShard> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let (_, shard) = Self::find_shard(&state, &plan.shard)
            .ok_or_else(|| PregelError::Graph(format!("shard {} not found", plan.shard)))?;

        let vertices = shard
            .documents
            .iter()
            .map(|(key, data)| VertexDocument {
                key: key.clone(),
                data: data.clone(),
            })
            .collect();

        let mut edges = Vec::new();
        for edge_shard in &plan.edge_shards {
            let (_, shard) = Self::find_shard(&state, edge_shard)
                .ok_or_else(|| PregelError::Graph(format!("shard {} not found", edge_shard)))?;
            for data in shard.documents.values() {
                let from = data.get("_from").and_then(Value::as_str).unwrap_or_default();
                let to = data.get("_to").and_then(Value::as_str).unwrap_or_default();
                match split_document_id(from) {
                    Some((collection, _)) if collection == plan.collection => edges.push(EdgeDocument {
                        from: from.to_string(),
                        to: to.to_string(),
                        data: data.clone(),
                    }),
                    _ => {}
                }
            }
        }

        Ok(LoadedShard {
            shard: plan.shard.clone(),
            vertices,
            edges,
        })
    }

    async fn store(&self, shard: &ShardId, field: &str, values: Vec<(String, Value)>) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let target = state
            .collections
            .values_mut()
            .flat_map(|c| c.shards.iter_mut())
            .find(|s| &s.name == shard)
            .ok_or_else(|| PregelError::Graph(format!("shard {} not found", shard)))?;

        for (key, value) in values {
            let Some(document) = target.documents.get_mut(&key) else {
                continue;
            };
            if !document.is_object() {
                let previous = document.take();
                let mut map = serde_json::Map::new();
                if !previous.is_null() {
                    map.insert("value".into(), previous);
                }
                *document = Value::Object(map);
            }
            if let Value::Object(map) = document {
                map.insert(field.to_string(), value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn servers() -> Vec<WorkerId> {
        vec![WorkerId::from("node-0"), WorkerId::from("node-1")]
    }

    fn graph() -> MemoryGraph {
        let graph = MemoryGraph::new(servers(), 4);
        graph.create_vertex_collection("v").unwrap();
        graph.create_edge_collection("e").unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            graph.insert_vertex("v", key, json!({ "name": key })).unwrap();
        }
        graph.insert_edge("e", "v/a", "v/b", json!({ "weight": 2 })).unwrap();
        graph.insert_edge("e", "v/b", "v/c", Value::Null).unwrap();
        graph
    }

    #[test]
    fn test_shard_index_is_stable() {
        assert_eq!(shard_index("alice", 7), shard_index("alice", 7));
        assert!(shard_index("alice", 7) < 7);
        assert_eq!(shard_index("anything", 1), 0);
        assert_eq!(shard_index("anything", 0), 0);
    }

    #[test]
    fn test_plan_placement_pairs_edge_shards() {
        let graph = graph();
        let source = GraphSource::new(["v"], ["e"]);
        let (routing, plans) = plan_placement(&source, &graph).unwrap();

        assert_eq!(routing.collections["v"].len(), 4);
        assert_eq!(routing.owners.len(), 4);
        assert_eq!(plans.len(), 2);
        let total: usize = plans.values().map(|p| p.len()).sum();
        assert_eq!(total, 4);
        for (server, shard_plans) in &plans {
            for plan in shard_plans {
                assert_eq!(routing.owner(&plan.shard), Some(server));
                assert_eq!(plan.edge_shards.len(), 1);
            }
        }
    }

    #[test]
    fn test_plan_placement_rejects_unsharded_like() {
        let graph = MemoryGraph::new(servers(), 2);
        graph.create_vertex_collection("v").unwrap();
        let other = MemoryGraph::new(servers(), 2);
        other.create_edge_collection("e").unwrap();

        let source = GraphSource::new(["v"], ["e"]);
        assert!(plan_placement(&source, &graph).is_err());
        assert!(plan_placement(&GraphSource::default(), &graph).is_err());
    }

    #[tokio::test]
    async fn test_load_and_store_round() {
        let graph = graph();
        let (_, plans) = plan_placement(&GraphSource::new(["v"], ["e"]), &graph).unwrap();

        let mut vertices = 0;
        let mut edges = 0;
        for plan in plans.values().flatten() {
            let loaded = graph.load(plan).await.unwrap();
            vertices += loaded.vertices.len();
            edges += loaded.edges.len();
            for edge in &loaded.edges {
                let (_, key) = split_document_id(&edge.from).unwrap();
                assert!(loaded.vertices.iter().any(|v| v.key == key));
            }
        }
        assert_eq!(vertices, 5);
        assert_eq!(edges, 2);

        let shard = plans
            .values()
            .flatten()
            .find(|plan| graph.load_sync_contains(plan, "a"))
            .map(|plan| plan.shard.clone())
            .unwrap();
        graph
            .store(&shard, "rank", vec![("a".into(), json!(0.5))])
            .await
            .unwrap();
        assert_eq!(graph.document("v", "a").unwrap()["rank"], json!(0.5));
    }

    impl MemoryGraph {
        fn load_sync_contains(&self, plan: &ShardPlan, key: &str) -> bool {
            let state = self.state.read().unwrap();
            Self::find_shard(&state, &plan.shard)
                .map(|(_, shard)| shard.documents.contains_key(key))
                .unwrap_or(false)
        }
    }
}
