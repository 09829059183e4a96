mod buffer;

pub mod aggregate;
pub use aggregate::{Aggregate, AggregateError, Merge};

pub mod aggregator;
pub use aggregator::{Aggregator, Aggregators};

pub mod algorithm;
pub use algorithm::{Algorithm, AlgorithmRegistry, ComputeContext, JobInfo, MasterContext, WorkerContext};

pub mod algorithms;

pub mod cluster;
pub use cluster::{LocalCluster, LocalClusterBuilder};

pub mod combine;
pub use combine::Combine;

pub mod conductor;
pub use conductor::{Conductor, JobStatus, PhaseName};

pub mod config;
pub use config::{JobOptions, PregelConfig};

pub mod error;
pub use error::{PregelError, Result, TransportError};

pub mod graph;
pub use graph::{GraphSource, GraphStore, MemoryGraph, ShardLocator};

pub mod message;
pub use message::{Gss, JobId, VertexId, VertexResult, WorkerId};

pub mod node;
pub use node::WorkerHost;

pub mod registry;
pub use registry::JobRegistry;

pub mod service;
pub use service::PregelService;

pub mod transport;
pub use transport::{LinkFault, LocalTransport, Transport};

pub mod vertex;
pub use vertex::Vertex;

pub mod worker;
pub use worker::WorkerState;
