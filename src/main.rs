use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pregel_cluster::{
    AlgorithmRegistry, GraphSource, JobOptions, LocalCluster, MemoryGraph, PhaseName, PregelConfig,
};

#[derive(Parser)]
#[command(name = "pregel")]
#[command(about = "Run Pregel jobs on an in-process cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an algorithm on a random graph
    Run {
        /// Algorithm name (pagerank, sssp, connectedcomponents)
        #[arg(short, long, default_value = "pagerank")]
        algorithm: String,

        /// Cluster nodes
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Shards per collection (defaults to one per node)
        #[arg(long)]
        shards: Option<usize>,

        #[arg(long, default_value = "100")]
        vertices: usize,

        #[arg(long, default_value = "300")]
        edges: usize,

        /// Seed of the graph generator
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Algorithm parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        #[arg(long)]
        max_gss: Option<u64>,

        /// Write results back into the vertex documents
        #[arg(long)]
        store: bool,

        /// Round-trip every message through JSON
        #[arg(long)]
        wire_encoding: bool,

        /// Results to print
        #[arg(long, default_value = "10")]
        top: usize,

        /// Deadline of one broadcast round, in seconds
        #[arg(long, default_value = "30")]
        rpc_timeout_secs: u64,
    },

    /// List the registered algorithms
    Algorithms,
}

fn generate(graph: &MemoryGraph, vertices: usize, edges: usize, seed: u64) -> Result<()> {
    graph.create_vertex_collection("vertices")?;
    graph.create_edge_collection("edges")?;

    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..vertices {
        graph.insert_vertex("vertices", &format!("v{}", i), json!({ "n": i }))?;
    }
    for _ in 0..edges {
        let from = rng.gen_range(0..vertices);
        let to = rng.gen_range(0..vertices);
        let weight: u64 = rng.gen_range(1..10);
        graph.insert_edge(
            "edges",
            &format!("vertices/v{}", from),
            &format!("vertices/v{}", to),
            json!({ "weight": weight }),
        )?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pregel_cluster=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Algorithms => {
            for name in AlgorithmRegistry::with_defaults().names() {
                println!("{}", name);
            }
        }

        Commands::Run {
            algorithm,
            nodes,
            shards,
            vertices,
            edges,
            seed,
            params,
            max_gss,
            store,
            wire_encoding,
            top,
            rpc_timeout_secs,
        } => {
            if vertices == 0 {
                bail!("the graph needs at least one vertex");
            }

            let mut params: Value = match params {
                Some(text) => serde_json::from_str(&text).context("invalid --params")?,
                None => json!({}),
            };
            if algorithm.eq_ignore_ascii_case("sssp") && params.is_object() && params.get("source").is_none() {
                params["source"] = json!("vertices/v0");
            }

            let mut builder = LocalCluster::builder()
                .nodes(nodes)
                .wire_encoding(wire_encoding)
                .config(PregelConfig::default().with_rpc_timeout(Duration::from_secs(rpc_timeout_secs)));
            if let Some(shards) = shards {
                builder = builder.shards(shards);
            }
            let cluster = builder.build()?;
            generate(cluster.graph(), vertices, edges, seed)?;

            let mut options = JobOptions::default().with_params(params).with_store(store);
            if let Some(max_gss) = max_gss {
                options = options.with_max_gss(max_gss);
            }

            let service = cluster.service();
            let job = service.submit(&algorithm, GraphSource::new(["vertices"], ["edges"]), options)?;
            let status = service.wait(job).await?;

            println!(
                "job {} {} after {} supersteps: {} vertices, {} edges, {} messages",
                job,
                status.phase,
                status.gss + 1,
                status.vertex_count,
                status.edge_count,
                status.messages_sent
            );
            for (phase, millis) in &status.timings {
                println!("  {:<18}{}ms", phase, millis);
            }
            if let Some(message) = &status.message {
                println!("  {}", message);
            }

            if store {
                for i in 0..vertices.min(top) {
                    let key = format!("v{}", i);
                    if let Some(document) = cluster.graph().document("vertices", &key) {
                        println!("{}\t{}", key, document["result"]);
                    }
                }
            } else if status.phase == PhaseName::Done {
                let mut results = service.results(job, true).await?;
                results.sort_by(|a, b| a.key.cmp(&b.key));
                for result in results.iter().take(top) {
                    println!("{}\t{}", result.id.as_deref().unwrap_or(&result.key), result.value);
                }
            }
        }
    }

    Ok(())
}
