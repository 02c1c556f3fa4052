//! Cluster Node - runs one arena-cluster member against etcd.
//!
//! Registers under `/{PROFILES}`, serves `POST /rpc` with the built-in
//! `commons/time` handler plus `demo/echo`, and exposes `/health` and
//! `/members` for poking at the cluster by hand.
//!
//! ```bash
//! ETCD_ENDPOINTS=localhost:2379 \
//! SERVICE_ID=901 \
//! PROFILES=dev.101 \
//! RPC_PORT=9000 \
//! cargo run --package cluster-node
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arena_cluster::config::ClusterConfig;
use arena_cluster::coordination::etcd::EtcdCoordinator;
use arena_cluster::metrics::ClusterMetrics;
use arena_cluster::node::ClusterNode;
use arena_cluster::rpc::{handler_fn, RpcHandler};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "cluster-node")]
#[command(about = "Runs one arena-cluster member against etcd")]
struct Args {
    /// etcd endpoints, comma-separated.
    #[arg(long, env = "ETCD_ENDPOINTS", default_value = "localhost:2379")]
    etcd_endpoints: String,

    /// Lease TTL in seconds for this node's registration.
    #[arg(long, env = "LEASE_TTL", default_value_t = 10)]
    lease_ttl: i64,

    /// Logical service this node belongs to.
    #[arg(long, env = "SERVICE_ID", default_value = "901")]
    service_id: String,

    /// Deployment profile; members register under `/{profiles}`.
    #[arg(long, env = "PROFILES", default_value = "dev")]
    profiles: String,

    /// Port for RPC and the debug routes, advertised to peers.
    #[arg(long, env = "RPC_PORT", default_value_t = 9000)]
    rpc_port: u16,

    /// Address to advertise instead of the first non-loopback interface address.
    #[arg(long, env = "ADVERTISE_IP")]
    advertise_ip: Option<Ipv4Addr>,

    /// Coordination connect timeout in milliseconds.
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 3000)]
    connect_timeout_ms: u64,

    /// Run standalone without registering.
    #[arg(long, env = "CLUSTER_DISABLED")]
    disabled: bool,
}

fn handlers() -> Vec<Arc<dyn RpcHandler>> {
    vec![handler_fn("demo", "echo", |args| async move { Ok(args) })]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("cluster_node=info".parse()?)
                .add_directive("arena_cluster=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Cluster Node starting...");

    let config = ClusterConfig {
        enabled: !args.disabled,
        service_id: args.service_id,
        profiles: args.profiles,
        port: args.rpc_port,
        advertise_ip: args.advertise_ip,
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        ..Default::default()
    };

    let endpoints: Vec<String> = args
        .etcd_endpoints
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();
    tracing::info!("Using etcd: {:?}", endpoints);
    let coordinator = Arc::new(EtcdCoordinator::new(endpoints, args.lease_ttl));

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(ClusterMetrics::new(&registry)?);

    let node = Arc::new(ClusterNode::new(config, coordinator, handlers(), metrics)?);
    let app = api::create_router(Arc::new(api::AppState {
        node: node.clone(),
        metrics: registry,
    }));

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, args.rpc_port)).await?;
    let addr = node.start(listener, app).await?;
    tracing::info!("Cluster Node listening on {}", addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    node.shutdown().await?;
    tracing::info!("Cluster Node shutdown");
    Ok(())
}
