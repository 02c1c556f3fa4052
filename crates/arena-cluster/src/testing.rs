//! In-process test cluster.
//!
//! Nodes share one [`MemoryCoordinator`], advertise `127.0.0.1` and serve RPC
//! on an ephemeral port, so several of them can call each other inside a
//! single test.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::{ClusterConfig, PoolLimits, ReconnectPolicy};
use crate::coordination::memory::MemoryCoordinator;
use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use crate::node::ClusterNode;
use crate::rpc::RpcHandler;

/// Profile every test node registers under.
pub const TEST_PROFILES: &str = "test";

/// A group of [`ClusterNode`]s sharing one in-memory coordinator.
///
/// # Example
///
/// ```ignore
/// let mut cluster = TestCluster::new();
/// let a = cluster.add_node("901", vec![]).await?;
/// let b = cluster.add_node("902", vec![echo]).await?;
/// cluster.wait_for_members(2).await;
/// let out = a.call_remote_procedure("902", "test", "echo", json!(1)).await?;
/// cluster.shutdown().await;
/// ```
#[derive(Default)]
pub struct TestCluster {
    coordinator: MemoryCoordinator,
    nodes: Vec<Arc<ClusterNode>>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coordinator(&self) -> &MemoryCoordinator {
        &self.coordinator
    }

    pub fn nodes(&self) -> &[Arc<ClusterNode>] {
        &self.nodes
    }

    /// Configuration used for test nodes: short timeouts, loopback address.
    pub fn config(service_id: &str, port: u16) -> ClusterConfig {
        ClusterConfig {
            service_id: service_id.to_string(),
            profiles: TEST_PROFILES.to_string(),
            port,
            advertise_ip: Some(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(1),
            pool: PoolLimits {
                request_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
            },
            ..Default::default()
        }
    }

    /// Start a node for `service_id` with `handlers` plus the built-ins.
    pub async fn add_node(
        &mut self,
        service_id: &str,
        handlers: Vec<Arc<dyn RpcHandler>>,
    ) -> Result<Arc<ClusterNode>, ClusterError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let node = Arc::new(ClusterNode::new(
            Self::config(service_id, port),
            Arc::new(self.coordinator.clone()),
            handlers,
            Arc::new(ClusterMetrics::unregistered()),
        )?);
        node.start(listener, Router::new()).await?;
        self.nodes.push(node.clone());
        Ok(node)
    }

    /// Wait until every node's snapshot holds exactly `count` members.
    ///
    /// Panics after five seconds.
    pub async fn wait_for_members(&self, count: usize) {
        for node in &self.nodes {
            let mut rx = node.registry().subscribe();
            tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.len() == count))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {count} members"))
                .unwrap_or_else(|_| panic!("membership channel closed"));
        }
    }

    /// Shut down every node, logging failures.
    pub async fn shutdown(self) {
        for node in self.nodes {
            if let Err(e) = node.shutdown().await {
                tracing::warn!(error = %e, "test node shutdown failed");
            }
        }
    }
}
