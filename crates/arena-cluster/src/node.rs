//! One process's view of the cluster: membership, outbound RPC and the
//! inbound handler table, wired together and started in boot order.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ClusterConfig;
use crate::coordination::CoordinationClient;
use crate::error::ClusterError;
use crate::membership::MembershipRegistry;
use crate::metrics::ClusterMetrics;
use crate::rpc::{self, ConnectionPoolManager, HandlerRegistry, RpcClient, RpcHandler, RpcServer};

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the registry, pool manager, client and handler table of a process.
///
/// # Example
///
/// ```ignore
/// let node = ClusterNode::new(config, coordinator, [handler], metrics)?;
/// let listener = TcpListener::bind(("0.0.0.0", node.config().port)).await?;
/// node.start(listener, Router::new()).await?;
/// let now = node.client().call_remote_procedure("902", "commons", "time", Value::Null).await?;
/// node.shutdown().await?;
/// ```
pub struct ClusterNode {
    config: Arc<ClusterConfig>,
    registry: Arc<MembershipRegistry>,
    pools: Arc<ConnectionPoolManager>,
    client: Arc<RpcClient>,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<ClusterMetrics>,
    server: parking_lot::Mutex<Option<ServerHandle>>,
}

impl ClusterNode {
    /// Build every component. The handler table always includes `commons/time`;
    /// a duplicate `module/method` key fails here.
    pub fn new(
        config: ClusterConfig,
        coordinator: Arc<dyn CoordinationClient>,
        handlers: impl IntoIterator<Item = Arc<dyn RpcHandler>>,
        metrics: Arc<ClusterMetrics>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let config = Arc::new(config);
        let handlers = Arc::new(HandlerRegistry::with_builtins(handlers)?);
        let registry = MembershipRegistry::new(config.clone(), coordinator, metrics.clone());
        let pools = Arc::new(ConnectionPoolManager::new(
            registry.subscribe(),
            config.pool.clone(),
            metrics.clone(),
        ));
        let client = Arc::new(RpcClient::new(pools.clone(), metrics.clone()));

        Ok(Self {
            config,
            registry,
            pools,
            client,
            handlers,
            metrics,
            server: parking_lot::Mutex::new(None),
        })
    }

    /// The `/rpc` router for this node's handler table.
    pub fn router(&self) -> Router {
        rpc::router(self.handlers.clone())
    }

    /// Serve `/rpc` (merged with `extra`) on `listener`, then register with
    /// the cluster. The listener should be bound to the configured port, since
    /// that is the port peers are told to use.
    pub async fn start(
        &self,
        listener: TcpListener,
        extra: Router,
    ) -> Result<SocketAddr, ClusterError> {
        let addr = listener.local_addr()?;
        if addr.port() != self.config.port {
            tracing::warn!(
                bound = addr.port(),
                advertised = self.config.port,
                "rpc listener port differs from the advertised port"
            );
        }
        tracing::info!(handlers = ?self.handlers.keys(), "registered rpc handlers");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = RpcServer::from_listener(listener, self.router().merge(extra));
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = server.serve(shutdown).await {
                tracing::error!(error = %e, "rpc server failed");
            }
        });
        let previous = self.server.lock().replace(ServerHandle {
            shutdown: shutdown_tx,
            task,
        });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(());
        }

        if let Err(e) = self.registry.init().await {
            self.stop_server().await;
            return Err(e);
        }
        tracing::info!(
            %addr,
            service_id = %self.config.service_id,
            profiles = %self.config.profiles,
            "cluster node started"
        );
        Ok(addr)
    }

    /// Leave the cluster, drop cached pools and stop serving.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        let result = self.registry.shutdown().await;
        self.pools.invalidate_all();
        self.stop_server().await;
        tracing::info!(service_id = %self.config.service_id, "cluster node stopped");
        result
    }

    async fn stop_server(&self) {
        let handle = self.server.lock().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            if let Err(e) = handle.task.await {
                tracing::warn!(error = %e, "rpc server task ended abnormally");
            }
        }
    }

    /// Shorthand for [`RpcClient::call_remote_procedure`].
    pub async fn call_remote_procedure(
        &self,
        service_id: &str,
        module: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        self.client
            .call_remote_procedure(service_id, module, method, args)
            .await
    }

    pub fn config(&self) -> &Arc<ClusterConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.registry
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn metrics(&self) -> &Arc<ClusterMetrics> {
        &self.metrics
    }
}
