use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use crate::rpc::envelope::{decode_response, RpcRequest};
use crate::rpc::pool::{ConnectionPoolManager, PoolEntry};
use crate::rpc::RPC_PATH;

/// Issues RPC calls to other services through the pool manager.
///
/// Calls are never retried. A call racing a membership change may reach a
/// departed peer and fail with `NodeNotAvailable`.
pub struct RpcClient {
    pools: Arc<ConnectionPoolManager>,
    metrics: Arc<ClusterMetrics>,
}

impl RpcClient {
    pub fn new(pools: Arc<ConnectionPoolManager>, metrics: Arc<ClusterMetrics>) -> Self {
        Self { pools, metrics }
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    /// Call `module/method` on one member of `service_id`.
    #[instrument(skip(self, args))]
    pub async fn call_remote_procedure(
        &self,
        service_id: &str,
        module: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        self.metrics.rpc_calls.inc();
        let result = self.send(service_id, module, method, args).await;
        if let Err(e) = &result {
            // Domain codes are handler-defined, keep them out of the label set.
            let label = match e {
                ClusterError::Remote(_) => "Remote",
                other => other.code(),
            };
            self.metrics.record_failure(label);
            tracing::debug!(code = e.code(), error = %e, "rpc call failed");
        }
        result
    }

    /// Typed wrapper around [`RpcClient::call_remote_procedure`].
    pub async fn call<A, R>(
        &self,
        service_id: &str,
        module: &str,
        method: &str,
        args: &A,
    ) -> Result<R, ClusterError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args).map_err(|e| ClusterError::InvalidPayload {
            reason: "failed to serialize rpc arguments".into(),
            source: Some(Box::new(e)),
        })?;
        let value = self
            .call_remote_procedure(service_id, module, method, args)
            .await?;
        serde_json::from_value(value).map_err(|e| ClusterError::InvalidPayload {
            reason: format!("unexpected response shape for {module}/{method}"),
            source: Some(Box::new(e)),
        })
    }

    async fn send(
        &self,
        service_id: &str,
        module: &str,
        method: &str,
        data: Value,
    ) -> Result<Value, ClusterError> {
        let pool = match self.pools.acquire(service_id)? {
            PoolEntry::Pool(pool) => pool,
            PoolEntry::NoInstance => {
                return Err(ClusterError::NoInstanceAvailable {
                    service_id: service_id.to_string(),
                })
            }
        };

        let body = serde_json::to_vec(&RpcRequest {
            module: module.to_string(),
            method: method.to_string(),
            data,
        })
        .map_err(|e| ClusterError::InvalidPayload {
            reason: "failed to serialize rpc request".into(),
            source: Some(Box::new(e)),
        })?;

        let response = pool.post(RPC_PATH, body).await?;
        if response.status != 200 {
            return Err(ClusterError::UnexpectedStatus {
                address: response.address,
                status: response.status,
            });
        }
        decode_response(&response.body)
    }
}
