use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use tokio::net::TcpListener;

use crate::error::ClusterError;
use crate::rpc::envelope::{decode_request, RpcResponse};
use crate::rpc::handler::HandlerRegistry;
use crate::rpc::RPC_PATH;

/// Router serving `POST /rpc`. Merge it into a larger application router or
/// serve it on its own with [`RpcServer`].
///
/// Every reply that reaches the handler table is HTTP 200; failures travel in
/// the `error` field.
pub fn router(handlers: Arc<HandlerRegistry>) -> Router {
    Router::new()
        .route(RPC_PATH, post(handle_rpc))
        .with_state(handlers)
}

async fn handle_rpc(
    State(handlers): State<Arc<HandlerRegistry>>,
    body: Bytes,
) -> Json<RpcResponse> {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting malformed rpc request");
            return Json(RpcResponse::failure(e.to_rpc_error()));
        }
    };

    match handlers
        .dispatch(&request.module, &request.method, request.data)
        .await
    {
        Ok(data) => Json(RpcResponse::success(request.module, request.method, data)),
        Err(e) => {
            tracing::debug!(
                module = %request.module,
                method = %request.method,
                code = e.code(),
                "rpc handler failed"
            );
            Json(RpcResponse::failure(e.to_rpc_error()))
        }
    }
}

/// Standalone listener for the RPC router.
pub struct RpcServer {
    listener: TcpListener,
    router: Router,
}

impl RpcServer {
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self, ClusterError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, router })
    }

    pub fn from_listener(listener: TcpListener, router: Router) -> Self {
        Self { listener, router }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClusterError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ClusterError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.listener.local_addr()?;
        tracing::info!(%addr, "rpc server listening");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!(%addr, "rpc server stopped");
        Ok(())
    }
}
