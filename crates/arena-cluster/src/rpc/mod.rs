//! Inter-node RPC over HTTP.
//!
//! Requests are `POST /rpc` with a JSON `{module, method, data}` body. Replies
//! are always HTTP 200 carrying either `{module, method, data}` or
//! `{error: {code, message}}`; any other status is a transport failure.

pub mod client;
pub mod envelope;
pub mod handler;
pub mod pool;
pub mod server;

pub use client::RpcClient;
pub use envelope::{RpcRequest, RpcResponse};
pub use handler::{handler_fn, HandlerRegistry, RpcHandler, TimeHandler};
pub use pool::{ConnectionPool, ConnectionPoolManager, PoolEntry};
pub use server::{router, RpcServer};

/// Path of the RPC endpoint on every node.
pub const RPC_PATH: &str = "/rpc";
