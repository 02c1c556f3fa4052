//! Cluster membership and inter-node RPC for game services.
//!
//! Every process registers itself as an ephemeral member under
//! `/{profiles}` in a coordination service, keeps a live snapshot of its
//! peers, and calls them over `POST /rpc` through per-service connection
//! pools. [`node::ClusterNode`] wires the pieces together.

pub mod config;
pub mod coordination;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod node;
pub mod rpc;
pub mod testing;
pub mod types;

/// Commonly used items.
pub mod prelude {
    pub use crate::config::ClusterConfig;
    pub use crate::coordination::memory::MemoryCoordinator;
    pub use crate::coordination::CoordinationClient;
    pub use crate::error::{ClusterError, RpcError};
    pub use crate::membership::{MembershipRegistry, RegistryState};
    pub use crate::metrics::ClusterMetrics;
    pub use crate::node::ClusterNode;
    pub use crate::rpc::{handler_fn, HandlerRegistry, RpcClient, RpcHandler};
    pub use crate::types::{Member, MembershipSnapshot, NodeDescriptor};
    pub use async_trait::async_trait;
    pub use serde_json::Value;

    #[cfg(feature = "etcd")]
    pub use crate::coordination::etcd::EtcdCoordinator;
}
