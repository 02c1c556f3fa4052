//! Hierarchical coordination service used for membership.
//!
//! A [`CoordinationClient`] opens sessions; a [`CoordinationSession`] exposes
//! the tree operations membership needs. Ephemeral nodes live exactly as long
//! as the session that created them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::ClusterError;

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

/// Connection-state notifications for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
}

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed automatically when the creating session ends.
    Ephemeral,
}

/// Fires once when the watched node's children change. Dropped without firing
/// when the session ends.
pub type ChildrenWatch = oneshot::Receiver<()>;

/// An opened session plus its connection-state event stream.
pub struct Session {
    pub client: Arc<dyn CoordinationSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Opens sessions against a coordination service.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Start a new session. The session reports [`SessionEvent::Connected`]
    /// on its event stream once it is usable.
    async fn connect(&self) -> Result<Session, ClusterError>;
}

/// Tree operations within one session.
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, ClusterError>;

    /// Create a node. Fails with [`ClusterError::NodeExists`] if the path is taken.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode)
        -> Result<(), ClusterError>;

    /// Remove a node. Removing a missing node is not an error.
    async fn remove(&self, path: &str) -> Result<(), ClusterError>;

    /// Data stored at `path`, or `None` if the node does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, ClusterError>;

    /// List the direct children of `path` (names only) and arm a one-shot
    /// watch that fires on the next change to that list.
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChildrenWatch), ClusterError>;

    /// End the session, removing its ephemeral nodes.
    async fn close(&self) -> Result<(), ClusterError>;
}

/// Name of the last path segment, if `path` is a direct child of `parent`.
pub(crate) fn child_name<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(parent)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}

/// Parent directory of `path`; `"/"` for top-level nodes.
pub(crate) fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_name_matches_direct_children_only() {
        assert_eq!(child_name("/dev", "/dev/10.0.0.1:9000"), Some("10.0.0.1:9000"));
        assert_eq!(child_name("/dev", "/dev"), None);
        assert_eq!(child_name("/dev", "/dev/a/b"), None);
        assert_eq!(child_name("/dev", "/devx/a"), None);
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent_path("/dev/10.0.0.1:9000"), "/dev");
        assert_eq!(parent_path("/dev"), "/");
    }
}
