use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::coordination::{
    child_name, parent_path, ChildrenWatch, CoordinationClient, CoordinationSession, CreateMode,
    Session, SessionEvent,
};
use crate::error::ClusterError;

/// In-memory coordination tree for testing and single-process setups.
///
/// Clones share the same tree, so several registries can join one "cluster".
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
}

struct ZNode {
    data: Vec<u8>,
    /// Session that owns an ephemeral node.
    owner: Option<u64>,
}

struct Tree {
    nodes: BTreeMap<String, ZNode>,
    /// One-shot children watches per parent path, tagged with the arming session.
    child_watches: HashMap<String, Vec<(u64, oneshot::Sender<()>)>>,
    sessions: HashMap<u64, mpsc::UnboundedSender<SessionEvent>>,
    /// Sessions opened while unreachable; they never report connected.
    stalled: Vec<mpsc::UnboundedSender<SessionEvent>>,
    next_session_id: u64,
    reachable: bool,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            child_watches: HashMap::new(),
            sessions: HashMap::new(),
            stalled: Vec::new(),
            next_session_id: 1,
            reachable: true,
        }
    }
}

impl Tree {
    fn fire_child_watches(&mut self, parent: &str) {
        if let Some(watches) = self.child_watches.remove(parent) {
            for (_, tx) in watches {
                let _ = tx.send(());
            }
        }
    }

    fn end_session(&mut self, id: u64) -> Option<mpsc::UnboundedSender<SessionEvent>> {
        let events = self.sessions.remove(&id)?;

        for watches in self.child_watches.values_mut() {
            watches.retain(|(owner, _)| *owner != id);
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        let mut parents = BTreeSet::new();
        for path in owned {
            self.nodes.remove(&path);
            parents.insert(parent_path(&path).to_string());
        }
        for parent in parents {
            self.fire_child_watches(&parent);
        }
        Some(events)
    }

    fn check_session(&self, id: u64) -> Result<(), ClusterError> {
        if self.sessions.contains_key(&id) {
            Ok(())
        } else {
            Err(ClusterError::coordination(format!("session {id} expired")))
        }
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// When unreachable, new sessions never report connected. Sessions that
    /// stalled during an outage stay unconnected and are dropped on recovery.
    pub fn set_reachable(&self, reachable: bool) {
        let mut tree = self.tree.lock();
        tree.reachable = reachable;
        if reachable {
            tree.stalled.clear();
        }
    }

    /// Ids of live sessions.
    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.tree.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Expire a session as the service would after losing contact: its
    /// ephemeral nodes are removed and it receives `Disconnected`.
    pub fn expire_session(&self, id: u64) -> bool {
        let events = self.tree.lock().end_session(id);
        match events {
            Some(events) => {
                let _ = events.send(SessionEvent::Disconnected);
                true
            }
            None => false,
        }
    }

    pub fn expire_all_sessions(&self) {
        for id in self.session_ids() {
            self.expire_session(id);
        }
    }

    /// Direct children of `path`, sorted.
    pub fn children(&self, path: &str) -> Vec<String> {
        let tree = self.tree.lock();
        tree.nodes
            .keys()
            .filter_map(|p| child_name(path, p).map(str::to_string))
            .collect()
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// Write a persistent node outside any session, firing watches on its parent.
    pub fn put_raw(&self, path: &str, data: impl Into<Vec<u8>>) {
        let mut tree = self.tree.lock();
        tree.nodes.insert(
            path.to_string(),
            ZNode {
                data: data.into(),
                owner: None,
            },
        );
        tree.fire_child_watches(parent_path(path));
    }

    pub fn remove_raw(&self, path: &str) {
        let mut tree = self.tree.lock();
        if tree.nodes.remove(path).is_some() {
            tree.fire_child_watches(parent_path(path));
        }
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn connect(&self) -> Result<Session, ClusterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tree = self.tree.lock();
        let id = tree.next_session_id;
        tree.next_session_id += 1;

        if tree.reachable {
            let _ = tx.send(SessionEvent::Connected);
            tree.sessions.insert(id, tx);
        } else {
            tree.stalled.retain(|stalled| !stalled.is_closed());
            tree.stalled.push(tx);
        }

        Ok(Session {
            client: Arc::new(MemorySession {
                id,
                tree: self.tree.clone(),
            }),
            events: rx,
        })
    }
}

/// One session against a [`MemoryCoordinator`].
pub struct MemorySession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl CoordinationSession for MemorySession {
    async fn exists(&self, path: &str) -> Result<bool, ClusterError> {
        let tree = self.tree.lock();
        tree.check_session(self.id)?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<(), ClusterError> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        if !path.starts_with('/') || path.len() < 2 {
            return Err(ClusterError::coordination(format!("invalid path {path:?}")));
        }
        if tree.nodes.contains_key(path) {
            return Err(ClusterError::NodeExists {
                path: path.to_string(),
            });
        }
        let parent = parent_path(path).to_string();
        if parent != "/" && !tree.nodes.contains_key(&parent) {
            return Err(ClusterError::coordination(format!(
                "parent {parent} does not exist"
            )));
        }
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.id),
        };
        tree.nodes.insert(path.to_string(), ZNode { data, owner });
        tree.fire_child_watches(&parent);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), ClusterError> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        if tree.nodes.remove(path).is_some() {
            tree.fire_child_watches(parent_path(path));
        }
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, ClusterError> {
        let tree = self.tree.lock();
        tree.check_session(self.id)?;
        Ok(tree.nodes.get(path).map(|n| n.data.clone()))
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChildrenWatch), ClusterError> {
        let mut tree = self.tree.lock();
        tree.check_session(self.id)?;
        if !tree.nodes.contains_key(path) {
            return Err(ClusterError::coordination(format!("{path} does not exist")));
        }
        let children = tree
            .nodes
            .keys()
            .filter_map(|p| child_name(path, p).map(str::to_string))
            .collect();
        let (tx, rx) = oneshot::channel();
        tree.child_watches
            .entry(path.to_string())
            .or_default()
            .push((self.id, tx));
        Ok((children, rx))
    }

    async fn close(&self) -> Result<(), ClusterError> {
        self.tree.lock().end_session(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(coordinator: &MemoryCoordinator) -> Arc<dyn CoordinationSession> {
        let mut session = coordinator.connect().await.unwrap();
        assert_eq!(session.events.recv().await, Some(SessionEvent::Connected));
        session.client
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;

        let err = session
            .create("/dev/a", vec![], CreateMode::Ephemeral)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Coordination { .. }));

        session
            .create("/dev", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        session
            .create("/dev/a", b"x".to_vec(), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(session.get_data("/dev/a").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn create_existing_node_fails() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;
        session
            .create("/dev", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        let err = session
            .create("/dev", vec![], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NodeExists { path } if path == "/dev"));
    }

    #[tokio::test]
    async fn children_watch_fires_once() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;
        session
            .create("/dev", vec![], CreateMode::Persistent)
            .await
            .unwrap();

        let (children, watch) = session.watch_children("/dev").await.unwrap();
        assert!(children.is_empty());

        session
            .create("/dev/a", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        watch.await.unwrap();

        // Not re-armed: a second change has nobody to notify until watched again.
        session
            .create("/dev/b", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        let (children, _watch) = session.watch_children("/dev").await.unwrap();
        assert_eq!(children, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn expiry_removes_ephemeral_nodes_and_notifies() {
        let coordinator = MemoryCoordinator::new();
        let mut first = coordinator.connect().await.unwrap();
        assert_eq!(first.events.recv().await, Some(SessionEvent::Connected));
        let observer = connected(&coordinator).await;

        first
            .client
            .create("/dev", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        first
            .client
            .create("/dev/a", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        let (_, watch) = observer.watch_children("/dev").await.unwrap();

        let ids = coordinator.session_ids();
        assert!(coordinator.expire_session(ids[0]));

        assert_eq!(first.events.recv().await, Some(SessionEvent::Disconnected));
        watch.await.unwrap();
        assert!(coordinator.children("/dev").is_empty());
        assert!(first.client.exists("/dev").await.is_err());
        assert!(observer.exists("/dev").await.unwrap());
    }

    #[tokio::test]
    async fn close_drops_own_watches() {
        let coordinator = MemoryCoordinator::new();
        let session = connected(&coordinator).await;
        session
            .create("/dev", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        let (_, watch) = session.watch_children("/dev").await.unwrap();
        session.close().await.unwrap();
        assert!(watch.await.is_err());
        assert!(coordinator.session_ids().is_empty());
    }

    #[tokio::test]
    async fn unreachable_sessions_never_connect() {
        let coordinator = MemoryCoordinator::new();
        coordinator.set_reachable(false);
        let mut session = coordinator.connect().await.unwrap();
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), session.events.recv())
                .await;
        assert!(waited.is_err());
        assert!(session.client.exists("/").await.is_err());
    }

    #[tokio::test]
    async fn stalled_sessions_do_not_accumulate() {
        let coordinator = MemoryCoordinator::new();
        coordinator.set_reachable(false);
        for _ in 0..5 {
            // Each attempt gives up and drops its receiver.
            drop(coordinator.connect().await.unwrap());
        }
        let held = coordinator.connect().await.unwrap();
        assert_eq!(coordinator.tree.lock().stalled.len(), 1);

        coordinator.set_reachable(true);
        assert!(coordinator.tree.lock().stalled.is_empty());
        drop(held);
    }
}
