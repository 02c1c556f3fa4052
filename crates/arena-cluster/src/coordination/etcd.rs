use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, LeaseGrantOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::coordination::{
    child_name, ChildrenWatch, CoordinationClient, CoordinationSession, CreateMode, Session,
    SessionEvent,
};
use crate::error::ClusterError;

/// etcd-backed coordination. Each session owns one lease; ephemeral nodes are
/// keys attached to it, so they vanish when the lease is revoked or expires.
pub struct EtcdCoordinator {
    endpoints: Vec<String>,
    lease_ttl: i64,
}

impl EtcdCoordinator {
    /// - `endpoints`: etcd endpoints, e.g. `["localhost:2379"]`.
    /// - `lease_ttl`: TTL in seconds for session leases.
    pub fn new(endpoints: Vec<String>, lease_ttl: i64) -> Self {
        assert!(lease_ttl > 0, "lease_ttl must be positive, got {lease_ttl}");
        Self {
            endpoints,
            lease_ttl,
        }
    }

    fn map_err(e: etcd_client::Error) -> ClusterError {
        ClusterError::Coordination {
            reason: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordinator {
    async fn connect(&self) -> Result<Session, ClusterError> {
        let client = Client::connect(&self.endpoints, None)
            .await
            .map_err(Self::map_err)?;
        let client = Arc::new(Mutex::new(client));

        let lease_id = {
            let mut c = client.lock().await;
            c.lease_grant(self.lease_ttl, None::<LeaseGrantOptions>)
                .await
                .map_err(Self::map_err)?
                .id()
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(SessionEvent::Connected);

        let keep_alive_interval = Duration::from_secs((self.lease_ttl as u64).max(3) / 3);
        let handle = tokio::spawn(keep_alive(
            client.clone(),
            lease_id,
            keep_alive_interval,
            events_tx,
        ));

        Ok(Session {
            client: Arc::new(EtcdSession {
                client,
                lease_id,
                keep_alive_handle: parking_lot::Mutex::new(Some(handle)),
            }),
            events: events_rx,
        })
    }
}

/// Keep the session lease alive. Any failure ends the session: the lease is
/// treated as lost and `Disconnected` is reported.
async fn keep_alive(
    client: Arc<Mutex<Client>>,
    lease_id: i64,
    interval: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let result = {
        let mut c = client.lock().await;
        c.lease_keep_alive(lease_id).await
    };
    match result {
        Ok((mut keeper, mut stream)) => loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = keeper.keep_alive().await {
                tracing::warn!(lease_id, error = %e, "etcd lease keep-alive failed");
                break;
            }
            match tokio::time::timeout(Duration::from_secs(5), stream.message()).await {
                Ok(Ok(Some(resp))) if resp.ttl() > 0 => {}
                Ok(Ok(Some(_))) => {
                    tracing::warn!(lease_id, "etcd lease expired");
                    break;
                }
                Ok(Ok(None)) => {
                    tracing::warn!(lease_id, "etcd keep-alive stream ended");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(lease_id, error = %e, "etcd keep-alive stream error");
                    break;
                }
                Err(_) => {
                    tracing::warn!(lease_id, "etcd keep-alive response timed out");
                    break;
                }
            }
        },
        Err(e) => {
            tracing::warn!(lease_id, error = %e, "etcd keep-alive initialization failed");
        }
    }
    let _ = events.send(SessionEvent::Disconnected);
}

/// One lease-scoped session against etcd.
pub struct EtcdSession {
    client: Arc<Mutex<Client>>,
    lease_id: i64,
    keep_alive_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl CoordinationSession for EtcdSession {
    async fn exists(&self, path: &str) -> Result<bool, ClusterError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(path, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(EtcdCoordinator::map_err)?;
        Ok(resp.count() > 0)
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<(), ClusterError> {
        let options = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(PutOptions::new().with_lease(self.lease_id)),
        };
        // Only create if the key is still absent.
        let txn = Txn::new()
            .when([Compare::create_revision(path, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(path, data, options)]);

        let mut client = self.client.lock().await;
        let resp = client.txn(txn).await.map_err(EtcdCoordinator::map_err)?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(ClusterError::NodeExists {
                path: path.to_string(),
            })
        }
    }

    async fn remove(&self, path: &str) -> Result<(), ClusterError> {
        let mut client = self.client.lock().await;
        client
            .delete(path, None)
            .await
            .map_err(EtcdCoordinator::map_err)?;
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, ClusterError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(path, None)
            .await
            .map_err(EtcdCoordinator::map_err)?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChildrenWatch), ClusterError> {
        let prefix = format!("{path}/");
        let mut client = self.client.lock().await;

        // Watch before listing so no change between the two is missed.
        let (mut watcher, mut stream) = client
            .watch(prefix.as_bytes(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(EtcdCoordinator::map_err)?;

        let resp = client
            .get(
                prefix.as_bytes(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await
            .map_err(EtcdCoordinator::map_err)?;
        drop(client);

        let children = resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok())
            .filter_map(|key| child_name(path, key).map(str::to_string))
            .collect();

        let parent = path.to_string();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut tx = tx;
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = tx.closed() => None,
                    msg = stream.message() => Some(msg),
                };
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Some(resp)) => {
                        let changed = resp.events().iter().any(|e| {
                            matches!(e.event_type(), EventType::Put | EventType::Delete)
                                && e
                                    .kv()
                                    .and_then(|kv| kv.key_str().ok())
                                    .is_some_and(|key| child_name(&parent, key).is_some())
                        });
                        if changed {
                            let _ = tx.send(());
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(path = %parent, error = %e, "etcd children watch failed");
                        break;
                    }
                }
            }
            if let Err(e) = watcher.cancel().await {
                tracing::debug!(error = %e, "failed to cancel etcd children watch");
            }
        });

        Ok((children, rx))
    }

    async fn close(&self) -> Result<(), ClusterError> {
        if let Some(handle) = self.keep_alive_handle.lock().take() {
            handle.abort();
        }
        let mut client = self.client.lock().await;
        // Revoking the lease deletes every ephemeral key of this session.
        client
            .lease_revoke(self.lease_id)
            .await
            .map_err(EtcdCoordinator::map_err)?;
        Ok(())
    }
}

impl Drop for EtcdSession {
    fn drop(&mut self) {
        if let Some(handle) = self.keep_alive_handle.lock().take() {
            handle.abort();
        }
    }
}
