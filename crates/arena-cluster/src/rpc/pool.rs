//! Per-service connection pools for outbound RPC.
//!
//! The manager caches one entry per target service id and throws the whole
//! cache away whenever the membership snapshot changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{watch, Semaphore};

use crate::config::PoolLimits;
use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use crate::types::{MembershipSnapshot, PeerAddress};

/// Raw reply from one pooled request.
#[derive(Debug, Clone)]
pub struct PoolResponse {
    pub address: PeerAddress,
    pub status: u16,
    pub body: Bytes,
}

/// Load-balanced HTTP pool over the members of one service.
pub struct ConnectionPool {
    service_id: String,
    peers: Vec<PeerAddress>,
    next: AtomicUsize,
    http: reqwest::Client,
    limits: PoolLimits,
    /// Queued plus in-flight requests.
    pending: Semaphore,
    /// In-flight requests.
    sockets: Semaphore,
}

impl ConnectionPool {
    /// `peers` must be non-empty.
    pub fn new(
        service_id: impl Into<String>,
        peers: Vec<PeerAddress>,
        limits: PoolLimits,
    ) -> Result<Self, ClusterError> {
        let service_id = service_id.into();
        if peers.is_empty() {
            return Err(ClusterError::NoInstanceAvailable { service_id });
        }
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(limits.max_sockets)
            .build()
            .map_err(|e| ClusterError::InvalidConfig {
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            service_id,
            peers,
            next: AtomicUsize::new(0),
            http,
            pending: Semaphore::new(limits.max_pending),
            sockets: Semaphore::new(limits.max_sockets),
            limits,
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    fn next_peer(&self) -> &PeerAddress {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        &self.peers[idx]
    }

    /// POST a JSON body to `path` on the next peer in rotation.
    ///
    /// Rejects immediately with `PoolSaturated` when `max_pending` requests
    /// are already queued. The request timeout covers the wait for a socket.
    pub async fn post(&self, path: &str, body: Vec<u8>) -> Result<PoolResponse, ClusterError> {
        let _pending = self
            .pending
            .try_acquire()
            .map_err(|_| ClusterError::PoolSaturated {
                service_id: self.service_id.clone(),
                max_pending: self.limits.max_pending,
            })?;

        let address = self.next_peer().clone();
        let url = format!("{}{}", address.base_url(), path);

        let request = async {
            let _socket = self
                .sockets
                .acquire()
                .await
                .map_err(|_| ClusterError::ShuttingDown)?;
            let response = self
                .http
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(|e| ClusterError::NodeNotAvailable {
                    address: address.clone(),
                    source: Some(Box::new(e)),
                })?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| ClusterError::NodeNotAvailable {
                    address: address.clone(),
                    source: Some(Box::new(e)),
                })?;
            Ok(PoolResponse {
                address: address.clone(),
                status,
                body,
            })
        };

        let outcome = tokio::time::timeout(self.limits.request_timeout, request).await;
        match outcome {
            Ok(result) => result,
            Err(elapsed) => Err(ClusterError::NodeNotAvailable {
                address,
                source: Some(Box::new(elapsed)),
            }),
        }
    }
}

/// Cached lookup result for one service id.
#[derive(Clone)]
pub enum PoolEntry {
    /// The service had no members when the entry was built.
    NoInstance,
    Pool(Arc<ConnectionPool>),
}

struct PoolCache {
    membership: watch::Receiver<Arc<MembershipSnapshot>>,
    entries: HashMap<String, PoolEntry>,
}

/// Lazily builds and caches one [`PoolEntry`] per target service id.
pub struct ConnectionPoolManager {
    limits: PoolLimits,
    metrics: Arc<ClusterMetrics>,
    cache: parking_lot::Mutex<PoolCache>,
}

impl ConnectionPoolManager {
    pub fn new(
        membership: watch::Receiver<Arc<MembershipSnapshot>>,
        limits: PoolLimits,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        Self {
            limits,
            metrics,
            cache: parking_lot::Mutex::new(PoolCache {
                membership,
                entries: HashMap::new(),
            }),
        }
    }

    /// Cached entry for `service_id`, building it from the current snapshot
    /// if absent. A membership change since the last call clears the cache first.
    pub fn acquire(&self, service_id: &str) -> Result<PoolEntry, ClusterError> {
        let mut guard = self.cache.lock();
        let cache = &mut *guard;

        if cache.membership.has_changed().unwrap_or(false) {
            cache.membership.borrow_and_update();
            if !cache.entries.is_empty() {
                tracing::debug!(
                    pools = cache.entries.len(),
                    "membership changed, dropping cached connection pools"
                );
                cache.entries.clear();
            }
        }

        if let Some(entry) = cache.entries.get(service_id) {
            return Ok(entry.clone());
        }

        let peers: Vec<PeerAddress> = cache
            .membership
            .borrow()
            .nodes_by_id(service_id)
            .iter()
            .map(|member| member.data.address())
            .collect();

        let entry = if peers.is_empty() {
            tracing::debug!(service_id, "no instance available, caching empty entry");
            PoolEntry::NoInstance
        } else {
            tracing::debug!(service_id, peers = peers.len(), "created connection pool");
            PoolEntry::Pool(Arc::new(ConnectionPool::new(
                service_id,
                peers,
                self.limits.clone(),
            )?))
        };
        cache.entries.insert(service_id.to_string(), entry.clone());
        self.metrics.rpc_pools.set(cache.entries.len() as i64);
        Ok(entry)
    }

    /// Drop every cached entry.
    pub fn invalidate_all(&self) {
        self.cache.lock().entries.clear();
        self.metrics.rpc_pools.set(0);
    }

    /// Number of cached entries, `NoInstance` included.
    pub fn len(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Member, NodeDescriptor};
    use std::time::Duration;

    fn member(service_id: &str, ip: &str, port: u16) -> Member {
        let data = NodeDescriptor::new(service_id, "dev", ip, port);
        Member {
            path: data.path(),
            is_self: false,
            data,
        }
    }

    fn snapshot(generation: u64, members: Vec<Member>) -> Arc<MembershipSnapshot> {
        Arc::new(MembershipSnapshot::new(generation, members))
    }

    fn manager(
        initial: Arc<MembershipSnapshot>,
    ) -> (watch::Sender<Arc<MembershipSnapshot>>, ConnectionPoolManager) {
        let (tx, rx) = watch::channel(initial);
        let manager = ConnectionPoolManager::new(
            rx,
            PoolLimits::default(),
            Arc::new(ClusterMetrics::unregistered()),
        );
        (tx, manager)
    }

    fn pool(entry: PoolEntry) -> Arc<ConnectionPool> {
        match entry {
            PoolEntry::Pool(pool) => pool,
            PoolEntry::NoInstance => panic!("expected a pool"),
        }
    }

    #[test]
    fn builds_pool_from_members_in_order() {
        let (_tx, manager) = manager(snapshot(
            1,
            vec![
                member("901", "10.0.0.1", 9000),
                member("902", "10.0.0.2", 9000),
                member("901", "10.0.0.3", 9001),
            ],
        ));

        let pool = pool(manager.acquire("901").unwrap());
        assert_eq!(pool.service_id(), "901");
        assert_eq!(
            pool.peers(),
            &[
                PeerAddress::new("10.0.0.1", 9000),
                PeerAddress::new("10.0.0.3", 9001)
            ]
        );
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn caches_entries_until_membership_changes() {
        let (tx, manager) = manager(snapshot(1, vec![member("901", "10.0.0.1", 9000)]));

        let first = pool(manager.acquire("901").unwrap());
        let again = pool(manager.acquire("901").unwrap());
        assert!(Arc::ptr_eq(&first, &again));

        assert!(matches!(manager.acquire("902").unwrap(), PoolEntry::NoInstance));
        assert_eq!(manager.len(), 2);

        tx.send_replace(snapshot(
            2,
            vec![
                member("901", "10.0.0.1", 9000),
                member("902", "10.0.0.2", 9000),
            ],
        ));

        // The whole cache goes, not just the service that changed.
        let rebuilt = pool(manager.acquire("901").unwrap());
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(manager.len(), 1);
        assert_eq!(
            pool(manager.acquire("902").unwrap()).peers(),
            &[PeerAddress::new("10.0.0.2", 9000)]
        );
    }

    #[test]
    fn no_instance_is_cached() {
        let (_tx, manager) = manager(snapshot(1, vec![]));
        assert!(matches!(manager.acquire("901").unwrap(), PoolEntry::NoInstance));
        assert_eq!(manager.len(), 1);
        manager.invalidate_all();
        assert!(manager.is_empty());
    }

    #[test]
    fn round_robin_over_peers() {
        let pool = ConnectionPool::new(
            "901",
            vec![
                PeerAddress::new("10.0.0.1", 9000),
                PeerAddress::new("10.0.0.2", 9000),
            ],
            PoolLimits::default(),
        )
        .unwrap();
        let picked: Vec<_> = (0..4).map(|_| pool.next_peer().host.clone()).collect();
        assert_eq!(picked, vec!["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = ConnectionPool::new("901", vec![], PoolLimits::default())
            .err()
            .unwrap();
        assert_eq!(err.code(), "NoInstanceAvailable");
    }

    #[tokio::test]
    async fn saturated_pool_rejects_new_requests() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept connections but never answer, so requests stay pending.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        let pool = Arc::new(
            ConnectionPool::new(
                "901",
                vec![PeerAddress::new("127.0.0.1", port)],
                PoolLimits {
                    max_pending: 1,
                    max_sockets: 1,
                    request_timeout: Duration::from_millis(500),
                },
            )
            .unwrap(),
        );

        let in_flight = tokio::spawn({
            let pool = pool.clone();
            async move { pool.post("/rpc", b"{}".to_vec()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = pool.post("/rpc", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, ClusterError::PoolSaturated { max_pending: 1, .. }));

        // The stalled request times out as a transport failure.
        let err = in_flight.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "NodeNotAvailable");
        server.abort();
    }
}
