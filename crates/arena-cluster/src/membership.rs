//! Cluster membership backed by a coordination service.
//!
//! Each process registers one ephemeral node under `/{profiles}` and keeps a
//! snapshot of all siblings, rebuilt every time the directory's children
//! change. Snapshots are published through a `watch` channel: swapping the
//! current snapshot and notifying subscribers is a single step.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::config::ClusterConfig;
use crate::coordination::{
    ChildrenWatch, CoordinationClient, CoordinationSession, CreateMode, Session, SessionEvent,
};
use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use crate::types::{Member, MembershipSnapshot, NodeDescriptor, PROTOCOL_VERSION};

/// Registration lifecycle of the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Watching,
}

/// Owns this process's registration and the current membership snapshot.
pub struct MembershipRegistry {
    config: Arc<ClusterConfig>,
    coordinator: Arc<dyn CoordinationClient>,
    metrics: Arc<ClusterMetrics>,
    state_tx: watch::Sender<RegistryState>,
    snapshot_tx: watch::Sender<Arc<MembershipSnapshot>>,
    generation: AtomicU64,
    local: parking_lot::Mutex<Option<NodeDescriptor>>,
    session: parking_lot::Mutex<Option<Arc<dyn CoordinationSession>>>,
    watch_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MembershipRegistry {
    pub fn new(
        config: Arc<ClusterConfig>,
        coordinator: Arc<dyn CoordinationClient>,
        metrics: Arc<ClusterMetrics>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(RegistryState::Disconnected);
        let (snapshot_tx, _) = watch::channel(Arc::new(MembershipSnapshot::default()));
        Arc::new(Self {
            config,
            coordinator,
            metrics,
            state_tx,
            snapshot_tx,
            generation: AtomicU64::new(0),
            local: parking_lot::Mutex::new(None),
            session: parking_lot::Mutex::new(None),
            watch_task: parking_lot::Mutex::new(None),
            supervisor: parking_lot::Mutex::new(None),
        })
    }

    /// Register this process and start watching its profile directory.
    ///
    /// A no-op when cluster mode is disabled. Failures before the first
    /// successful registration are returned; later session losses are
    /// recovered in the background.
    pub async fn init(self: &Arc<Self>) -> Result<(), ClusterError> {
        if !self.config.enabled {
            tracing::info!("cluster mode disabled, skipping membership registration");
            return Ok(());
        }
        self.config.validate()?;

        let ip = resolve_local_ip(self.config.advertise_ip)?;
        let descriptor = NodeDescriptor::new(
            self.config.service_id.clone(),
            self.config.profiles.clone(),
            ip.to_string(),
            self.config.port,
        );

        // Re-initialization replaces the previous session entirely.
        self.stop_tasks().await;
        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                tracing::debug!(error = %e, "failed to close previous coordination session");
            }
        }

        *self.local.lock() = Some(descriptor.clone());
        let events = self.connect_and_register(&descriptor).await?;

        let supervisor = tokio::spawn(self.clone().supervise(descriptor, events));
        *self.supervisor.lock() = Some(supervisor);
        Ok(())
    }

    /// Current membership snapshot.
    pub fn get_nodes(&self) -> Arc<MembershipSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Distinct service ids currently present.
    pub fn get_node_ids(&self) -> BTreeSet<String> {
        self.get_nodes().service_ids()
    }

    /// Current members of `service_id`, in snapshot order.
    pub fn get_nodes_by_id(&self, service_id: &str) -> Vec<Member> {
        self.get_nodes().nodes_by_id(service_id)
    }

    /// Subscribe to membership changes. The receiver always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MembershipSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Membership changes as a stream, starting with the current snapshot.
    pub fn changes(&self) -> WatchStream<Arc<MembershipSnapshot>> {
        WatchStream::new(self.subscribe())
    }

    pub fn state(&self) -> RegistryState {
        *self.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<RegistryState> {
        self.state_tx.subscribe()
    }

    /// This process's registration, once `init` has resolved it.
    pub fn local(&self) -> Option<NodeDescriptor> {
        self.local.lock().clone()
    }

    /// Stop watching and reconnecting, remove the local node, and close the session.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        self.stop_tasks().await;
        let session = self.session.lock().take();
        let local = self.local();
        if let Some(session) = session {
            if let Some(local) = local {
                if let Err(e) = session.remove(&local.path()).await {
                    tracing::warn!(path = %local.path(), error = %e, "failed to remove own registration");
                }
            }
            session.close().await?;
        }
        self.set_state(RegistryState::Disconnected);
        tracing::info!("membership registry shut down");
        Ok(())
    }

    fn set_state(&self, state: RegistryState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "membership registry state changed");
        }
    }

    /// Abort the supervisor and watch loop and wait until both have stopped.
    async fn stop_tasks(&self) {
        let supervisor = self.supervisor.lock().take();
        let watch_task = self.watch_task.lock().take();
        for handle in [supervisor, watch_task].into_iter().flatten() {
            handle.abort();
            // Cancelled tasks report a JoinError; that is the expected outcome.
            let _ = handle.await;
        }
    }

    /// Open a session, register, publish the first snapshot and start the
    /// watch loop. Returns the session's event stream.
    async fn connect_and_register(
        self: &Arc<Self>,
        descriptor: &NodeDescriptor,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>, ClusterError> {
        self.set_state(RegistryState::Connecting);

        let timeout = self.config.connect_timeout;
        let connected = tokio::time::timeout(timeout, async {
            let mut session = self.coordinator.connect().await?;
            loop {
                match session.events.recv().await {
                    Some(SessionEvent::Connected) => return Ok::<Session, ClusterError>(session),
                    Some(SessionEvent::Disconnected) => continue,
                    None => {
                        return Err(ClusterError::coordination(
                            "session closed before connecting",
                        ))
                    }
                }
            }
        })
        .await;

        let session = match connected {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.set_state(RegistryState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                self.set_state(RegistryState::Disconnected);
                return Err(ClusterError::ConnectTimeout { timeout });
            }
        };
        self.set_state(RegistryState::Connected);

        let client = session.client;
        // Held by the registry before anything is created, so a cancelled
        // registration is still closed by `shutdown` or the next `init`.
        *self.session.lock() = Some(client.clone());

        let directory = descriptor.directory();
        let watch = match self.register(&client, descriptor).await {
            Ok(()) => {
                self.set_state(RegistryState::Registered);
                self.refresh(&client, &directory).await
            }
            Err(e) => Err(e),
        };
        let watch = match watch {
            Ok(watch) => watch,
            Err(e) => {
                {
                    let mut current = self.session.lock();
                    if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &client)) {
                        current.take();
                    }
                }
                if let Err(close_err) = client.close().await {
                    tracing::debug!(error = %close_err, "failed to close session after registration failure");
                }
                self.set_state(RegistryState::Disconnected);
                return Err(e);
            }
        };

        let handle = tokio::spawn(self.clone().watch_loop(client, directory, watch));
        if let Some(previous) = self.watch_task.lock().replace(handle) {
            previous.abort();
        }
        self.set_state(RegistryState::Watching);
        Ok(session.events)
    }

    async fn register(
        &self,
        client: &Arc<dyn CoordinationSession>,
        descriptor: &NodeDescriptor,
    ) -> Result<(), ClusterError> {
        let directory = descriptor.directory();
        if !client.exists(&directory).await? {
            match client
                .create(&directory, Vec::new(), CreateMode::Persistent)
                .await
            {
                Ok(()) | Err(ClusterError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let path = descriptor.path();
        // Left over from a previous session that has not expired yet.
        if client.exists(&path).await? {
            tracing::info!(path = %path, "removing stale registration");
            client.remove(&path).await?;
        }

        let data = serde_json::to_vec(descriptor).map_err(|e| ClusterError::InvalidPayload {
            reason: "failed to serialize node descriptor".into(),
            source: Some(Box::new(e)),
        })?;
        client.create(&path, data, CreateMode::Ephemeral).await?;
        tracing::info!(
            path = %path,
            service_id = %descriptor.service_id,
            "registered cluster member"
        );
        Ok(())
    }

    /// List the directory, re-arm the children watch, and publish a new snapshot.
    async fn refresh(
        &self,
        client: &Arc<dyn CoordinationSession>,
        directory: &str,
    ) -> Result<ChildrenWatch, ClusterError> {
        let (children, watch) = client.watch_children(directory).await?;
        let local_uuid = self.local.lock().as_ref().map(|d| d.uuid.clone());

        let mut members = Vec::with_capacity(children.len());
        for child in children {
            let path = format!("{directory}/{child}");
            let data = match client.get_data(&path).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    tracing::debug!(path = %path, "member disappeared before its data was read");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to read member data, skipping");
                    continue;
                }
            };
            let descriptor: NodeDescriptor = match serde_json::from_slice(&data) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "skipping member with malformed data");
                    continue;
                }
            };
            if descriptor.version != PROTOCOL_VERSION {
                tracing::warn!(
                    path = %path,
                    version = descriptor.version,
                    expected = PROTOCOL_VERSION,
                    "member registered with a different protocol version"
                );
            }
            let is_self = local_uuid.as_deref() == Some(descriptor.uuid.as_str());
            members.push(Member {
                path,
                is_self,
                data: descriptor,
            });
        }

        self.publish(members);
        Ok(watch)
    }

    fn publish(&self, members: Vec<Member>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(MembershipSnapshot::new(generation, members));
        self.metrics.members.set(snapshot.len() as i64);
        self.metrics.services.set(snapshot.service_ids().len() as i64);
        tracing::debug!(
            generation,
            members = snapshot.len(),
            "membership changed"
        );
        self.snapshot_tx.send_replace(snapshot);
    }

    async fn watch_loop(
        self: Arc<Self>,
        client: Arc<dyn CoordinationSession>,
        directory: String,
        mut watch: ChildrenWatch,
    ) {
        loop {
            if watch.await.is_err() {
                tracing::debug!(directory = %directory, "children watch dropped with its session");
                return;
            }
            // Retry until the refresh succeeds or the supervisor aborts this
            // task on session loss.
            watch = loop {
                match self.refresh(&client, &directory).await {
                    Ok(next) => break next,
                    Err(e) => {
                        tracing::warn!(directory = %directory, error = %e, "failed to refresh membership");
                        tokio::time::sleep(self.config.reconnect.initial_backoff).await;
                    }
                }
            };
        }
    }

    /// Wait for the session to drop, then reconnect until it succeeds.
    async fn supervise(
        self: Arc<Self>,
        descriptor: NodeDescriptor,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            match events.recv().await {
                Some(SessionEvent::Connected) => continue,
                Some(SessionEvent::Disconnected) | None => {}
            }

            tracing::warn!(uuid = %descriptor.uuid, "coordination session lost, reconnecting");
            if let Some(handle) = self.watch_task.lock().take() {
                handle.abort();
            }
            self.session.lock().take();
            self.set_state(RegistryState::Disconnected);

            let mut attempt: u32 = 0;
            events = loop {
                tokio::time::sleep(self.config.reconnect.delay(attempt)).await;
                match self.connect_and_register(&descriptor).await {
                    Ok(events) => {
                        self.metrics.reconnects.inc();
                        tracing::info!(attempt, uuid = %descriptor.uuid, "coordination session re-established");
                        break events;
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                        attempt = attempt.saturating_add(1);
                    }
                }
            };
        }
    }
}

/// The advertised address, or the first non-loopback IPv4 address across interfaces.
fn resolve_local_ip(advertise: Option<Ipv4Addr>) -> Result<Ipv4Addr, ClusterError> {
    if let Some(ip) = advertise {
        return Ok(ip);
    }
    let interfaces = if_addrs::get_if_addrs().map_err(|e| {
        tracing::warn!(error = %e, "failed to enumerate network interfaces");
        ClusterError::NoLocalAddress
    })?;
    first_non_loopback_ipv4(interfaces.iter().map(|iface| iface.ip()))
        .ok_or(ClusterError::NoLocalAddress)
}

fn first_non_loopback_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|addr| match addr {
        IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
        _ => None,
    })
}
