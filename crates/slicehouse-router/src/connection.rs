//! Disk-Writer Connection Manager
//!
//! Keeps exactly one connection from this source node to every disk-writer
//! node that has a registered volume.
//!
//! ## How It Works
//!
//! ```text
//! Mirror<WriterVolume> (storage/volume/writer/)
//!     │ revision changed
//!     ▼
//! update_connections(volumes)
//!     to_close = connected nodes without a volume      (sorted, closed first)
//!     to_open  = volume nodes without a connection     (sorted, dialed after)
//!
//! Connection (one per node)
//!     dial loop: dial -> connected -> wait for session end -> dial again
//!     failures are logged and retried with backoff until the connection closes
//! ```
//!
//! ## Shutdown Order
//!
//! 1. Stop the reconciliation task, an in-flight pass completes first
//! 2. Stop the volumes mirror
//! 3. Close every connection
//!
//! ## Usage
//!
//! ```ignore
//! let manager = ConnectionManager::start(node_id, store, transport, backoff).await?;
//! if let Some(conn) = manager.connection_to_volume(&volume_id).await {
//!     assert!(conn.is_connected());
//! }
//! manager.shutdown().await;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use slicehouse_core::{ExponentialBackoff, NodeId, VolumeId, WriterVolume};
use slicehouse_metadata::schema::WRITER_VOLUMES_PREFIX;
use slicehouse_metadata::{KvStore, Mirror};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Dials disk-writer nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, node_id: &NodeId, address: &str) -> Result<Arc<dyn TransportSession>>;
}

/// One established, multiplexed session with a disk-writer node.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Resolves when the session ends, from either side.
    async fn closed(&self);

    async fn close(&self);
}

/// Auto-reconnecting connection to one disk-writer node.
pub struct Connection {
    remote_node_id: NodeId,
    remote_address: String,
    session: watch::Receiver<Option<Arc<dyn TransportSession>>>,
    cancel: CancellationToken,
    task_handle: RwLock<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Start the dial loop, the connection is usable once `is_connected` is true.
    pub fn open(
        local_node_id: NodeId,
        remote_node_id: NodeId,
        remote_address: String,
        transport: Arc<dyn Transport>,
        backoff: ExponentialBackoff,
    ) -> Arc<Self> {
        let (session_tx, session) = watch::channel(None);
        let cancel = CancellationToken::new();

        let task = DialTask {
            local_node_id,
            remote_node_id: remote_node_id.clone(),
            remote_address: remote_address.clone(),
            transport,
            backoff,
            session_tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        Arc::new(Self {
            remote_node_id,
            remote_address,
            session,
            cancel,
            task_handle: RwLock::new(Some(handle)),
        })
    }

    pub fn remote_node_id(&self) -> &NodeId {
        &self.remote_node_id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .borrow()
            .as_ref()
            .is_some_and(|session| !session.is_closed())
    }

    /// Current session, if connected.
    pub fn session(&self) -> Option<Arc<dyn TransportSession>> {
        self.session.borrow().clone().filter(|s| !s.is_closed())
    }

    /// Stop the dial loop and close the session.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task_handle.write().await.take() {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_node_id", &self.remote_node_id)
            .field("remote_address", &self.remote_address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct DialTask {
    local_node_id: NodeId,
    remote_node_id: NodeId,
    remote_address: String,
    transport: Arc<dyn Transport>,
    backoff: ExponentialBackoff,
    session_tx: watch::Sender<Option<Arc<dyn TransportSession>>>,
    cancel: CancellationToken,
}

impl DialTask {
    async fn run(self) {
        let mut attempt = 0;
        loop {
            let dialed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                dialed = self.transport.dial(&self.remote_node_id, &self.remote_address) => dialed,
            };

            match dialed {
                Ok(session) => {
                    attempt = 0;
                    self.session_tx.send_replace(Some(session.clone()));
                    info!(
                        local_node_id = %self.local_node_id,
                        remote_node_id = %self.remote_node_id,
                        address = %self.remote_address,
                        "disk writer client connected"
                    );

                    let shutdown = tokio::select! {
                        _ = self.cancel.cancelled() => true,
                        _ = session.closed() => false,
                    };

                    session.close().await;
                    self.session_tx.send_replace(None);
                    info!(
                        remote_node_id = %self.remote_node_id,
                        address = %self.remote_address,
                        reason = if shutdown { "shutdown" } else { "session closed" },
                        "disk writer client disconnected"
                    );
                    if shutdown {
                        break;
                    }
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        remote_node_id = %self.remote_node_id,
                        address = %self.remote_address,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Cannot dial disk writer"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct ConnectionsState {
    connections: BTreeMap<NodeId, Arc<Connection>>,
    volumes: BTreeMap<VolumeId, NodeId>,
}

/// Owns all disk-writer connections of this source node.
pub struct ConnectionManager {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    dial_backoff: ExponentialBackoff,
    volumes: Mirror<WriterVolume>,
    state: RwLock<ConnectionsState>,
    cancel: CancellationToken,
    task_handle: RwLock<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Connect to the registered nodes and follow registration changes.
    pub async fn start(
        node_id: NodeId,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        dial_backoff: ExponentialBackoff,
    ) -> Result<Arc<Self>> {
        let volumes = Mirror::start(store, WRITER_VOLUMES_PREFIX).await?;
        let mut changes = volumes.subscribe();

        let manager = Arc::new(Self {
            node_id,
            transport,
            dial_backoff,
            volumes,
            state: RwLock::new(ConnectionsState::default()),
            cancel: CancellationToken::new(),
            task_handle: RwLock::new(None),
        });

        manager.update_connections().await;

        let weak = Arc::downgrade(&manager);
        let cancel = manager.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.update_connections().await;
            }
        });
        *manager.task_handle.write().await = Some(handle);

        info!(node_id = %manager.node_id, "Started connection manager");
        Ok(manager)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub async fn connection_to_node(&self, node_id: &NodeId) -> Option<Arc<Connection>> {
        self.state.read().await.connections.get(node_id).cloned()
    }

    pub async fn connection_to_volume(&self, volume_id: &VolumeId) -> Option<Arc<Connection>> {
        let state = self.state.read().await;
        let node_id = state.volumes.get(volume_id)?;
        state.connections.get(node_id).cloned()
    }

    pub async fn connections_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    async fn update_connections(&self) {
        let volumes = self.volumes.snapshot().await;

        let mut nodes: BTreeMap<NodeId, String> = BTreeMap::new();
        let mut volume_nodes = BTreeMap::new();
        for volume in volumes {
            nodes
                .entry(volume.node_id.clone())
                .or_insert_with(|| volume.node_address.clone());
            volume_nodes.insert(volume.volume_id, volume.node_id);
        }

        let to_close: Vec<Arc<Connection>> = {
            let mut state = self.state.write().await;
            state.volumes = volume_nodes;

            let to_close: Vec<NodeId> = state
                .connections
                .keys()
                .filter(|node_id| !nodes.contains_key(*node_id))
                .cloned()
                .collect();
            let to_open: Vec<&NodeId> = nodes
                .keys()
                .filter(|node_id| !state.connections.contains_key(*node_id))
                .collect();

            if to_close.is_empty() && to_open.is_empty() {
                debug!("Volumes changed, connections are up to date");
                return;
            }
            info!(
                to_open = ?to_open,
                to_close = ?to_close,
                "the list of volumes has changed, updating connections"
            );

            to_close
                .iter()
                .filter_map(|node_id| state.connections.remove(node_id))
                .collect()
        };

        for connection in to_close {
            connection.close().await;
        }

        let mut state = self.state.write().await;
        for (node_id, address) in nodes {
            if state.connections.contains_key(&node_id) {
                continue;
            }
            let connection = Connection::open(
                self.node_id.clone(),
                node_id.clone(),
                address,
                self.transport.clone(),
                self.dial_backoff.clone(),
            );
            state.connections.insert(node_id, connection);
        }
    }

    /// Stop following registrations and close all connections.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task_handle.write().await.take() {
            let _ = handle.await;
        }
        self.volumes.stop().await;

        let connections: Vec<Arc<Connection>> = {
            let mut state = self.state.write().await;
            std::mem::take(&mut state.connections).into_values().collect()
        };
        futures::future::join_all(connections.iter().map(|c| c.close())).await;

        info!(node_id = %self.node_id, "Closed all disk writer connections");
    }
}
