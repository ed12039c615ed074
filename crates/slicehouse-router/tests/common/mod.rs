//! Mock disk-writer nodes for router tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use slicehouse_core::{ExponentialBackoff, NodeId, Slice, SliceKey};
use slicehouse_router::{
    Connection, NetworkFileOpener, NetworkOutput, Result, RouterConfig, RouterError, Transport,
    TransportSession,
};
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_backoff() -> ExponentialBackoff {
    ExponentialBackoff::new(Duration::from_millis(10), 2.0, Duration::from_millis(50))
}

pub fn test_config(node_id: &str) -> RouterConfig {
    RouterConfig {
        slice_open_backoff: fast_backoff(),
        dial_backoff: fast_backoff(),
        pipeline_close_timeout: Duration::from_secs(1),
        ..RouterConfig::default().with_node_id(node_id)
    }
}

/// Poll `check` until it returns true, panic after 5 seconds.
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

pub struct MockSession {
    token: CancellationToken,
}

#[async_trait]
impl TransportSession for MockSession {
    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }

    async fn close(&self) {
        self.token.cancel();
    }
}

/// In-process transport, nodes can be taken down and brought back.
#[derive(Default)]
pub struct MockTransport {
    down: Mutex<HashSet<NodeId>>,
    sessions: Mutex<HashMap<NodeId, Arc<MockSession>>>,
    dials: Mutex<Vec<NodeId>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Successful dials, in completion order.
    pub fn dials(&self) -> Vec<NodeId> {
        self.dials.lock().unwrap().clone()
    }

    pub fn dial_count(&self, node_id: &str) -> usize {
        self.dials
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.as_str() == node_id)
            .count()
    }

    /// Drop the session to the node and refuse new dials.
    pub fn disconnect(&self, node_id: &str) {
        let node_id = NodeId::from(node_id);
        self.down.lock().unwrap().insert(node_id.clone());
        if let Some(session) = self.sessions.lock().unwrap().remove(&node_id) {
            session.token.cancel();
        }
    }

    pub fn reconnect(&self, node_id: &str) {
        self.down.lock().unwrap().remove(&NodeId::from(node_id));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(&self, node_id: &NodeId, address: &str) -> Result<Arc<dyn TransportSession>> {
        if self.down.lock().unwrap().contains(node_id) {
            return Err(RouterError::Network(format!("{address} is unreachable")));
        }
        let session = Arc::new(MockSession {
            token: CancellationToken::new(),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(node_id.clone(), session.clone());
        self.dials.lock().unwrap().push(node_id.clone());
        Ok(session)
    }
}

/// Remote file that is ready while its connection is up, until the disk
/// writer terminates it.
pub struct MockNetworkFile {
    slice_key: SliceKey,
    connection: Arc<Connection>,
    writes: Arc<Mutex<Vec<(SliceKey, Bytes)>>>,
    terminated: CancellationToken,
}

#[async_trait]
impl NetworkOutput for MockNetworkFile {
    fn is_ready(&self) -> bool {
        self.connection.is_connected() && !self.terminated.is_cancelled()
    }

    async fn write(&self, _aligned: bool, chunk: Bytes) -> Result<usize> {
        if self.terminated.is_cancelled() {
            return Err(RouterError::Network("file terminated".into()));
        }
        if !self.connection.is_connected() {
            return Err(RouterError::Network("connection lost".into()));
        }
        let n = chunk.len();
        self.writes
            .lock()
            .unwrap()
            .push((self.slice_key.clone(), chunk));
        Ok(n)
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn terminated(&self) {
        self.terminated.cancelled().await
    }
}

#[derive(Default)]
pub struct MockOpener {
    writes: Arc<Mutex<Vec<(SliceKey, Bytes)>>>,
    files: Mutex<Vec<(SliceKey, CancellationToken)>>,
}

impl MockOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Vec<(SliceKey, Bytes)> {
        self.writes.lock().unwrap().clone()
    }

    /// Slice keys of all opened files, in open order.
    pub fn opened(&self) -> Vec<SliceKey> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// The disk writer owning the volume ends all files opened on it.
    pub fn terminate_volume(&self, volume_id: &str) {
        for (key, terminated) in self.files.lock().unwrap().iter() {
            if key.volume_id().as_str() == volume_id {
                terminated.cancel();
            }
        }
    }
}

#[async_trait]
impl NetworkFileOpener for MockOpener {
    async fn open(
        &self,
        _source_node_id: &NodeId,
        connection: &Arc<Connection>,
        slice: &Slice,
    ) -> Result<Arc<dyn NetworkOutput>> {
        let terminated = CancellationToken::new();
        self.files
            .lock()
            .unwrap()
            .push((slice.key.clone(), terminated.clone()));
        Ok(Arc::new(MockNetworkFile {
            slice_key: slice.key.clone(),
            connection: connection.clone(),
            writes: self.writes.clone(),
            terminated,
        }))
    }
}
