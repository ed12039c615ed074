//! Storage Router
//!
//! Entry point of the write path on a source node. Routes each record of a
//! sink to the sink pipeline, which balances it over the slices assigned to
//! this node.
//!
//! ## Architecture
//!
//! ```text
//! Mirror<Sink>        definition/sink/all/          enabled / deleted
//! Mirror<Slice>       storage/slice/level/local/    writing slices
//! Mirror<SourceNode>  runtime/source/node/          slice assignment
//!        │
//!        ▼ any change
//!   update task ──► SinkPipeline::update_slice_pipelines(assigned slices)
//!
//! dispatch(sink, record)
//!   └─ sink pipeline (opened lazily) ──► Balancer ──► SlicePipeline
//! ```
//!
//! ## Result Mapping
//!
//! | Outcome        | Status | Message                |
//! |----------------|--------|------------------------|
//! | Processed      | 200    | `processed`            |
//! | Accepted       | 202    | `accepted`             |
//! | Error          | error  | error text, `stream.in.<name>` |
//!
//! ## Shutdown Order
//!
//! 1. Reject new records and wait for the records in flight
//! 2. Stop the update task and the mirrors
//! 3. Close all sink pipelines (and their slice pipelines)
//! 4. Close the disk-writer connections
//! 5. Unregister this source node

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use http::StatusCode;
use slicehouse_core::{
    KeyPrefix, Level, NodeId, RecordContext, Sink, SinkKey, Slice, SliceState,
};
use slicehouse_metadata::schema::{SINKS, SLICES, SOURCE_NODES_PREFIX};
use slicehouse_metadata::{KvStore, Mirror, Repository, SourceNode};
use tokio::sync::{mpsc, watch, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assignment::assign_slices;
use crate::balancer::new_balancer;
use crate::config::RouterConfig;
use crate::connection::{ConnectionManager, Transport};
use crate::encoding::{EncodingPipelineFactory, JsonLinesFactory, RecordStatus};
use crate::error::{Result, RouterError, ERROR_NAME_PREFIX};
use crate::network::NetworkFileOpener;
use crate::pipeline::{PipelineContext, SinkPipeline};

/// Result of writing one record to one sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResult {
    pub sink_key: SinkKey,
    pub status_code: StatusCode,
    /// `stream.in.<name>` for failed writes.
    pub error_name: Option<String>,
    pub message: String,
}

impl SinkResult {
    fn from_write(sink_key: SinkKey, result: Result<RecordStatus>) -> Self {
        match result {
            Ok(RecordStatus::Processed) => Self {
                sink_key,
                status_code: StatusCode::OK,
                error_name: None,
                message: "processed".to_string(),
            },
            Ok(RecordStatus::Accepted) => Self {
                sink_key,
                status_code: StatusCode::ACCEPTED,
                error_name: None,
                message: "accepted".to_string(),
            },
            Err(e) => {
                let status_code = e.status_code();
                if status_code == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(sink_key = %sink_key, error = %e, "Cannot write record");
                } else {
                    debug!(sink_key = %sink_key, error = %e, "Record rejected");
                }
                Self {
                    sink_key,
                    status_code,
                    error_name: Some(e.error_name()),
                    message: e.to_string(),
                }
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code.is_success()
    }
}

/// Result of writing one record to several sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinksResult {
    /// Highest status of the individual results.
    pub status_code: StatusCode,
    /// `stream.in.writeFailed` if any sink failed.
    pub error_name: Option<String>,
    pub message: String,
    pub results: Vec<SinkResult>,
}

impl SinksResult {
    pub fn aggregate(results: Vec<SinkResult>) -> Self {
        let total = results.len();
        let succeeded = results.iter().filter(|r| r.is_success()).count();

        let status_code = results
            .iter()
            .map(|r| r.status_code)
            .max_by_key(|s| s.as_u16())
            .unwrap_or(StatusCode::OK);

        let (error_name, message) = if total == 0 {
            (None, "No enabled sink found.".to_string())
        } else if succeeded == total {
            (None, format!("Successfully written to {succeeded}/{total} sinks."))
        } else {
            (
                Some(format!("{ERROR_NAME_PREFIX}writeFailed")),
                format!("Written to {succeeded}/{total} sinks."),
            )
        };

        Self {
            status_code,
            error_name,
            message,
            results,
        }
    }
}

type SinkPipelineCell = Arc<OnceCell<Arc<SinkPipeline>>>;

/// Builds and starts a [`Router`].
pub struct RouterBuilder {
    store: Arc<dyn KvStore>,
    transport: Arc<dyn Transport>,
    opener: Arc<dyn NetworkFileOpener>,
    encoding: Arc<dyn EncodingPipelineFactory>,
    config: RouterConfig,
}

impl RouterBuilder {
    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn encoding(mut self, encoding: Arc<dyn EncodingPipelineFactory>) -> Self {
        self.encoding = encoding;
        self
    }

    /// Register the node, connect to the disk writers and start mirroring.
    pub async fn start(self) -> Result<Arc<Router>> {
        let config = self.config;
        let node_id = config.node_id.clone();

        let repository = Repository::new(self.store.clone());
        repository.source_nodes().register(&node_id).await?;

        let connections = ConnectionManager::start(
            node_id.clone(),
            self.store.clone(),
            self.transport,
            config.dial_backoff.clone(),
        )
        .await?;

        let sinks: Mirror<Sink> = Mirror::start(self.store.clone(), SINKS.all()).await?;
        let slices: Mirror<Slice> =
            Mirror::start(self.store.clone(), SLICES.in_level(Level::Local)).await?;
        let source_nodes: Mirror<SourceNode> =
            Mirror::start(self.store.clone(), SOURCE_NODES_PREFIX).await?;

        let ctx = Arc::new(PipelineContext {
            node_id: node_id.clone(),
            connections: connections.clone(),
            opener: self.opener,
            encoding: self.encoding,
            balancer: new_balancer(config.balancer),
            config,
        });

        let (sink_closed_tx, sink_closed_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router {
            ctx,
            repository,
            connections,
            sinks,
            slices,
            source_nodes,
            pipelines: Mutex::new(HashMap::new()),
            sink_closed_tx,
            accepting: RwLock::new(true),
            cancel: CancellationToken::new(),
            task_handle: RwLock::new(None),
        });

        let task = UpdateTask {
            router: Arc::downgrade(&router),
            cancel: router.cancel.clone(),
            sink_closed_rx,
        };
        let handle = tokio::spawn(task.run(
            router.sinks.subscribe(),
            router.slices.subscribe(),
            router.source_nodes.subscribe(),
        ));
        *router.task_handle.write().await = Some(handle);

        info!(node_id = %node_id, "Started storage router");
        Ok(router)
    }
}

/// Routes records of all sinks on one source node.
pub struct Router {
    ctx: Arc<PipelineContext>,
    repository: Repository,
    connections: Arc<ConnectionManager>,
    sinks: Mirror<Sink>,
    slices: Mirror<Slice>,
    source_nodes: Mirror<SourceNode>,
    pipelines: Mutex<HashMap<SinkKey, SinkPipelineCell>>,
    sink_closed_tx: mpsc::UnboundedSender<SinkKey>,
    /// Write guard: records hold a read lock, shutdown takes the write lock.
    accepting: RwLock<bool>,
    cancel: CancellationToken,
    task_handle: RwLock<Option<JoinHandle<()>>>,
}

impl Router {
    pub fn builder(
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        opener: Arc<dyn NetworkFileOpener>,
    ) -> RouterBuilder {
        RouterBuilder {
            store,
            transport,
            opener,
            encoding: Arc::new(JsonLinesFactory),
            config: RouterConfig::default(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.ctx.node_id
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Store revision reflected by all mirrors.
    pub async fn wait_for_revision(&self, revision: i64) -> bool {
        self.sinks.wait_for_revision(revision).await
            && self.slices.wait_for_revision(revision).await
            && self.source_nodes.wait_for_revision(revision).await
    }

    /// Open sink pipeline of the sink, if any.
    pub async fn sink_pipeline(&self, sink_key: &SinkKey) -> Option<Arc<SinkPipeline>> {
        let cell = self.pipelines.lock().await.get(sink_key).cloned()?;
        cell.get().filter(|p| !p.is_closed()).cloned()
    }

    /// Write one record to one sink.
    pub async fn dispatch(&self, sink_key: &SinkKey, record: &dyn RecordContext) -> SinkResult {
        let result = self.write(sink_key, record).await;
        SinkResult::from_write(sink_key.clone(), result)
    }

    /// Write one record to several sinks concurrently.
    pub async fn dispatch_to_sinks(
        &self,
        sink_keys: &[SinkKey],
        record: &dyn RecordContext,
    ) -> SinksResult {
        let results =
            futures::future::join_all(sink_keys.iter().map(|key| self.dispatch(key, record))).await;
        SinksResult::aggregate(results)
    }

    /// Write one record to every enabled sink under a key prefix, for
    /// example all sinks of a source.
    pub async fn dispatch_to_source(
        &self,
        source_prefix: &impl KeyPrefix,
        record: &dyn RecordContext,
    ) -> SinksResult {
        let prefix = source_prefix.key_prefix();
        let sink_keys: Vec<SinkKey> = self
            .sinks
            .snapshot()
            .await
            .into_iter()
            .filter(|sink| sink.is_active() && sink.key.to_string().starts_with(&prefix))
            .map(|sink| sink.key)
            .collect();
        self.dispatch_to_sinks(&sink_keys, record).await
    }

    async fn write(&self, sink_key: &SinkKey, record: &dyn RecordContext) -> Result<RecordStatus> {
        let accepting = self.accepting.read().await;
        if !*accepting {
            return Err(RouterError::ShutDown);
        }

        let sink = self
            .sinks
            .get(&sink_key.to_string())
            .await
            .filter(|sink| !sink.deleted)
            .ok_or_else(|| RouterError::SinkNotFound(sink_key.to_string()))?;
        if !sink.enabled {
            return Err(RouterError::SinkDisabled(sink_key.to_string()));
        }

        let pipeline = self.open_sink_pipeline(sink_key).await?;
        pipeline.write_record(record).await
    }

    async fn open_sink_pipeline(&self, sink_key: &SinkKey) -> Result<Arc<SinkPipeline>> {
        let cell = {
            let mut pipelines = self.pipelines.lock().await;
            let closed = pipelines
                .get(sink_key)
                .and_then(|cell| cell.get())
                .is_some_and(|p| p.is_closed());
            if closed {
                pipelines.remove(sink_key);
            }
            pipelines.entry(sink_key.clone()).or_default().clone()
        };

        let pipeline = cell
            .get_or_try_init(|| async {
                let slices = self.assigned_slices(sink_key).await;
                if slices.is_empty() {
                    return Err(RouterError::NoOpenSlices(sink_key.to_string()));
                }
                let pipeline = SinkPipeline::open(
                    sink_key.clone(),
                    self.ctx.clone(),
                    self.sink_closed_tx.clone(),
                );
                pipeline.update_slice_pipelines(slices).await;
                Ok(pipeline)
            })
            .await?;
        Ok(pipeline.clone())
    }

    /// Writing slices of the sink assigned to this node.
    async fn assigned_slices(&self, sink_key: &SinkKey) -> Vec<Slice> {
        let all: Vec<Slice> = self
            .slices
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.state == SliceState::Writing && s.key.sink_key() == sink_key)
            .collect();

        let mut nodes: Vec<NodeId> = self
            .source_nodes
            .snapshot()
            .await
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        if !nodes.contains(&self.ctx.node_id) {
            nodes.push(self.ctx.node_id.clone());
        }
        nodes.sort();

        assign_slices(
            &all,
            &nodes,
            &self.ctx.node_id,
            self.ctx.config.min_slices_per_node,
        )
    }

    async fn open_pipelines(&self) -> Vec<Arc<SinkPipeline>> {
        self.pipelines
            .lock()
            .await
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Re-assign slices of every open sink pipeline.
    async fn update_pipelines(&self) {
        for pipeline in self.open_pipelines().await {
            if pipeline.is_closed() {
                continue;
            }
            let sink_key = pipeline.sink_key().clone();
            match self.sinks.get(&sink_key.to_string()).await {
                Some(sink) if sink.is_active() => {
                    let slices = self.assigned_slices(&sink_key).await;
                    pipeline.update_slice_pipelines(slices).await;
                }
                Some(_) => pipeline.close("sink is disabled").await,
                None => pipeline.close("sink is deleted").await,
            }
        }
    }

    async fn remove_closed(&self, sink_key: &SinkKey) {
        let mut pipelines = self.pipelines.lock().await;
        let closed = pipelines
            .get(sink_key)
            .and_then(|cell| cell.get())
            .is_some_and(|p| p.is_closed());
        if closed {
            pipelines.remove(sink_key);
            debug!(sink_key = %sink_key, "Removed closed sink pipeline");
        }
    }

    /// Stop accepting records and release every resource.
    pub async fn shutdown(&self) {
        *self.accepting.write().await = false;

        self.cancel.cancel();
        if let Some(handle) = self.task_handle.write().await.take() {
            let _ = handle.await;
        }

        self.sinks.stop().await;
        self.slices.stop().await;
        self.source_nodes.stop().await;

        let pipelines = self.open_pipelines().await;
        futures::future::join_all(pipelines.iter().map(|p| p.close("router shutdown"))).await;
        self.pipelines.lock().await.clear();

        self.connections.shutdown().await;

        if let Err(e) = self.repository.source_nodes().unregister(&self.ctx.node_id).await {
            warn!(node_id = %self.ctx.node_id, error = %e, "Cannot unregister source node");
        }
        info!(node_id = %self.ctx.node_id, "Stopped storage router");
    }
}

struct UpdateTask {
    router: Weak<Router>,
    cancel: CancellationToken,
    sink_closed_rx: mpsc::UnboundedReceiver<SinkKey>,
}

impl UpdateTask {
    async fn run(
        self,
        mut sinks: watch::Receiver<i64>,
        mut slices: watch::Receiver<i64>,
        mut nodes: watch::Receiver<i64>,
    ) {
        let UpdateTask {
            router,
            cancel,
            mut sink_closed_rx,
        } = self;

        loop {
            let changed = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(sink_key) = sink_closed_rx.recv() => {
                    let Some(router) = router.upgrade() else { break };
                    router.remove_closed(&sink_key).await;
                    continue;
                }
                Ok(()) = sinks.changed() => "sinks",
                Ok(()) = slices.changed() => "slices",
                Ok(()) = nodes.changed() => "source nodes",
                else => break,
            };

            let Some(router) = router.upgrade() else { break };
            debug!(changed, "Mirrored metadata changed, updating sink pipelines");
            router.update_pipelines().await;
        }
    }
}
