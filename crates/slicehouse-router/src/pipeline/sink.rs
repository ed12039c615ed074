use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use futures::future::{join_all, select_ok};
use futures::FutureExt;
use slicehouse_core::{RecordContext, SinkKey, Slice, SliceKey};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{PipelineContext, SlicePipeline};
use crate::balancer::BalancedPipeline;
use crate::encoding::RecordStatus;
use crate::error::{Result, RouterError};

type Snapshot = Arc<Vec<Arc<dyn BalancedPipeline>>>;

/// Write path of one sink.
///
/// Holds the slice pipelines of the slices assigned to this node. Writes
/// read an immutable snapshot of the pipelines and hand it to the balancer,
/// so they never wait for a slice set update.
pub struct SinkPipeline {
    sink_key: SinkKey,
    ctx: Arc<PipelineContext>,
    slices: Mutex<BTreeMap<SliceKey, Arc<SlicePipeline>>>,
    snapshot: RwLock<Snapshot>,
    slice_closed_tx: mpsc::UnboundedSender<SliceKey>,
    closed: CancellationToken,
    on_close: mpsc::UnboundedSender<SinkKey>,
}

impl SinkPipeline {
    /// Create an empty pipeline, populate it with [`update_slice_pipelines`].
    ///
    /// [`update_slice_pipelines`]: SinkPipeline::update_slice_pipelines
    pub fn open(
        sink_key: SinkKey,
        ctx: Arc<PipelineContext>,
        on_close: mpsc::UnboundedSender<SinkKey>,
    ) -> Arc<Self> {
        let (slice_closed_tx, slice_closed_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(Self {
            sink_key,
            ctx,
            slices: Mutex::new(BTreeMap::new()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            slice_closed_tx,
            closed: CancellationToken::new(),
            on_close,
        });

        tokio::spawn(drain_closed_slices(
            Arc::downgrade(&pipeline),
            pipeline.closed.clone(),
            slice_closed_rx,
        ));

        info!(sink_key = %pipeline.sink_key, "opened sink pipeline");
        pipeline
    }

    pub fn sink_key(&self) -> &SinkKey {
        &self.sink_key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Keys of the current slice pipelines, sorted.
    pub async fn slice_keys(&self) -> Vec<SliceKey> {
        self.slices.lock().await.keys().cloned().collect()
    }

    pub async fn slice_pipeline(&self, key: &SliceKey) -> Option<Arc<SlicePipeline>> {
        self.slices.lock().await.get(key).cloned()
    }

    pub async fn ready_count(&self) -> usize {
        self.slices
            .lock()
            .await
            .values()
            .filter(|p| p.is_ready())
            .count()
    }

    /// Reconcile the slice pipelines with the assigned slices.
    ///
    /// Existing pipelines are kept, new slices get a pipeline and pipelines
    /// of slices no longer assigned are closed. When the pipeline had no
    /// slices before, waits up to the ready timeout for the first new slice
    /// pipeline to open. An empty slice set closes the sink pipeline.
    pub async fn update_slice_pipelines(&self, slices: Vec<Slice>) {
        let (removed, opened, was_empty, now_empty) = {
            let mut current = self.slices.lock().await;
            // close() cancels before it takes the lock
            if self.is_closed() {
                return;
            }
            let was_empty = current.is_empty();

            let desired: BTreeMap<SliceKey, Slice> =
                slices.into_iter().map(|s| (s.key.clone(), s)).collect();

            let removed_keys: Vec<SliceKey> = current
                .keys()
                .filter(|key| !desired.contains_key(*key))
                .cloned()
                .collect();
            let removed: Vec<Arc<SlicePipeline>> = removed_keys
                .iter()
                .filter_map(|key| current.remove(key))
                .collect();

            let mut opened = Vec::new();
            for (key, slice) in desired {
                if current.contains_key(&key) {
                    continue;
                }
                let pipeline =
                    SlicePipeline::open(slice, self.ctx.clone(), self.slice_closed_tx.clone());
                opened.push(pipeline.clone());
                current.insert(key, pipeline);
            }

            self.refresh_snapshot(&current).await;
            (removed, opened, was_empty, current.is_empty())
        };

        if !removed.is_empty() || !opened.is_empty() {
            debug!(
                sink_key = %self.sink_key,
                opened = opened.len(),
                closed = removed.len(),
                "Updated slice pipelines"
            );
        }

        join_all(removed.iter().map(|p| p.close("slice is no longer assigned"))).await;

        if now_empty {
            self.close("no slice is assigned").await;
            return;
        }

        if was_empty && !opened.is_empty() {
            self.wait_first_ready(&opened).await;
        }
    }

    async fn wait_first_ready(&self, opened: &[Arc<SlicePipeline>]) {
        let waits = opened.iter().map(|p| {
            async move {
                if p.wait_ready().await {
                    Ok(())
                } else {
                    Err(())
                }
            }
            .boxed()
        });

        let timeout = self.ctx.config.pipeline_ready_timeout;
        if tokio::time::timeout(timeout, select_ok(waits)).await.is_err() {
            debug!(
                sink_key = %self.sink_key,
                timeout_ms = timeout.as_millis() as u64,
                "No slice pipeline is ready yet"
            );
        }
    }

    pub async fn write_record(&self, record: &dyn RecordContext) -> Result<RecordStatus> {
        if self.is_closed() {
            return Err(RouterError::NoPipeline);
        }
        let pipelines = self.snapshot.read().await.clone();
        self.ctx.balancer.write_record(record, &pipelines).await
    }

    /// Close all slice pipelines and notify the router. Only the first call
    /// has an effect.
    pub async fn close(&self, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let slices = {
            let mut current = self.slices.lock().await;
            let slices: Vec<Arc<SlicePipeline>> =
                std::mem::take(&mut *current).into_values().collect();
            self.refresh_snapshot(&current).await;
            slices
        };
        join_all(slices.iter().map(|p| p.close("sink pipeline closed"))).await;

        info!(sink_key = %self.sink_key, reason, "closed sink pipeline");
        let _ = self.on_close.send(self.sink_key.clone());
    }

    async fn refresh_snapshot(&self, current: &BTreeMap<SliceKey, Arc<SlicePipeline>>) {
        let snapshot: Vec<Arc<dyn BalancedPipeline>> = current
            .values()
            .map(|p| p.clone() as Arc<dyn BalancedPipeline>)
            .collect();
        *self.snapshot.write().await = Arc::new(snapshot);
    }

    async fn on_slice_closed(&self, key: &SliceKey) {
        let now_empty = {
            let mut current = self.slices.lock().await;
            let left = current.get(key).is_some_and(|p| p.is_closed());
            if left {
                current.remove(key);
                self.refresh_snapshot(&current).await;
                debug!(sink_key = %self.sink_key, slice_key = %key, "Slice pipeline left");
            }
            left && current.is_empty()
        };

        if now_empty {
            self.close("all slice pipelines closed").await;
        }
    }
}

/// Removes slice pipelines that closed on their own.
async fn drain_closed_slices(
    pipeline: Weak<SinkPipeline>,
    closed: CancellationToken,
    mut slice_closed_rx: mpsc::UnboundedReceiver<SliceKey>,
) {
    loop {
        let key = tokio::select! {
            _ = closed.cancelled() => break,
            key = slice_closed_rx.recv() => match key {
                Some(key) => key,
                None => break,
            },
        };
        let Some(pipeline) = pipeline.upgrade() else { break };
        pipeline.on_slice_closed(&key).await;
    }
}
