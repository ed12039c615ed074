use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use slicehouse_core::{RecordContext, Slice, SliceKey};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PipelineContext;
use crate::balancer::BalancedPipeline;
use crate::encoding::{EncodingPipeline, RecordStatus};
use crate::error::{Result, RouterError};
use crate::network::NetworkOutput;

type PipelineSlot = Option<Arc<dyn EncodingPipeline>>;

/// Write path of one slice.
///
/// A background open-loop connects the slice to its volume: it looks up the
/// connection, opens the remote file and wraps it in an encoding pipeline,
/// retrying with backoff until it succeeds or the pipeline is closed.
/// Writes are rejected with `PipelineNotReady` until then, and again while
/// the connection is down. When the disk writer terminates the remote file,
/// the pipeline closes itself.
pub struct SlicePipeline {
    slice: Slice,
    ctx: Arc<PipelineContext>,
    pipeline: watch::Receiver<PipelineSlot>,
    cancel: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    on_close: mpsc::UnboundedSender<SliceKey>,
}

impl SlicePipeline {
    pub fn open(
        slice: Slice,
        ctx: Arc<PipelineContext>,
        on_close: mpsc::UnboundedSender<SliceKey>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|owner| {
            let (pipeline_tx, pipeline) = watch::channel(None);
            let cancel = CancellationToken::new();

            let task = OpenTask {
                slice: slice.clone(),
                ctx: ctx.clone(),
                owner: owner.clone(),
                pipeline_tx,
                cancel: cancel.clone(),
            };
            let handle = tokio::spawn(task.run());

            Self {
                slice,
                ctx,
                pipeline,
                cancel,
                task_handle: Mutex::new(Some(handle)),
                closed: AtomicBool::new(false),
                on_close,
            }
        })
    }

    pub fn slice(&self) -> &Slice {
        &self.slice
    }

    pub fn slice_key(&self) -> &SliceKey {
        &self.slice.key
    }

    pub fn is_ready(&self) -> bool {
        !self.is_closed()
            && self
                .pipeline
                .borrow()
                .as_ref()
                .is_some_and(|pipeline| pipeline.is_ready())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the open-loop succeeds. Returns `false` if the pipeline
    /// was closed before.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.pipeline.clone();
        let opened = rx.wait_for(|pipeline| pipeline.is_some()).await.is_ok();
        opened
    }

    pub async fn write_record(&self, record: &dyn RecordContext) -> Result<RecordStatus> {
        if self.is_closed() {
            return Err(RouterError::PipelineNotReady);
        }
        let pipeline = self.pipeline.borrow().clone();
        match pipeline {
            Some(pipeline) if pipeline.is_ready() => pipeline.write_record(record).await,
            _ => Err(RouterError::PipelineNotReady),
        }
    }

    /// Stop the open-loop, close the encoding pipeline and notify the sink
    /// pipeline. Only the first call has an effect.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        if let Some(handle) = self.task_handle.lock().await.take() {
            let _ = handle.await;
        }

        let pipeline = self.pipeline.borrow().clone();
        if let Some(pipeline) = pipeline {
            let timeout = self.ctx.config.pipeline_close_timeout;
            match tokio::time::timeout(timeout, pipeline.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(slice_key = %self.slice.key, error = %e, "Cannot close slice pipeline");
                }
                Err(_) => {
                    warn!(
                        slice_key = %self.slice.key,
                        timeout_secs = timeout.as_secs(),
                        "Timed out closing slice pipeline"
                    );
                }
            }
        }

        info!(slice_key = %self.slice.key, reason, "closed slice pipeline");
        let _ = self.on_close.send(self.slice.key.clone());
    }
}

#[async_trait]
impl BalancedPipeline for SlicePipeline {
    async fn write_record(&self, record: &dyn RecordContext) -> Result<RecordStatus> {
        SlicePipeline::write_record(self, record).await
    }
}

struct OpenTask {
    slice: Slice,
    ctx: Arc<PipelineContext>,
    owner: Weak<SlicePipeline>,
    pipeline_tx: watch::Sender<PipelineSlot>,
    cancel: CancellationToken,
}

impl OpenTask {
    async fn run(self) {
        let Some(output) = self.open_loop().await else {
            return;
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = output.terminated() => {
                debug!(slice_key = %self.slice.key, "Disk writer terminated the slice file");
                // Close from outside, close() waits for this task.
                if let Some(owner) = self.owner.upgrade() {
                    tokio::spawn(async move {
                        owner.close("remote server shutdown").await;
                    });
                }
            }
        }
    }

    /// Retry until the pipeline is open, `None` if cancelled first.
    async fn open_loop(&self) -> Option<Arc<dyn NetworkOutput>> {
        let backoff = &self.ctx.config.slice_open_backoff;
        let mut attempt = 0;
        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                opened = self.try_open() => opened,
            };

            match opened {
                Ok((output, pipeline)) => {
                    self.pipeline_tx.send_replace(Some(pipeline));
                    info!(
                        slice_key = %self.slice.key,
                        volume_id = %self.slice.key.volume_id(),
                        attempts = attempt + 1,
                        "opened slice pipeline"
                    );
                    return Some(output);
                }
                Err(e) => {
                    attempt += 1;
                    let delay = backoff.delay(attempt);
                    debug!(
                        slice_key = %self.slice.key,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Cannot open slice pipeline"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn try_open(&self) -> Result<(Arc<dyn NetworkOutput>, Arc<dyn EncodingPipeline>)> {
        let volume_id = self.slice.key.volume_id();
        let connection = self
            .ctx
            .connections
            .connection_to_volume(volume_id)
            .await
            .ok_or_else(|| RouterError::Network(format!("no connection to volume \"{volume_id}\"")))?;
        if !connection.is_connected() {
            return Err(RouterError::Network(format!(
                "disk writer \"{}\" is not connected",
                connection.remote_node_id()
            )));
        }

        let output = self
            .ctx
            .opener
            .open(&self.ctx.node_id, &connection, &self.slice)
            .await?;
        let pipeline = self.ctx.encoding.create(&self.slice, output.clone())?;
        Ok((output, pipeline))
    }
}
