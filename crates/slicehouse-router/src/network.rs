//! Remote File Handles
//!
//! A slice pipeline writes through a [`NetworkOutput`]: a handle to the slice
//! file opened on the disk-writer node that owns the slice volume. The wire
//! protocol behind it is provided by the transport implementation.
//!
//! A disconnected transport only makes the handle not ready, it becomes ready
//! again when the connection redials. A terminated handle is final.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use slicehouse_core::{NodeId, Slice};

use crate::connection::Connection;
use crate::error::Result;

/// Write handle of one slice file on a disk-writer node.
#[async_trait]
pub trait NetworkOutput: Send + Sync {
    /// False while the connection carrying the handle is down.
    fn is_ready(&self) -> bool;

    /// Write a chunk. `aligned` marks the end of a complete record, the
    /// disk writer may only cut the file at aligned positions.
    async fn write(&self, aligned: bool, chunk: Bytes) -> Result<usize>;

    /// Sync the written data according to the slice sync mode.
    async fn sync(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Resolves when the disk writer ends the file on its side, for example
    /// when the node shuts down. The handle accepts no writes afterwards and
    /// the slice pipeline using it closes.
    async fn terminated(&self);
}

/// Opens slice files over an established connection.
#[async_trait]
pub trait NetworkFileOpener: Send + Sync {
    async fn open(
        &self,
        source_node_id: &NodeId,
        connection: &Arc<Connection>,
        slice: &Slice,
    ) -> Result<Arc<dyn NetworkOutput>>;
}
