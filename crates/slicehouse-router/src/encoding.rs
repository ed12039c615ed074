//! Local Encoding Pipeline
//!
//! Turns records into the bytes of the slice file and writes them to the
//! remote handle.
//!
//! ## JSON Lines
//!
//! Every record becomes one line:
//!
//! ```text
//! {"timestamp":"2006-01-02T15:04:05.000Z","clientIp":"10.0.0.1","headers":{...},"body":{...}}\n
//! ```
//!
//! `body` is the parsed JSON object when the body is one, the raw text
//! otherwise.
//!
//! ## Write Result
//!
//! | sync.wait | sync.mode    | per write        | status      |
//! |-----------|--------------|------------------|-------------|
//! | true      | cache / disk | write + sync     | `Processed` |
//! | any       | disabled     | write            | `Accepted`  |
//! | false     | cache / disk | write            | `Accepted`  |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use slicehouse_core::{EncodingConfig, RecordContext, Slice, SyncMode};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, RouterError};
use crate::network::NetworkOutput;

/// Outcome of a successful record write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// The record is durable on the disk writer.
    Processed,
    /// The record is buffered and will be persisted later.
    Accepted,
}

#[async_trait]
pub trait EncodingPipeline: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn write_record(&self, record: &dyn RecordContext) -> Result<RecordStatus>;

    /// Flush pending data and close the remote handle.
    async fn close(&self) -> Result<()>;
}

pub trait EncodingPipelineFactory: Send + Sync {
    fn create(
        &self,
        slice: &Slice,
        output: Arc<dyn NetworkOutput>,
    ) -> Result<Arc<dyn EncodingPipeline>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Line<'a> {
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_ip: Option<String>,
    headers: &'a BTreeMap<String, String>,
    body: Value,
}

/// Writes records as JSON lines.
///
/// Compression is applied by the disk writer, the pipeline always sends
/// plain lines.
pub struct JsonLinesPipeline {
    slice_key: String,
    encoding: EncodingConfig,
    output: Arc<dyn NetworkOutput>,
    write_lock: Mutex<()>,
}

impl JsonLinesPipeline {
    pub fn new(slice: &Slice, output: Arc<dyn NetworkOutput>) -> Self {
        Self {
            slice_key: slice.key.to_string(),
            encoding: slice.encoding.clone(),
            output,
            write_lock: Mutex::new(()),
        }
    }

    fn encode(record: &dyn RecordContext) -> Result<Bytes> {
        let body = match record.body_map() {
            Some(map) => Value::Object(map),
            None => Value::String(String::from_utf8_lossy(&record.body_bytes()).into_owned()),
        };
        let headers = record.headers();
        let line = Line {
            timestamp: record.timestamp().to_string(),
            client_ip: record.client_ip().map(|ip| ip.to_string()),
            headers,
            body,
        };

        let mut bytes = serde_json::to_vec(&line)
            .map_err(|e| RouterError::Write(format!("cannot encode record: {e}")))?;
        bytes.push(b'\n');
        Ok(Bytes::from(bytes))
    }
}

#[async_trait]
impl EncodingPipeline for JsonLinesPipeline {
    fn is_ready(&self) -> bool {
        self.output.is_ready()
    }

    async fn write_record(&self, record: &dyn RecordContext) -> Result<RecordStatus> {
        let line = Self::encode(record)?;
        let synchronous = self.encoding.is_synchronous();

        let _guard = self.write_lock.lock().await;
        self.output.write(true, line).await?;
        if synchronous {
            self.output.sync().await?;
            Ok(RecordStatus::Processed)
        } else {
            Ok(RecordStatus::Accepted)
        }
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.encoding.sync.mode != SyncMode::Disabled {
            self.output.sync().await?;
        }
        self.output.close().await?;
        debug!(slice_key = %self.slice_key, "Closed encoding pipeline");
        Ok(())
    }
}

/// Creates a [`JsonLinesPipeline`] per slice.
#[derive(Debug, Default, Clone)]
pub struct JsonLinesFactory;

impl EncodingPipelineFactory for JsonLinesFactory {
    fn create(
        &self,
        slice: &Slice,
        output: Arc<dyn NetworkOutput>,
    ) -> Result<Arc<dyn EncodingPipeline>> {
        Ok(Arc::new(JsonLinesPipeline::new(slice, output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slicehouse_core::{BranchKey, Record, SyncConfig, UtcTime, VolumeId};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct BufferOutput {
        writes: StdMutex<Vec<(bool, Bytes)>>,
        syncs: StdMutex<usize>,
        closed: StdMutex<bool>,
    }

    #[async_trait]
    impl NetworkOutput for BufferOutput {
        fn is_ready(&self) -> bool {
            !*self.closed.lock().unwrap()
        }

        async fn write(&self, aligned: bool, chunk: Bytes) -> Result<usize> {
            let n = chunk.len();
            self.writes.lock().unwrap().push((aligned, chunk));
            Ok(n)
        }

        async fn sync(&self) -> Result<()> {
            *self.syncs.lock().unwrap() += 1;
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }

        async fn terminated(&self) {
            std::future::pending::<()>().await
        }
    }

    fn slice(sync: SyncConfig) -> Slice {
        let key = BranchKey::new(1, 2)
            .source("src")
            .sink("sink")
            .file(UtcTime::parse("2006-01-02T15:04:05.000Z").unwrap())
            .volume(VolumeId::new("v1"))
            .slice(UtcTime::parse("2006-01-02T15:04:05.000Z").unwrap());
        let encoding = EncodingConfig {
            sync,
            ..Default::default()
        };
        Slice::new(key, encoding)
    }

    #[tokio::test]
    async fn test_synchronous_write_is_processed() {
        let output = Arc::new(BufferOutput::default());
        let pipeline = JsonLinesPipeline::new(&slice(SyncConfig::default()), output.clone());

        let record = Record::new(UtcTime::parse("2006-01-02T15:04:05.000Z").unwrap(), r#"{"a":1}"#)
            .with_client_ip("10.0.0.1".parse().unwrap())
            .with_header("Content-Type", "application/json");
        let status = pipeline.write_record(&record).await.unwrap();

        assert_eq!(status, RecordStatus::Processed);
        assert_eq!(*output.syncs.lock().unwrap(), 1);
        let writes = output.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].0);
        assert_eq!(
            std::str::from_utf8(&writes[0].1).unwrap(),
            "{\"timestamp\":\"2006-01-02T15:04:05.000Z\",\"clientIp\":\"10.0.0.1\",\"headers\":{\"content-type\":\"application/json\"},\"body\":{\"a\":1}}\n"
        );
    }

    #[tokio::test]
    async fn test_buffered_write_is_accepted() {
        let output = Arc::new(BufferOutput::default());
        let sync = SyncConfig {
            mode: SyncMode::Disk,
            wait: false,
        };
        let pipeline = JsonLinesPipeline::new(&slice(sync), output.clone());

        let record = Record::new(UtcTime::now(), "plain text");
        assert_eq!(pipeline.write_record(&record).await.unwrap(), RecordStatus::Accepted);
        assert_eq!(*output.syncs.lock().unwrap(), 0);

        let writes = output.writes.lock().unwrap();
        let line: Value = serde_json::from_slice(&writes[0].1).unwrap();
        assert_eq!(line["body"], "plain text");
        assert!(line.get("clientIp").is_none());
    }

    #[tokio::test]
    async fn test_close_syncs_and_closes_output() {
        let output = Arc::new(BufferOutput::default());
        let sync = SyncConfig {
            mode: SyncMode::Cache,
            wait: false,
        };
        let pipeline = JsonLinesFactory
            .create(&slice(sync), output.clone())
            .unwrap();

        assert!(pipeline.is_ready());
        pipeline.close().await.unwrap();
        assert_eq!(*output.syncs.lock().unwrap(), 1);
        assert!(!pipeline.is_ready());
    }
}
