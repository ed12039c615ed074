//! Record Producer Interface
//!
//! The HTTP layer hands every received request to the router as a
//! [`RecordContext`]. The write path treats it as an opaque value: it reads
//! the timestamp, client address, headers and body and writes them verbatim.
//!
//! ## Structure
//! - **timestamp**: when the request was received
//! - **client_ip**: address of the client, if known
//! - **headers**: request headers, lowercase names
//! - **body**: raw request body, optionally parsed as a JSON object
//!
//! ## Example
//! ```ignore
//! let record = Record::new(UtcTime::now(), Bytes::from(r#"{"action": "click"}"#))
//!     .with_client_ip("10.0.0.1".parse()?)
//!     .with_header("Content-Type", "application/json");
//! router.dispatch(&sink_key, &record).await;
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::time::UtcTime;

/// Read-only view of one received record.
pub trait RecordContext: Send + Sync {
    fn timestamp(&self) -> UtcTime;

    fn client_ip(&self) -> Option<IpAddr>;

    /// Header map with lowercase names.
    fn headers(&self) -> &BTreeMap<String, String>;

    fn body_bytes(&self) -> Bytes;

    /// Headers rendered one per line, `Name: value`, sorted by name.
    fn headers_string(&self) -> String {
        self.headers()
            .iter()
            .map(|(k, v)| format!("{k}: {v}\n"))
            .collect()
    }

    /// Body parsed as a JSON object, `None` if it is not one.
    fn body_map(&self) -> Option<Map<String, Value>> {
        match serde_json::from_slice::<Value>(&self.body_bytes()) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

/// In-memory record, the default [`RecordContext`] implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    timestamp: UtcTime,
    client_ip: Option<IpAddr>,
    headers: BTreeMap<String, String>,
    body: Bytes,
}

impl Record {
    pub fn new(timestamp: UtcTime, body: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            client_ip: None,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

impl RecordContext for Record {
    fn timestamp(&self) -> UtcTime {
        self.timestamp
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    fn body_bytes(&self) -> Bytes {
        self.body.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_string_sorted() {
        let record = Record::new(UtcTime::now(), "{}")
            .with_header("X-Foo", "bar")
            .with_header("Content-Type", "application/json");
        assert_eq!(
            record.headers_string(),
            "content-type: application/json\nx-foo: bar\n"
        );
    }

    #[test]
    fn test_body_map() {
        let record = Record::new(UtcTime::now(), r#"{"a": 1}"#);
        assert_eq!(record.body_map().unwrap()["a"], 1);

        let record = Record::new(UtcTime::now(), "not json");
        assert!(record.body_map().is_none());
    }
}
