//! Slicehouse Storage Router
//!
//! Write path of a source node: routes every received record to one of the
//! slices currently open for its sink and writes it over a connection to the
//! disk-writer node that owns the slice volume.
//!
//! ## Architecture
//!
//! ```text
//! record ─► Router ─► SinkPipeline ─► Balancer ─► SlicePipeline ─► Connection ─► disk writer
//!             │                                        ▲
//!             │ mirrors (sinks, writing slices,        │ ConnectionManager
//!             │          source nodes)                 │ (one connection per node)
//!             ▼                                        │
//!        metadata store ───────────── writer volumes ──┘
//! ```
//!
//! ## Components
//!
//! - [`Router`]: sink pipeline table, status-coded write results
//! - [`SinkPipeline`] / [`SlicePipeline`]: live write path of a sink / a slice
//! - [`Balancer`]: picks a ready slice pipeline for each record
//! - [`ConnectionManager`]: auto-reconnecting connections to disk writers
//! - [`assign_slices`]: spreads the slices of a sink over the source nodes
//!
//! ## Example Usage
//!
//! ```ignore
//! use slicehouse_router::{Router, RouterConfig};
//!
//! let router = Router::builder(store, transport, opener)
//!     .config(RouterConfig::from_env()?)
//!     .start()
//!     .await?;
//!
//! let result = router.dispatch(&sink_key, &record).await;
//! println!("{} {}", result.status_code, result.message);
//!
//! router.shutdown().await;
//! ```

pub mod assignment;
pub mod balancer;
pub mod config;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod router;

pub use assignment::assign_slices;
pub use balancer::{new_balancer, BalancedPipeline, Balancer, RandomBalancer, RoundRobinBalancer};
pub use config::{BalancerKind, RouterConfig};
pub use connection::{Connection, ConnectionManager, Transport, TransportSession};
pub use encoding::{
    EncodingPipeline, EncodingPipelineFactory, JsonLinesFactory, JsonLinesPipeline, RecordStatus,
};
pub use error::{Result, RouterError, ERROR_NAME_PREFIX};
pub use network::{NetworkFileOpener, NetworkOutput};
pub use pipeline::{PipelineContext, SinkPipeline, SlicePipeline};
pub use router::{Router, RouterBuilder, SinkResult, SinksResult};
