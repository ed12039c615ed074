//! Write Pipelines
//!
//! ```text
//! Router
//!  └─ SinkPipeline (one per sink with writing slices assigned to this node)
//!      ├─ Balancer
//!      └─ SlicePipeline (one per assigned slice)
//!          └─ EncodingPipeline -> NetworkOutput -> Connection -> disk writer
//! ```
//!
//! Pipelines close top-down. A closed slice pipeline notifies its sink
//! pipeline, a sink pipeline left without slices closes itself and notifies
//! the router, which opens a new one on the next write.

mod sink;
mod slice;

pub use sink::SinkPipeline;
pub use slice::SlicePipeline;

use std::sync::Arc;

use slicehouse_core::NodeId;

use crate::balancer::Balancer;
use crate::config::RouterConfig;
use crate::connection::ConnectionManager;
use crate::encoding::EncodingPipelineFactory;
use crate::network::NetworkFileOpener;

/// Collaborators shared by all pipelines of one router.
pub struct PipelineContext {
    pub node_id: NodeId,
    pub connections: Arc<ConnectionManager>,
    pub opener: Arc<dyn NetworkFileOpener>,
    pub encoding: Arc<dyn EncodingPipelineFactory>,
    pub balancer: Arc<dyn Balancer>,
    pub config: RouterConfig,
}
