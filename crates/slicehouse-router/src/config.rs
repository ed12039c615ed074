//! Router Configuration
//!
//! Defaults suit a production source node. Every field can be overridden
//! from the environment with [`RouterConfig::from_env`]:
//!
//! - `SLICEHOUSE_NODE_ID`: ID of this source node (default: `source-node`)
//! - `SLICEHOUSE_BALANCER`: `roundRobin` or `random` (default: `roundRobin`)
//! - `SLICEHOUSE_MIN_SLICES_PER_NODE`: redundancy floor (default: 0)
//! - `SLICEHOUSE_PIPELINE_READY_TIMEOUT_MS`: wait for the first ready slice (default: 3000)
//! - `SLICEHOUSE_PIPELINE_CLOSE_TIMEOUT_SECS`: slice pipeline close bound (default: 300)

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slicehouse_core::{ExponentialBackoff, NodeId};

use crate::error::{Result, RouterError};

/// Strategy choosing a slice pipeline for each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BalancerKind {
    Random,
    #[default]
    RoundRobin,
}

impl FromStr for BalancerKind {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(BalancerKind::Random),
            "roundRobin" | "round-robin" => Ok(BalancerKind::RoundRobin),
            other => Err(RouterError::InvalidConfig(format!(
                "unknown balancer \"{other}\", expected \"random\" or \"roundRobin\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub node_id: NodeId,
    pub balancer: BalancerKind,
    /// Minimum number of slices written by each source node.
    pub min_slices_per_node: usize,
    /// How long the first write of a new sink pipeline waits for a ready slice.
    pub pipeline_ready_timeout: Duration,
    /// Upper bound of closing one slice pipeline.
    pub pipeline_close_timeout: Duration,
    /// Retry schedule of the slice pipeline open-loop.
    pub slice_open_backoff: ExponentialBackoff,
    /// Retry schedule of the disk-writer dial loop.
    pub dial_backoff: ExponentialBackoff,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("source-node"),
            balancer: BalancerKind::default(),
            min_slices_per_node: 0,
            pipeline_ready_timeout: Duration::from_secs(3),
            pipeline_close_timeout: Duration::from_secs(5 * 60),
            slice_open_backoff: ExponentialBackoff::new(
                Duration::from_millis(100),
                4.0,
                Duration::from_secs(60),
            ),
            dial_backoff: ExponentialBackoff::new(
                Duration::from_millis(100),
                2.0,
                Duration::from_secs(5),
            ),
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(node_id) = std::env::var("SLICEHOUSE_NODE_ID") {
            config.node_id = NodeId::new(node_id);
        }
        if let Ok(balancer) = std::env::var("SLICEHOUSE_BALANCER") {
            config.balancer = balancer.parse()?;
        }
        if let Some(min) = env_number("SLICEHOUSE_MIN_SLICES_PER_NODE")? {
            config.min_slices_per_node = min as usize;
        }
        if let Some(ms) = env_number("SLICEHOUSE_PIPELINE_READY_TIMEOUT_MS")? {
            config.pipeline_ready_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_number("SLICEHOUSE_PIPELINE_CLOSE_TIMEOUT_SECS")? {
            config.pipeline_close_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn with_node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = node_id.into();
        self
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| RouterError::InvalidConfig(format!("{name}=\"{value}\": {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.balancer, BalancerKind::RoundRobin);
        assert_eq!(config.min_slices_per_node, 0);
        assert_eq!(config.pipeline_ready_timeout, Duration::from_secs(3));
        assert_eq!(config.slice_open_backoff.delay(2), Duration::from_millis(400));
        assert_eq!(config.slice_open_backoff.delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_balancer_kind_parse() {
        assert_eq!("random".parse::<BalancerKind>().unwrap(), BalancerKind::Random);
        assert_eq!("roundRobin".parse::<BalancerKind>().unwrap(), BalancerKind::RoundRobin);
        assert!("fastest".parse::<BalancerKind>().is_err());
    }
}
