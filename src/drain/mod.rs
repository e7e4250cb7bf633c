//! Node draining.
//!
//! The controllers only need "cordon this node" and "drain this node" with a
//! classified outcome: an eviction still in flight holds the state machine,
//! a drain that exceeded its deadline is accepted and the rollout proceeds,
//! and anything else aborts the tick.

pub mod kube;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Per-node drain deadline. After this much time the rollout proceeds with
/// whatever pods are still on the node.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Classified drain failures.
#[derive(Error, Debug)]
pub enum DrainError {
    /// Evictions are in flight or blocked by a disruption budget; retry on a
    /// later tick.
    #[error("eviction in progress on node {node}")]
    EvictionInProgress { node: String },

    /// The per-node drain deadline elapsed. The caller proceeds anyway.
    #[error("drain of node {node} timed out")]
    DrainTimeout { node: String },

    /// Anything else; fatal for the tick.
    #[error("drain failed on node {node}: {message}")]
    Other { node: String, message: String },
}

impl DrainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DrainError::EvictionInProgress { .. })
    }
}

/// Cordon and drain nodes of a workload cluster.
#[async_trait]
pub trait Drainer: Send + Sync {
    /// Mark a node unschedulable. Idempotent.
    async fn cordon(&self, cluster_id: &str, node: &str) -> Result<(), DrainError>;

    /// Evict all evictable pods from a node, tracking the drain deadline
    /// durably so it survives operator restarts.
    async fn drain(&self, cluster_id: &str, node: &str, timeout: Duration)
    -> Result<(), DrainError>;
}
