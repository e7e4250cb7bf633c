//! Workload (tenant) cluster access.
//!
//! The controllers need a narrow view of each workload cluster: list nodes
//! matching a role selector, with readiness and the version labels the
//! upgrade decision is based on. Client acquisition and caching live behind
//! the factory; an unreachable API server surfaces as `ApiNotAvailable` and
//! is always treated as retry-later by the controllers.

pub mod kube;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::ReleaseSpec;

/// Label selector matching control plane nodes.
pub const MASTER_SELECTOR: &str = "node-role.kubernetes.io/control-plane";

/// Prefix of node labels carrying the running version of one component.
/// Full key: `component.vmss-operator.io/<name>`.
pub const COMPONENT_LABEL_PREFIX: &str = "component.vmss-operator.io/";

/// A node of a workload cluster, reduced to what the upgrade logic needs.
#[derive(Clone, Debug, Default)]
pub struct WorkloadNode {
    pub name: String,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
}

impl WorkloadNode {
    /// Version label of one component, if present.
    pub fn component_version(&self, component: &str) -> Option<&str> {
        self.labels
            .get(&format!("{COMPONENT_LABEL_PREFIX}{component}"))
            .map(String::as_str)
    }
}

/// Whether a node must be rolled to reach the desired release.
///
/// Every component pinned by the release is compared against the node's
/// version label; a missing label counts as a mismatch. Versions are
/// compared via semver where parseable, falling back to string inequality.
pub fn node_requires_upgrade(node: &WorkloadNode, release: &ReleaseSpec) -> bool {
    release.components.iter().any(|(component, desired)| {
        match node.component_version(component) {
            None => true,
            Some(running) => versions_differ(running, desired),
        }
    })
}

fn versions_differ(running: &str, desired: &str) -> bool {
    match (
        semver::Version::parse(running),
        semver::Version::parse(desired),
    ) {
        (Ok(a), Ok(b)) => a != b,
        _ => running != desired,
    }
}

/// Errors from workload cluster access.
#[derive(Error, Debug)]
pub enum WorkloadError {
    /// The workload cluster's API server is not (yet) reachable.
    #[error("workload cluster API not available: {0}")]
    ApiNotAvailable(String),

    /// Any other error talking to the workload cluster.
    #[error("workload cluster error: {0}")]
    Other(String),
}

impl WorkloadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkloadError::ApiNotAvailable(_))
    }
}

/// Narrow read interface over one workload cluster.
#[async_trait]
pub trait WorkloadCluster: Send + Sync {
    /// List nodes matching a label selector.
    async fn nodes(&self, label_selector: &str) -> Result<Vec<WorkloadNode>, WorkloadError>;
}

/// Produces (possibly cached) workload cluster clients by cluster id.
#[async_trait]
pub trait WorkloadClusterFactory: Send + Sync {
    async fn workload_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Arc<dyn WorkloadCluster>, WorkloadError>;
}
