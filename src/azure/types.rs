//! Data model for the slice of the Azure management API the controllers
//! consume. These are plain records re-fetched every reconciliation tick;
//! nothing here is cached across ticks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Provisioning state of an ARM deployment or compute resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    Accepted,
    Creating,
    Updating,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Deleting,
    /// Any state this model does not enumerate.
    Other(String),
}

impl ProvisioningState {
    /// Parse from the string ARM returns.
    pub fn parse(s: &str) -> Self {
        match s {
            "Accepted" => Self::Accepted,
            "Creating" => Self::Creating,
            "Updating" => Self::Updating,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Canceled" => Self::Canceled,
            "Deleting" => Self::Deleting,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Accepted => "Accepted",
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Deleting => "Deleting",
            Self::Other(s) => s,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Terminal failure: the deployment will never make progress again.
    pub fn has_failed(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for ProvisioningState {
    fn default() -> Self {
        Self::Accepted
    }
}

/// A live ARM deployment as returned by the management API.
#[derive(Clone, Debug, Default)]
pub struct Deployment {
    pub name: String,
    pub provisioning_state: ProvisioningState,
    /// Parameter name to value, as currently applied.
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// A VM scale set.
#[derive(Clone, Debug, Default)]
pub struct ScaleSet {
    pub name: String,
    pub capacity: i64,
    pub provisioning_state: ProvisioningState,
    pub tags: BTreeMap<String, String>,
    /// Whether NICs use accelerated networking; reused by the node pool
    /// deployment builder when the pool spec leaves it unset.
    pub accelerated_networking: Option<bool>,
}

/// Tag on a scale set toggling cluster-autoscaler management. Disabled for
/// the duration of a rolling upgrade so the autoscaler does not fight the
/// manual scale operation.
pub const AUTOSCALER_ENABLED_TAG: &str = "cluster-autoscaler-enabled";

impl ScaleSet {
    pub fn autoscaler_enabled(&self) -> bool {
        self.tags
            .get(AUTOSCALER_ENABLED_TAG)
            .is_some_and(|v| v == "true")
    }
}

/// One VM instance of a scale set.
#[derive(Clone, Debug)]
pub struct ScaleSetInstance {
    /// Azure instance id ("0", "1", ...).
    pub instance_id: String,
    /// Computer name; matches the Kubernetes node name.
    pub name: String,
    /// Whether the instance already runs the scale set's latest model.
    pub latest_model_applied: bool,
    pub provisioning_state: ProvisioningState,
}

impl ScaleSetInstance {
    /// An instance still on a previous scale set model is "old": it predates
    /// the most recent deployment and must be rolled.
    pub fn is_old(&self) -> bool {
        !self.latest_model_applied
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.provisioning_state,
            ProvisioningState::Succeeded | ProvisioningState::Running
        )
    }
}

/// Outcome of a simulated spot eviction request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// Azure accepted the eviction.
    Accepted,
    /// Azure rejected the eviction with a conflict; fall back to a hard
    /// delete.
    Conflict,
}

/// Identifies the Azure scope (cluster + resource group) a client call
/// operates on. Derived from whichever custom resource drives the tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceScope {
    /// Workload cluster id; equals the AzureCluster name.
    pub cluster_id: String,
    /// Azure resource group holding the cluster's infrastructure.
    pub resource_group: String,
}

impl ResourceScope {
    pub fn new(cluster_id: impl Into<String>, resource_group: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            resource_group: resource_group.into(),
        }
    }

    /// Name of the masters scale set for this cluster.
    pub fn masters_scale_set(&self) -> String {
        format!("{}-masters", self.cluster_id)
    }

    /// Name of the masters ARM deployment.
    pub fn masters_deployment(&self) -> &'static str {
        "masters"
    }

    /// Name of a node pool's scale set.
    pub fn node_pool_scale_set(&self, pool: &str) -> String {
        format!("{}-worker-{}", self.cluster_id, pool)
    }

    /// Name of a node pool's ARM deployment.
    pub fn node_pool_deployment(&self, pool: &str) -> String {
        format!("nodepool-{}", pool)
    }
}
