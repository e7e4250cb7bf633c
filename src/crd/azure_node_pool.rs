//! AzureNodePool Custom Resource Definition.
//!
//! An AzureNodePool represents one worker node pool of a workload cluster,
//! backed by its own VM scale set and ARM deployment. The node pool upgrade
//! state machine persists its current state as an annotation on this
//! resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::azure_cluster::{Condition, ReleaseSpec};

/// Annotation on an AzureNodePool carrying the upgrade state machine's
/// persisted state. Absent means the initial state.
pub const UPGRADE_STATE_ANNOTATION: &str = "vmss-operator.io/upgrade-state";

/// Node label (on workload cluster nodes) naming the pool a node belongs to.
pub const NODE_POOL_LABEL: &str = "vmss-operator.io/node-pool";

/// AzureNodePool describes one worker pool: VM size, scaling bounds, subnet,
/// optional spot configuration and the release its nodes must run.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vmss-operator.io",
    version = "v1alpha1",
    kind = "AzureNodePool",
    plural = "azurenodepools",
    shortname = "aznp",
    status = "AzureNodePoolStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"VmSize","type":"string","jsonPath":".spec.vmSize"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".metadata.annotations.vmss-operator\\.io/upgrade-state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AzureNodePoolSpec {
    /// Name of the owning AzureCluster (same namespace).
    pub cluster_name: String,

    /// Azure VM size for worker instances.
    pub vm_size: String,

    /// Subnet the pool's instances attach to.
    pub subnet: String,

    /// OS image the pool's instances boot from.
    pub os_image: OsImageSpec,

    /// Release the pool's nodes must converge to.
    pub release: ReleaseSpec,

    /// Autoscaler bounds for the pool.
    pub scaling: ScalingSpec,

    /// Spot (pre-emptible) instance configuration. Spot nodes are disposable
    /// by design: the upgrade skips cordon/drain for them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot: Option<SpotSpec>,

    /// Whether NICs use accelerated networking. When unset, an existing
    /// scale set's setting is reused so a pool never flips the capability
    /// (which would force instance re-creation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerated_networking: Option<bool>,
}

/// OS image of a node pool.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OsImageSpec {
    /// Image version (e.g. "3815.2.5").
    pub version: String,
}

/// Min/max instance bounds handed to the cluster autoscaler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    /// Minimum number of instances.
    pub min: i64,

    /// Maximum number of instances.
    pub max: i64,
}

/// Spot instance configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpotSpec {
    /// Maximum price per hour, "-1" for pay-as-you-go ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<String>,

    /// Eviction policy ("Delete" or "Deallocate").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_policy: Option<String>,
}

/// Status of an AzureNodePool.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureNodePoolStatus {
    /// Conditions representing the current state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Number of Ready workload-cluster nodes belonging to this pool.
    #[serde(default)]
    pub ready_nodes: i32,

    /// Observed generation of the spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl AzureNodePool {
    /// Whether the pool runs on spot instances.
    pub fn is_spot(&self) -> bool {
        self.spec.spot.is_some()
    }
}
