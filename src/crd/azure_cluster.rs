//! AzureCluster Custom Resource Definition.
//!
//! An AzureCluster represents the control plane of a workload cluster: the
//! masters VM scale set, its ARM deployment, and the release the control
//! plane is expected to run. The upgrade state machine persists its current
//! stage as a condition on this resource's status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for all custom resources owned by this operator.
pub const API_GROUP: &str = "vmss-operator.io";

/// AzureCluster describes the Azure-backed control plane of one workload
/// cluster. The operator renders an ARM deployment for the masters scale set
/// and rolls master instances one at a time when the release changes.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vmss-operator.io",
    version = "v1alpha1",
    kind = "AzureCluster",
    plural = "azureclusters",
    shortname = "azc",
    status = "AzureClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Release","type":"string","jsonPath":".spec.release.version"}"#,
    printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".status.conditions[?(@.type=='Stage')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AzureClusterSpec {
    /// Azure location the cluster lives in (e.g. "westeurope").
    pub location: String,

    /// Azure resource group holding the cluster's infrastructure.
    /// Defaults to the cluster name when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,

    /// Secret holding the Azure credentials used for this cluster's
    /// subscription.
    pub credential_secret: SecretReference,

    /// Release the control plane must converge to.
    pub release: ReleaseSpec,

    /// Control plane (masters) scale set shape.
    pub control_plane: ControlPlaneSpec,
}

/// Reference to a Secret by name and optional namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the secret.
    pub name: String,

    /// Namespace of the secret (defaults to the resource's namespace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A release pins the versions of every component a node is expected to run.
///
/// Node labels carry the versions actually running; any mismatch (or a
/// missing label) marks the node as requiring a roll.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    /// Release version string (e.g. "18.2.1").
    pub version: String,

    /// Component name to version (kubernetes, etcd, calico, flatcar,
    /// operator, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, String>,
}

/// Shape of the masters VM scale set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Azure VM size for master instances (e.g. "Standard_D4s_v5").
    pub vm_size: String,

    /// Number of master instances.
    #[serde(default = "default_master_replicas")]
    pub replicas: i32,

    /// Availability zones for the scale set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_zones: Vec<i32>,

    /// Storage account type for OS disks; detected from VM SKU capabilities
    /// by the deployment builder when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_account_type: Option<String>,
}

fn default_master_replicas() -> i32 {
    1
}

/// Status of an AzureCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureClusterStatus {
    /// Conditions representing the current state. The entry with type
    /// "Stage" carries the upgrade state machine's current state in its
    /// status field and is the authoritative persisted state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Checksum of the ARM template submitted by the last masters
    /// deployment, used for drift detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_template_checksum: Option<String>,

    /// Checksum of the parameters submitted by the last masters deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_parameters_checksum: Option<String>,

    /// Observed generation of the spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl AzureCluster {
    /// The Azure resource group for this cluster.
    pub fn resource_group(&self) -> &str {
        self.spec
            .resource_group
            .as_deref()
            .unwrap_or_else(|| self.metadata.name.as_deref().unwrap_or_default())
    }

    /// Whether initial cluster creation has completed. A rolling upgrade of
    /// master instances must never start while the cluster is still being
    /// created.
    pub fn creation_complete(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| is_condition_true(&s.conditions, CONDITION_CREATED))
            .unwrap_or(false)
    }
}

/// Condition type marking initial cluster creation as complete.
pub const CONDITION_CREATED: &str = "Created";

/// Condition type carrying the upgrade state machine's persisted state.
pub const CONDITION_STAGE: &str = "Stage";

/// A status condition. Unlike upstream `metav1.Condition`, the status field
/// is a free string: the "Stage" condition stores the state label there.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", or a state label for the
    /// "Stage" condition).
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    #[serde(default)]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    #[serde(default)]
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new boolean condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Stage" condition carrying a state label.
    pub fn stage(state: &str) -> Self {
        Self {
            r#type: CONDITION_STAGE.to_string(),
            status: state.to_string(),
            reason: String::new(),
            message: String::new(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: None,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create an "Upgrading" condition.
    pub fn upgrading(upgrading: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Upgrading", upgrading, reason, message, generation)
    }
}

/// Find a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

/// Check if a boolean condition type is true.
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == "True")
}

/// Add or replace a condition of the same type, preserving order otherwise.
pub fn upsert_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}
