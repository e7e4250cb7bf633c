//! Resource fixtures shared by the functional tests.

use std::collections::BTreeMap;

use serde_json::json;

use vmss_operator::azure::types::{ProvisioningState, ScaleSetInstance};
use vmss_operator::controller::node_pool::NodePoolTarget;
use vmss_operator::crd::{
    AzureCluster, AzureClusterSpec, AzureClusterStatus, AzureNodePool, AzureNodePoolSpec,
    Condition, ControlPlaneSpec, NODE_POOL_LABEL, OsImageSpec, ReleaseSpec, ScalingSpec,
    SecretReference, SpotSpec,
};
use vmss_operator::template::{DesiredDeployment, PARAM_SCALING};
use vmss_operator::workload::{COMPONENT_LABEL_PREFIX, WorkloadNode};

pub const CLUSTER_NAME: &str = "c42";
pub const POOL_NAME: &str = "np1";

/// Release every fixture converges to.
pub fn release() -> ReleaseSpec {
    ReleaseSpec {
        version: "18.2.1".to_string(),
        components: [
            ("kubernetes".to_string(), "1.32.2".to_string()),
            ("flatcar".to_string(), "3815.2.5".to_string()),
        ]
        .into_iter()
        .collect(),
    }
}

/// A cluster whose initial creation has completed.
pub fn cluster() -> AzureCluster {
    let mut cluster = AzureCluster::new(
        CLUSTER_NAME,
        AzureClusterSpec {
            location: "westeurope".to_string(),
            resource_group: None,
            credential_secret: SecretReference {
                name: "azure-sp".to_string(),
                namespace: None,
            },
            release: release(),
            control_plane: ControlPlaneSpec {
                vm_size: "Standard_D4s_v5".to_string(),
                replicas: 3,
                availability_zones: vec![1, 2, 3],
                storage_account_type: None,
            },
        },
    );
    cluster.status = Some(AzureClusterStatus {
        conditions: vec![Condition::new("Created", true, "CreationCompleted", "", None)],
        ..Default::default()
    });
    cluster
}

/// A cluster still being created (no Created condition).
pub fn cluster_in_creation() -> AzureCluster {
    let mut cluster = cluster();
    cluster.status = Some(AzureClusterStatus::default());
    cluster
}

/// A cluster whose status already records the given deployment checksums.
pub fn cluster_with_checksums(desired: &DesiredDeployment) -> AzureCluster {
    let mut cluster = cluster();
    if let Some(status) = cluster.status.as_mut() {
        status.deployment_template_checksum = Some(desired.template_checksum());
        status.deployment_parameters_checksum = Some(desired.parameters_checksum());
    }
    cluster
}

/// An on-demand worker pool.
pub fn pool() -> AzureNodePool {
    AzureNodePool::new(
        POOL_NAME,
        AzureNodePoolSpec {
            cluster_name: CLUSTER_NAME.to_string(),
            vm_size: "Standard_D8s_v5".to_string(),
            subnet: "workers".to_string(),
            os_image: OsImageSpec {
                version: "3815.2.5".to_string(),
            },
            release: release(),
            scaling: ScalingSpec { min: 3, max: 20 },
            spot: None,
            accelerated_networking: Some(true),
        },
    )
}

/// A spot worker pool.
pub fn spot_pool() -> AzureNodePool {
    let mut pool = pool();
    pool.spec.spot = Some(SpotSpec {
        max_price: Some("-1".to_string()),
        eviction_policy: Some("Delete".to_string()),
    });
    pool
}

pub fn target(pool: AzureNodePool) -> NodePoolTarget {
    NodePoolTarget {
        pool,
        cluster: cluster(),
    }
}

/// The deployment the mock builder renders for the masters.
pub fn masters_desired() -> DesiredDeployment {
    DesiredDeployment {
        template: json!({"kind": "masters", "location": "westeurope"}),
        parameters: [
            ("vmSize".to_string(), json!("Standard_D4s_v5")),
            ("releaseVersion".to_string(), json!("18.2.1")),
        ]
        .into_iter()
        .collect(),
    }
}

/// The deployment the mock builder renders for the pool.
pub fn pool_desired() -> DesiredDeployment {
    DesiredDeployment {
        template: json!({"kind": "nodepool"}),
        parameters: [
            ("vmSize".to_string(), json!("Standard_D8s_v5")),
            ("osImageVersion".to_string(), json!("3815.2.5")),
            ("releaseVersion".to_string(), json!("18.2.1")),
            (PARAM_SCALING.to_string(), json!({"min": 3, "max": 20})),
        ]
        .into_iter()
        .collect(),
    }
}

pub fn instance(id: &str, name: &str, latest_model: bool) -> ScaleSetInstance {
    ScaleSetInstance {
        instance_id: id.to_string(),
        name: name.to_string(),
        latest_model_applied: latest_model,
        provisioning_state: ProvisioningState::Succeeded,
    }
}

/// A control plane node running the given component versions.
pub fn master_node(name: &str, ready: bool, versions: &[(&str, &str)]) -> WorkloadNode {
    let mut labels: BTreeMap<String, String> = versions
        .iter()
        .map(|(k, v)| (format!("{COMPONENT_LABEL_PREFIX}{k}"), v.to_string()))
        .collect();
    labels.insert(
        "node-role.kubernetes.io/control-plane".to_string(),
        String::new(),
    );
    WorkloadNode {
        name: name.to_string(),
        ready,
        labels,
    }
}

/// A worker node belonging to the fixture pool.
pub fn worker_node(name: &str, ready: bool, versions: &[(&str, &str)]) -> WorkloadNode {
    let mut labels: BTreeMap<String, String> = versions
        .iter()
        .map(|(k, v)| (format!("{COMPONENT_LABEL_PREFIX}{k}"), v.to_string()))
        .collect();
    labels.insert(NODE_POOL_LABEL.to_string(), POOL_NAME.to_string());
    WorkloadNode {
        name: name.to_string(),
        ready,
        labels,
    }
}

/// Component labels matching the fixture release.
pub fn current_versions() -> Vec<(&'static str, &'static str)> {
    vec![("kubernetes", "1.32.2"), ("flatcar", "3815.2.5")]
}

/// Component labels one release behind.
pub fn outdated_versions() -> Vec<(&'static str, &'static str)> {
    vec![("kubernetes", "1.31.5"), ("flatcar", "3815.2.4")]
}
