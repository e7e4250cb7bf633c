//! Upgrade state machine for the masters (control plane) scale set.
//!
//! Masters roll one instance per tick: an instance is updated or reimaged
//! only when every control plane node is Ready again, so etcd never loses
//! more than one member at a time. The graph cycles back to the empty state
//! whenever the deployment drifts or fails, which re-submits it.

use kube::ResourceExt;
use tracing::{debug, warn};

use crate::azure::types::ResourceScope;
use crate::crd::AzureCluster;
use crate::template;
use crate::workload::{MASTER_SELECTOR, WorkloadNode, node_requires_upgrade};

use super::context::Collaborators;
use super::error::Error;
use super::state_machine::{Machine, State};

// ============================================================================
// States
// ============================================================================

/// States of the masters upgrade graph. `Empty` is the label an
/// uninitialized AzureCluster carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Empty,
    DeploymentUninitialized,
    DeploymentInitialized,
    ProvisioningSuccessful,
    ClusterUpgradeRequirementCheck,
    MasterInstancesUpgrading,
    DeploymentCompleted,
}

impl MasterState {
    pub const ALL: [MasterState; 7] = [
        MasterState::Empty,
        MasterState::DeploymentUninitialized,
        MasterState::DeploymentInitialized,
        MasterState::ProvisioningSuccessful,
        MasterState::ClusterUpgradeRequirementCheck,
        MasterState::MasterInstancesUpgrading,
        MasterState::DeploymentCompleted,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MasterState::Empty => "",
            MasterState::DeploymentUninitialized => "DeploymentUninitialized",
            MasterState::DeploymentInitialized => "DeploymentInitialized",
            MasterState::ProvisioningSuccessful => "ProvisioningSuccessful",
            MasterState::ClusterUpgradeRequirementCheck => "ClusterUpgradeRequirementCheck",
            MasterState::MasterInstancesUpgrading => "MasterInstancesUpgrading",
            MasterState::DeploymentCompleted => "DeploymentCompleted",
        }
    }
}

impl From<MasterState> for State {
    fn from(s: MasterState) -> Self {
        State::from(s.label())
    }
}

impl std::fmt::Display for MasterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Whether a persisted masters state means the control plane is mid-upgrade.
/// Node pool reconciliation pauses while this is true.
pub fn control_plane_upgrading(state: &State) -> bool {
    !state.is_empty() && state.as_str() != MasterState::DeploymentCompleted.label()
}

/// The Azure scope (cluster id + resource group) of an AzureCluster.
pub fn scope_of(cluster: &AzureCluster) -> ResourceScope {
    ResourceScope::new(cluster.name_any(), cluster.resource_group())
}

// ============================================================================
// Machine
// ============================================================================

/// Build the masters transition table.
pub fn machine() -> Machine<Collaborators, AzureCluster> {
    Machine::new("masters")
        .transition(MasterState::Empty, |c, t, s| Box::pin(empty(c, t, s)))
        .transition(MasterState::DeploymentUninitialized, |c, t, s| {
            Box::pin(deployment_uninitialized(c, t, s))
        })
        .transition(MasterState::DeploymentInitialized, |c, t, s| {
            Box::pin(deployment_initialized(c, t, s))
        })
        .transition(MasterState::ProvisioningSuccessful, |c, t, s| {
            Box::pin(provisioning_successful(c, t, s))
        })
        .transition(MasterState::ClusterUpgradeRequirementCheck, |c, t, s| {
            Box::pin(cluster_upgrade_requirement_check(c, t, s))
        })
        .transition(MasterState::MasterInstancesUpgrading, |c, t, s| {
            Box::pin(master_instances_upgrading(c, t, s))
        })
        .transition(MasterState::DeploymentCompleted, |c, t, s| {
            Box::pin(deployment_completed(c, t, s))
        })
}

// ============================================================================
// Transition handlers
// ============================================================================

/// Entry point: a fresh or reset cluster moves straight to deployment
/// submission.
async fn empty(
    _collab: &Collaborators,
    _cluster: &AzureCluster,
    _current: &State,
) -> Result<State, Error> {
    Ok(MasterState::DeploymentUninitialized.into())
}

/// Render and submit the masters deployment, recording its checksums on the
/// cluster status so later ticks can detect drift.
async fn deployment_uninitialized(
    collab: &Collaborators,
    cluster: &AzureCluster,
    current: &State,
) -> Result<State, Error> {
    let desired = match collab.builder.masters_deployment(cluster).await {
        Ok(d) => d,
        Err(Error::NotReady(reason)) => {
            debug!(cluster = %cluster.name_any(), %reason, "Deployment inputs not ready yet");
            return Ok(current.clone());
        }
        Err(e) => return Err(e),
    };

    let scope = scope_of(cluster);
    let deployments = collab.azure.deployments(&scope).await?;
    deployments
        .create_or_update(&scope.resource_group, scope.masters_deployment(), &desired)
        .await?;

    collab
        .cluster_status
        .set_deployment_checksums(
            cluster,
            &desired.template_checksum(),
            &desired.parameters_checksum(),
        )
        .await?;

    Ok(MasterState::DeploymentInitialized.into())
}

/// Wait until Azure has finished provisioning the submitted deployment.
async fn deployment_initialized(
    collab: &Collaborators,
    cluster: &AzureCluster,
    current: &State,
) -> Result<State, Error> {
    let scope = scope_of(cluster);
    let deployments = collab.azure.deployments(&scope).await?;

    let Some(deployment) = deployments
        .get(&scope.resource_group, scope.masters_deployment())
        .await?
    else {
        // The deployment was deleted out from under us; restart the cycle so
        // it gets resubmitted rather than waiting here forever.
        warn!(cluster = %cluster.name_any(), "Masters deployment disappeared, restarting cycle");
        return Ok(MasterState::Empty.into());
    };

    if deployment.provisioning_state.is_succeeded() {
        Ok(MasterState::ProvisioningSuccessful.into())
    } else if deployment.provisioning_state.has_failed() {
        warn!(
            cluster = %cluster.name_any(),
            state = %deployment.provisioning_state.as_str(),
            "Masters deployment failed, resubmitting"
        );
        Ok(MasterState::Empty.into())
    } else {
        Ok(current.clone())
    }
}

async fn provisioning_successful(
    _collab: &Collaborators,
    _cluster: &AzureCluster,
    _current: &State,
) -> Result<State, Error> {
    Ok(MasterState::ClusterUpgradeRequirementCheck.into())
}

/// Decide whether master instances actually need a roll. Skipped entirely
/// while initial cluster creation is still in progress.
async fn cluster_upgrade_requirement_check(
    collab: &Collaborators,
    cluster: &AzureCluster,
    current: &State,
) -> Result<State, Error> {
    if !cluster.creation_complete() {
        return Ok(MasterState::DeploymentCompleted.into());
    }

    let nodes = match master_nodes(collab, cluster).await {
        Ok(nodes) => nodes,
        Err(hold) => return hold_or_err(hold, current),
    };
    if nodes.is_empty() {
        return Ok(current.clone());
    }

    let outdated = nodes
        .iter()
        .any(|n| node_requires_upgrade(n, &cluster.spec.release));
    if outdated {
        Ok(MasterState::MasterInstancesUpgrading.into())
    } else {
        Ok(MasterState::DeploymentCompleted.into())
    }
}

/// Roll master instances, at most one mutation per tick. Instances with a
/// stale scale set model are updated before anything is reimaged; a reimage
/// only happens while every control plane node is Ready.
async fn master_instances_upgrading(
    collab: &Collaborators,
    cluster: &AzureCluster,
    current: &State,
) -> Result<State, Error> {
    let scope = scope_of(cluster);
    let scale_sets = collab.azure.scale_sets(&scope).await?;
    let vmss_name = scope.masters_scale_set();

    let Some(vmss) = scale_sets.get(&scope.resource_group, &vmss_name).await? else {
        warn!(cluster = %cluster.name_any(), "Masters scale set is gone, resubmitting deployment");
        return Ok(MasterState::Empty.into());
    };
    if !vmss.provisioning_state.is_succeeded() {
        return Ok(current.clone());
    }

    let instances = scale_sets
        .list_instances(&scope.resource_group, &vmss_name)
        .await?;

    // Stale model first: the deployment changed under a running instance.
    if let Some(stale) = instances.iter().find(|i| i.is_old()) {
        debug!(
            cluster = %cluster.name_any(),
            instance = %stale.instance_id,
            "Applying latest scale set model to master instance"
        );
        scale_sets
            .update_instances(
                &scope.resource_group,
                &vmss_name,
                &[stale.instance_id.clone()],
            )
            .await?;
        return Ok(current.clone());
    }

    let nodes = match master_nodes(collab, cluster).await {
        Ok(nodes) => nodes,
        Err(hold) => return hold_or_err(hold, current),
    };

    // Every instance must have a Ready node before the next one is touched;
    // a missing node means its instance is still rejoining after a reimage.
    for instance in &instances {
        match nodes.iter().find(|n| n.name == instance.name) {
            Some(node) if node.ready => {}
            _ => return Ok(current.clone()),
        }
    }

    let next = instances.iter().find(|i| {
        nodes
            .iter()
            .find(|n| n.name == i.name)
            .is_some_and(|n| node_requires_upgrade(n, &cluster.spec.release))
    });
    match next {
        Some(instance) => {
            debug!(
                cluster = %cluster.name_any(),
                instance = %instance.instance_id,
                "Reimaging master instance"
            );
            scale_sets
                .reimage_instance(&scope.resource_group, &vmss_name, &instance.instance_id)
                .await?;
            Ok(current.clone())
        }
        None => Ok(MasterState::DeploymentCompleted.into()),
    }
}

/// Resting state: watch for deployment drift, failure, or outdated nodes
/// and cycle back to resubmission when any appears.
async fn deployment_completed(
    collab: &Collaborators,
    cluster: &AzureCluster,
    current: &State,
) -> Result<State, Error> {
    let scope = scope_of(cluster);
    let deployments = collab.azure.deployments(&scope).await?;

    let Some(deployment) = deployments
        .get(&scope.resource_group, scope.masters_deployment())
        .await?
    else {
        return Ok(MasterState::Empty.into());
    };
    if deployment.provisioning_state.has_failed() {
        return Ok(MasterState::Empty.into());
    }
    if !deployment.provisioning_state.is_succeeded() {
        return Ok(current.clone());
    }

    if cluster.creation_complete() {
        let nodes = match master_nodes(collab, cluster).await {
            Ok(nodes) => nodes,
            Err(hold) => return hold_or_err(hold, current),
        };
        if nodes
            .iter()
            .any(|n| node_requires_upgrade(n, &cluster.spec.release))
        {
            return Ok(MasterState::Empty.into());
        }
    }

    let desired = match collab.builder.masters_deployment(cluster).await {
        Ok(d) => d,
        Err(Error::NotReady(_)) => return Ok(current.clone()),
        Err(e) => return Err(e),
    };
    if !template::diff(&deployment, &desired).is_empty() || checksums_drifted(cluster, &desired) {
        return Ok(MasterState::Empty.into());
    }

    Ok(current.clone())
}

// ============================================================================
// Helpers
// ============================================================================

fn checksums_drifted(cluster: &AzureCluster, desired: &crate::template::DesiredDeployment) -> bool {
    let Some(status) = cluster.status.as_ref() else {
        return true;
    };
    status.deployment_template_checksum.as_deref() != Some(desired.template_checksum().as_str())
        || status.deployment_parameters_checksum.as_deref()
            != Some(desired.parameters_checksum().as_str())
}

/// List control plane nodes. A transient workload error is returned as
/// `Ok(hold)` material for the caller; anything else propagates.
async fn master_nodes(
    collab: &Collaborators,
    cluster: &AzureCluster,
) -> Result<Vec<WorkloadNode>, Error> {
    let cluster_id = cluster.name_any();
    let workload = match collab.workload.workload_cluster(&cluster_id).await {
        Ok(w) => w,
        Err(e) => return Err(e.into()),
    };
    workload
        .nodes(MASTER_SELECTOR)
        .await
        .map_err(Into::into)
}

/// Transient workload errors hold the current state; others propagate.
fn hold_or_err(err: Error, current: &State) -> Result<State, Error> {
    match &err {
        Error::Workload(w) if w.is_transient() => {
            debug!(error = %w, "Workload cluster unavailable, holding state");
            Ok(current.clone())
        }
        _ => Err(err),
    }
}
