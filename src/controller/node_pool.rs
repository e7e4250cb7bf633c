//! Upgrade state machine for worker node pools.
//!
//! Worker pools roll by surge: the scale set is doubled so fresh instances
//! join before any old one is touched, old nodes are cordoned and drained,
//! and only then are the old instances deleted. Spot pools skip cordon and
//! drain entirely, since a spot instance can disappear at any moment anyway
//! and eviction is the native way to take one away.

use kube::ResourceExt;
use tracing::{debug, warn};

use crate::azure::types::{AUTOSCALER_ENABLED_TAG, EvictionOutcome, ResourceScope};
use crate::crd::{AzureCluster, AzureNodePool, NODE_POOL_LABEL};
use crate::drain::{DRAIN_TIMEOUT, DrainError};
use crate::template;
use crate::workload::{WorkloadNode, node_requires_upgrade};

use super::context::Collaborators;
use super::error::Error;
use super::scale::next_count;
use super::state_machine::{Machine, State};

// ============================================================================
// States
// ============================================================================

/// States of the node pool upgrade graph. A pool without the state
/// annotation starts at `DeploymentUninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePoolState {
    DeploymentUninitialized,
    ScaleUpWorkerVMSS,
    WaitForWorkersToBecomeReady,
    CordonOldWorkers,
    DrainOldWorkerNodes,
    TerminateOldWorkerInstances,
}

impl NodePoolState {
    pub const ALL: [NodePoolState; 6] = [
        NodePoolState::DeploymentUninitialized,
        NodePoolState::ScaleUpWorkerVMSS,
        NodePoolState::WaitForWorkersToBecomeReady,
        NodePoolState::CordonOldWorkers,
        NodePoolState::DrainOldWorkerNodes,
        NodePoolState::TerminateOldWorkerInstances,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            NodePoolState::DeploymentUninitialized => "DeploymentUninitialized",
            NodePoolState::ScaleUpWorkerVMSS => "ScaleUpWorkerVMSS",
            NodePoolState::WaitForWorkersToBecomeReady => "WaitForWorkersToBecomeReady",
            NodePoolState::CordonOldWorkers => "CordonOldWorkers",
            NodePoolState::DrainOldWorkerNodes => "DrainOldWorkerNodes",
            NodePoolState::TerminateOldWorkerInstances => "TerminateOldWorkerInstances",
        }
    }
}

impl From<NodePoolState> for State {
    fn from(s: NodePoolState) -> Self {
        State::from(s.label())
    }
}

impl std::fmt::Display for NodePoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// What one node pool tick acts on: the pool plus its owning cluster, which
/// carries the resource group, credentials and release.
#[derive(Clone)]
pub struct NodePoolTarget {
    pub pool: AzureNodePool,
    pub cluster: AzureCluster,
}

impl NodePoolTarget {
    pub fn scope(&self) -> ResourceScope {
        ResourceScope::new(self.cluster.name_any(), self.cluster.resource_group())
    }

    pub fn pool_name(&self) -> String {
        self.pool.name_any()
    }

    /// Label selector matching this pool's nodes in the workload cluster.
    pub fn node_selector(&self) -> String {
        format!("{NODE_POOL_LABEL}={}", self.pool_name())
    }
}

// ============================================================================
// Machine
// ============================================================================

/// Build the node pool transition table.
pub fn machine() -> Machine<Collaborators, NodePoolTarget> {
    Machine::new("node-pool")
        .transition(NodePoolState::DeploymentUninitialized, |c, t, s| {
            Box::pin(deployment_uninitialized(c, t, s))
        })
        .transition(NodePoolState::ScaleUpWorkerVMSS, |c, t, s| {
            Box::pin(scale_up_worker_vmss(c, t, s))
        })
        .transition(NodePoolState::WaitForWorkersToBecomeReady, |c, t, s| {
            Box::pin(wait_for_workers_to_become_ready(c, t, s))
        })
        .transition(NodePoolState::CordonOldWorkers, |c, t, s| {
            Box::pin(cordon_old_workers(c, t, s))
        })
        .transition(NodePoolState::DrainOldWorkerNodes, |c, t, s| {
            Box::pin(drain_old_worker_nodes(c, t, s))
        })
        .transition(NodePoolState::TerminateOldWorkerInstances, |c, t, s| {
            Box::pin(terminate_old_worker_instances(c, t, s))
        })
}

// ============================================================================
// Transition handlers
// ============================================================================

/// Resting and entry state: reconcile the pool's deployment. A change that
/// only touches the scaling parameter is applied in place (the autoscaler
/// resizes pools constantly); any other change starts a rolling upgrade.
async fn deployment_uninitialized(
    collab: &Collaborators,
    target: &NodePoolTarget,
    current: &State,
) -> Result<State, Error> {
    let scope = target.scope();
    let pool_name = target.pool_name();
    let scale_sets = collab.azure.scale_sets(&scope).await?;
    let existing = scale_sets
        .get(&scope.resource_group, &scope.node_pool_scale_set(&pool_name))
        .await?;

    let desired = match collab
        .builder
        .node_pool_deployment(&target.pool, existing.as_ref())
        .await
    {
        Ok(d) => d,
        Err(Error::NotReady(reason)) => {
            debug!(pool = %pool_name, %reason, "Deployment inputs not ready yet");
            return Ok(current.clone());
        }
        Err(e) => return Err(e),
    };

    let deployments = collab.azure.deployments(&scope).await?;
    let deployment_name = scope.node_pool_deployment(&pool_name);

    let Some(deployment) = deployments.get(&scope.resource_group, &deployment_name).await? else {
        deployments
            .create_or_update(&scope.resource_group, &deployment_name, &desired)
            .await?;
        return Ok(NodePoolState::ScaleUpWorkerVMSS.into());
    };

    if deployment.provisioning_state.has_failed() {
        warn!(pool = %pool_name, "Node pool deployment failed, resubmitting");
        deployments
            .create_or_update(&scope.resource_group, &deployment_name, &desired)
            .await?;
        return Ok(current.clone());
    }

    let changed = template::diff(&deployment, &desired);
    if changed.is_empty() {
        return Ok(current.clone());
    }

    deployments
        .create_or_update(&scope.resource_group, &deployment_name, &desired)
        .await?;

    if template::is_scaling_only(&changed) {
        debug!(pool = %pool_name, "Scaling-only change applied in place");
        Ok(current.clone())
    } else {
        debug!(pool = %pool_name, parameters = ?changed, "Rolling change, starting upgrade");
        Ok(NodePoolState::ScaleUpWorkerVMSS.into())
    }
}

/// Surge the scale set to double the number of outdated instances, in
/// bounded steps. The cluster autoscaler is told to stand down first so it
/// does not fight the surge.
async fn scale_up_worker_vmss(
    collab: &Collaborators,
    target: &NodePoolTarget,
    current: &State,
) -> Result<State, Error> {
    let scope = target.scope();
    let pool_name = target.pool_name();
    let vmss_name = scope.node_pool_scale_set(&pool_name);

    let scale_sets = collab.azure.scale_sets(&scope).await?;
    let Some(vmss) = scale_sets.get(&scope.resource_group, &vmss_name).await? else {
        // The scale set was deleted out from under us; only the resting
        // state resubmits the deployment, so go back there.
        warn!(pool = %pool_name, "Scale set disappeared, restarting cycle");
        return Ok(NodePoolState::DeploymentUninitialized.into());
    };

    let deployments = collab.azure.deployments(&scope).await?;
    let deployment = deployments
        .get(&scope.resource_group, &scope.node_pool_deployment(&pool_name))
        .await?;
    if !deployment.is_some_and(|d| d.provisioning_state.is_succeeded()) {
        return Ok(current.clone());
    }

    let instances = scale_sets
        .list_instances(&scope.resource_group, &vmss_name)
        .await?;
    if instances.iter().any(|i| !i.is_running()) {
        return Ok(current.clone());
    }

    let old_count = instances.iter().filter(|i| i.is_old()).count() as i64;
    if old_count == 0 {
        return Ok(NodePoolState::WaitForWorkersToBecomeReady.into());
    }

    let desired = old_count * 2;
    if vmss.capacity >= desired {
        return Ok(NodePoolState::WaitForWorkersToBecomeReady.into());
    }

    if vmss.autoscaler_enabled() {
        scale_sets
            .set_tag(&scope.resource_group, &vmss_name, AUTOSCALER_ENABLED_TAG, "false")
            .await?;
    }
    let step = next_count(vmss.capacity, desired);
    debug!(pool = %pool_name, from = vmss.capacity, to = step, target = desired, "Scaling up");
    scale_sets
        .set_capacity(&scope.resource_group, &vmss_name, step)
        .await?;
    Ok(current.clone())
}

/// Wait until at least one up-to-date worker is Ready before taking any old
/// one away. Spot pools go straight to termination.
async fn wait_for_workers_to_become_ready(
    collab: &Collaborators,
    target: &NodePoolTarget,
    current: &State,
) -> Result<State, Error> {
    if target.pool.is_spot() {
        return Ok(NodePoolState::TerminateOldWorkerInstances.into());
    }

    let nodes = match pool_nodes(collab, target).await {
        Ok(nodes) => nodes,
        Err(hold) => return hold_or_err(hold, current),
    };

    let fresh_ready = nodes
        .iter()
        .any(|n| n.ready && !node_requires_upgrade(n, &target.pool.spec.release));
    if fresh_ready {
        Ok(NodePoolState::CordonOldWorkers.into())
    } else {
        Ok(current.clone())
    }
}

/// Mark the node of every old-model instance unschedulable. Oldness here is
/// the scale set's own view (latest model applied or not), the same one
/// termination acts on, so nothing gets deleted that was never cordoned.
async fn cordon_old_workers(
    collab: &Collaborators,
    target: &NodePoolTarget,
    current: &State,
) -> Result<State, Error> {
    let old = old_instance_node_names(collab, target).await?;
    let nodes = match pool_nodes(collab, target).await {
        Ok(nodes) => nodes,
        Err(hold) => return hold_or_err(hold, current),
    };

    let cluster_id = target.cluster.name_any();
    for node in nodes.iter().filter(|n| old.contains(&n.name)) {
        collab.drainer.cordon(&cluster_id, &node.name).await?;
    }
    Ok(NodePoolState::DrainOldWorkerNodes.into())
}

/// Evict pods off the node of every old-model instance. Eviction
/// backpressure holds the state for another tick; a node that cannot be
/// emptied within the drain timeout is given up on and deleted with
/// whatever is left on it.
async fn drain_old_worker_nodes(
    collab: &Collaborators,
    target: &NodePoolTarget,
    current: &State,
) -> Result<State, Error> {
    let old = old_instance_node_names(collab, target).await?;
    let nodes = match pool_nodes(collab, target).await {
        Ok(nodes) => nodes,
        Err(hold) => return hold_or_err(hold, current),
    };

    let cluster_id = target.cluster.name_any();
    for node in nodes.iter().filter(|n| old.contains(&n.name)) {
        match collab.drainer.drain(&cluster_id, &node.name, DRAIN_TIMEOUT).await {
            Ok(()) => {}
            Err(DrainError::EvictionInProgress { .. }) => return Ok(current.clone()),
            Err(DrainError::DrainTimeout { node }) => {
                warn!(pool = %target.pool_name(), %node, "Drain timed out, terminating anyway");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(NodePoolState::TerminateOldWorkerInstances.into())
}

/// Delete the old instances and, once none remain, hand the scale set back
/// to the autoscaler and return to the resting state.
async fn terminate_old_worker_instances(
    collab: &Collaborators,
    target: &NodePoolTarget,
    current: &State,
) -> Result<State, Error> {
    let scope = target.scope();
    let pool_name = target.pool_name();
    let vmss_name = scope.node_pool_scale_set(&pool_name);

    let scale_sets = collab.azure.scale_sets(&scope).await?;
    let instances = scale_sets
        .list_instances(&scope.resource_group, &vmss_name)
        .await?;
    let old: Vec<String> = instances
        .iter()
        .filter(|i| i.is_old())
        .map(|i| i.instance_id.clone())
        .collect();

    if old.is_empty() {
        let vmss = scale_sets.get(&scope.resource_group, &vmss_name).await?;
        let autoscaler_disabled = vmss.is_some_and(|v| {
            v.tags
                .get(AUTOSCALER_ENABLED_TAG)
                .is_some_and(|t| t != "true")
        });
        if autoscaler_disabled {
            scale_sets
                .set_tag(&scope.resource_group, &vmss_name, AUTOSCALER_ENABLED_TAG, "true")
                .await?;
        }
        return Ok(NodePoolState::DeploymentUninitialized.into());
    }

    if target.pool.is_spot() {
        // Spot capacity cannot simply be deleted out from under the Spot
        // service; a simulated eviction is requested first and deletion is
        // the fallback when Azure refuses it.
        for instance_id in &old {
            match scale_sets
                .simulate_eviction(&scope.resource_group, &vmss_name, instance_id)
                .await?
            {
                EvictionOutcome::Accepted => {}
                EvictionOutcome::Conflict => {
                    scale_sets
                        .delete_instances(&scope.resource_group, &vmss_name, &[instance_id.clone()])
                        .await?;
                }
            }
        }
    } else {
        scale_sets
            .delete_instances(&scope.resource_group, &vmss_name, &old)
            .await?;
    }
    Ok(current.clone())
}

// ============================================================================
// Helpers
// ============================================================================

/// Names of the nodes backing instances that have not yet picked up the
/// latest scale set model.
async fn old_instance_node_names(
    collab: &Collaborators,
    target: &NodePoolTarget,
) -> Result<Vec<String>, Error> {
    let scope = target.scope();
    let vmss_name = scope.node_pool_scale_set(&target.pool_name());
    let scale_sets = collab.azure.scale_sets(&scope).await?;
    let instances = scale_sets
        .list_instances(&scope.resource_group, &vmss_name)
        .await?;
    Ok(instances
        .iter()
        .filter(|i| i.is_old())
        .map(|i| i.name.clone())
        .collect())
}

async fn pool_nodes(
    collab: &Collaborators,
    target: &NodePoolTarget,
) -> Result<Vec<WorkloadNode>, Error> {
    let cluster_id = target.cluster.name_any();
    let workload = collab.workload.workload_cluster(&cluster_id).await?;
    workload
        .nodes(&target.node_selector())
        .await
        .map_err(Into::into)
}

fn hold_or_err(err: Error, current: &State) -> Result<State, Error> {
    match &err {
        Error::Workload(w) if w.is_transient() => {
            debug!(error = %w, "Workload cluster unavailable, holding state");
            Ok(current.clone())
        }
        _ => Err(err),
    }
}
