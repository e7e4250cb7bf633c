//! Reconciliation loop for AzureNodePool.
//!
//! Node pool reconciliation is gated on the owning cluster: while the
//! masters state machine is mid-upgrade the pool tick is skipped entirely,
//! so workers never roll underneath a control plane that is itself being
//! replaced. State is persisted as an annotation on the pool.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, warn};

use crate::crd::{AzureCluster, AzureNodePool};

use super::context::{Collaborators, Context, FIELD_MANAGER};
use super::error::Error;
use super::masters::control_plane_upgrading;
use super::node_pool::{self, NodePoolState, NodePoolTarget};
use super::state_machine::Machine;
use super::status::{UpdateOutcome, set_upgrade_state, stage_of, upgrade_state_of};

/// Finalizer name for node pool resources
pub const NODE_POOL_FINALIZER: &str = "vmss-operator.io/node-pool-finalizer";

static MACHINE: LazyLock<Machine<Collaborators, NodePoolTarget>> =
    LazyLock::new(node_pool::machine);

/// Reconcile an AzureNodePool
pub async fn reconcile(obj: Arc<AzureNodePool>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = std::time::Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling AzureNodePool");

    let api: Api<AzureNodePool> = Api::namespaced(ctx.client.clone(), &namespace);

    // Handle deletion
    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &namespace).await;
    }

    // Ensure finalizer is present
    if !obj.finalizers().iter().any(|f| f == NODE_POOL_FINALIZER) {
        info!(name = %name, "Adding finalizer");
        add_finalizer(&api, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // The owning cluster carries the resource group, credentials and the
    // masters stage this tick is gated on.
    let clusters: Api<AzureCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let cluster = match clusters.get(&obj.spec.cluster_name).await {
        Ok(c) => c,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            warn!(
                name = %name,
                cluster = %obj.spec.cluster_name,
                "Owning AzureCluster not found, waiting"
            );
            return Ok(Action::requeue(Duration::from_secs(60)));
        }
        Err(e) => return Err(e.into()),
    };

    let stage = stage_of(&cluster);
    if control_plane_upgrading(&stage) {
        debug!(
            name = %name,
            cluster = %obj.spec.cluster_name,
            stage = %stage,
            "Control plane is upgrading, skipping node pool tick"
        );
        return Ok(Action::requeue(Duration::from_secs(60)));
    }

    let current = upgrade_state_of(&obj)
        .unwrap_or_else(|| NodePoolState::DeploymentUninitialized.into());
    let target = NodePoolTarget {
        pool: obj.as_ref().clone(),
        cluster,
    };

    let next = match MACHINE.execute(&ctx.collaborators, &target, &current).await {
        Ok(next) => next,
        Err(e) if !e.is_retryable() => {
            ctx.publish_warning_event(
                obj.as_ref(),
                "UpgradeStateMachineFailed",
                "Reconcile",
                Some(e.to_string()),
            )
            .await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    if next != current {
        match set_upgrade_state(&api, &obj, &next).await? {
            UpdateOutcome::Updated => {
                info!(name = %name, from = %current, to = %next, "Node pool state updated");
                ctx.publish_normal_event(
                    obj.as_ref(),
                    "StageTransition",
                    "Reconcile",
                    Some(format!("Node pool upgrade moved from '{current}' to '{next}'")),
                )
                .await;
            }
            UpdateOutcome::Conflict => {
                warn!(name = %name, "State write conflicted, requeueing");
                return Ok(Action::requeue(Duration::from_secs(5)));
            }
            UpdateOutcome::Unchanged => {}
        }
    }

    // Record metrics
    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile("node-pool", &namespace, &name, duration);
    }

    let requeue_duration = if next != current {
        Duration::from_secs(2)
    } else if next == NodePoolState::DeploymentUninitialized.into() {
        Duration::from_secs(300)
    } else {
        Duration::from_secs(30)
    };

    Ok(Action::requeue(requeue_duration))
}

/// Error policy for the node pool controller
pub fn error_policy(obj: Arc<AzureNodePool>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("node-pool", &namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(Duration::from_secs(300))
    }
}

/// Handle deletion of an AzureNodePool
async fn handle_deletion(
    obj: &AzureNodePool,
    ctx: &Context,
    namespace: &str,
) -> Result<Action, Error> {
    let name = obj.name_any();
    info!(name = %name, "Handling deletion");

    let api: Api<AzureNodePool> = Api::namespaced(ctx.client.clone(), namespace);
    remove_finalizer(&api, &name).await?;

    Ok(Action::await_change())
}

/// Add finalizer to resource
async fn add_finalizer(api: &Api<AzureNodePool>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": [NODE_POOL_FINALIZER]
        }
    });
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Remove finalizer from resource
async fn remove_finalizer(api: &Api<AzureNodePool>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": null
        }
    });
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
