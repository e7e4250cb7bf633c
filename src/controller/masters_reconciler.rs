//! Reconciliation loop for AzureCluster.
//!
//! Each reconciliation runs exactly one transition of the masters upgrade
//! state machine and persists the new stage on the cluster's status. The
//! machine itself is stateless; holding a state simply means the same
//! transition runs again on the next tick.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, warn};

use crate::crd::AzureCluster;

use super::context::{Collaborators, Context, FIELD_MANAGER};
use super::error::Error;
use super::masters::{self, control_plane_upgrading};
use super::state_machine::Machine;
use super::status::{UpdateOutcome, stage_of};

/// Finalizer name for cluster resources
pub const CLUSTER_FINALIZER: &str = "vmss-operator.io/cluster-finalizer";

static MACHINE: LazyLock<Machine<Collaborators, AzureCluster>> = LazyLock::new(masters::machine);

/// Reconcile an AzureCluster
///
/// Runs one masters state machine transition and persists the resulting
/// stage, publishing an event when the stage changed.
pub async fn reconcile(obj: Arc<AzureCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = std::time::Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling AzureCluster");

    let api: Api<AzureCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    // Handle deletion
    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &namespace).await;
    }

    // Ensure finalizer is present
    if !obj.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
        info!(name = %name, "Adding finalizer");
        add_finalizer(&api, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let current = stage_of(&obj);
    let next = match MACHINE.execute(&ctx.collaborators, &obj, &current).await {
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

    // Persist only on change; a conflict means someone else moved the
    // object and the next tick re-reads it anyway.
    if next != current {
        match ctx.collaborators.cluster_status.set_stage(&obj, &next).await? {
            UpdateOutcome::Updated => {
                info!(name = %name, from = %current, to = %next, "Masters stage updated");
                ctx.publish_normal_event(
                    obj.as_ref(),
                    "StageTransition",
                    "Reconcile",
                    Some(format!("Masters upgrade moved from '{current}' to '{next}'")),
                )
                .await;
            }
            UpdateOutcome::Conflict => {
                warn!(name = %name, "Stage write conflicted, requeueing");
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
            .record_reconcile("masters", &namespace, &name, duration);
    }

    // A stage change keeps momentum; a held state polls; the resting state
    // only needs an occasional drift check.
    let requeue_duration = if next != current {
        Duration::from_secs(2)
    } else if control_plane_upgrading(&next) {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(300)
    };

    Ok(Action::requeue(requeue_duration))
}

/// Error policy for the cluster controller
pub fn error_policy(obj: Arc<AzureCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error("masters", &namespace, &name);
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

/// Handle deletion of an AzureCluster
async fn handle_deletion(
    obj: &AzureCluster,
    ctx: &Context,
    namespace: &str,
) -> Result<Action, Error> {
    let name = obj.name_any();
    info!(name = %name, "Handling deletion");

    // Azure infrastructure teardown is owned by the provisioning pipeline,
    // not this operator; only the finalizer is removed here.
    let api: Api<AzureCluster> = Api::namespaced(ctx.client.clone(), namespace);
    remove_finalizer(&api, &name).await?;

    Ok(Action::await_change())
}

/// Add finalizer to resource
async fn add_finalizer(api: &Api<AzureCluster>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": [CLUSTER_FINALIZER]
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
async fn remove_finalizer(api: &Api<AzureCluster>, name: &str) -> Result<(), Error> {
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
