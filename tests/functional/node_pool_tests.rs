//! Functional tests for the node pool upgrade state machine.

use std::collections::BTreeMap;

use serde_json::json;

use vmss_operator::azure::types::{
    AUTOSCALER_ENABLED_TAG, Deployment, EvictionOutcome, ProvisioningState, ScaleSet,
};
use vmss_operator::controller::node_pool::{self, NodePoolState, NodePoolTarget};
use vmss_operator::controller::state_machine::State;
use vmss_operator::template::PARAM_SCALING;

use crate::fixtures::*;
use crate::mock_collaborators::{DrainBehavior, Harness};

const POOL_VMSS: &str = "c42-worker-np1";
const POOL_DEPLOYMENT: &str = "nodepool-np1";

fn pool_deployment(state: ProvisioningState) -> Deployment {
    Deployment {
        name: POOL_DEPLOYMENT.to_string(),
        provisioning_state: state,
        parameters: pool_desired().parameters,
    }
}

fn pool_vmss(capacity: i64, tags: &[(&str, &str)]) -> ScaleSet {
    ScaleSet {
        name: POOL_VMSS.to_string(),
        capacity,
        provisioning_state: ProvisioningState::Succeeded,
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        ..Default::default()
    }
}

async fn execute(harness: &Harness, target: &NodePoolTarget, state: NodePoolState) -> State {
    node_pool::machine()
        .execute(&harness.collaborators(), target, &state.into())
        .await
        .expect("transition failed")
}

#[tokio::test]
async fn test_fresh_pool_submits_deployment() {
    let harness = Harness::new();
    *harness.builder.node_pool.lock().unwrap() = Some(pool_desired());

    let next = execute(&harness, &target(pool()), NodePoolState::DeploymentUninitialized).await;

    assert_eq!(next, NodePoolState::ScaleUpWorkerVMSS.into());
    assert_eq!(
        harness.azure.calls(),
        vec![format!("deployments.createOrUpdate {POOL_DEPLOYMENT}")]
    );
}

#[tokio::test]
async fn test_builder_not_ready_holds() {
    let harness = Harness::new();
    let next = execute(&harness, &target(pool()), NodePoolState::DeploymentUninitialized).await;
    assert_eq!(next, NodePoolState::DeploymentUninitialized.into());
    assert_eq!(harness.azure.mutation_count(), 0);
}

#[tokio::test]
async fn test_unchanged_deployment_rests() {
    let harness = Harness::new();
    *harness.builder.node_pool.lock().unwrap() = Some(pool_desired());
    harness.azure.put_deployment(pool_deployment(ProvisioningState::Succeeded));

    let next = execute(&harness, &target(pool()), NodePoolState::DeploymentUninitialized).await;

    assert_eq!(next, NodePoolState::DeploymentUninitialized.into());
    assert_eq!(harness.azure.mutation_count(), 0);
}

#[tokio::test]
async fn test_scaling_only_change_applied_in_place() {
    let harness = Harness::new();
    *harness.builder.node_pool.lock().unwrap() = Some(pool_desired());
    let mut deployment = pool_deployment(ProvisioningState::Succeeded);
    deployment
        .parameters
        .insert(PARAM_SCALING.to_string(), json!({"min": 3, "max": 12}));
    harness.azure.put_deployment(deployment);

    let next = execute(&harness, &target(pool()), NodePoolState::DeploymentUninitialized).await;

    // The deployment is refreshed but no rolling upgrade starts.
    assert_eq!(next, NodePoolState::DeploymentUninitialized.into());
    assert_eq!(
        harness.azure.calls(),
        vec![format!("deployments.createOrUpdate {POOL_DEPLOYMENT}")]
    );
}

#[tokio::test]
async fn test_rolling_change_starts_upgrade() {
    let harness = Harness::new();
    *harness.builder.node_pool.lock().unwrap() = Some(pool_desired());
    let mut deployment = pool_deployment(ProvisioningState::Succeeded);
    deployment
        .parameters
        .insert("vmSize".to_string(), json!("Standard_D4s_v5"));
    harness.azure.put_deployment(deployment);

    let next = execute(&harness, &target(pool()), NodePoolState::DeploymentUninitialized).await;

    assert_eq!(next, NodePoolState::ScaleUpWorkerVMSS.into());
    assert_eq!(
        harness.azure.calls(),
        vec![format!("deployments.createOrUpdate {POOL_DEPLOYMENT}")]
    );
}

#[tokio::test]
async fn test_scale_up_is_stepped_and_disables_autoscaler() {
    let harness = Harness::new();
    harness.azure.put_deployment(pool_deployment(ProvisioningState::Succeeded));
    harness
        .azure
        .put_scale_set(pool_vmss(8, &[(AUTOSCALER_ENABLED_TAG, "true")]));
    let instances = (0..8)
        .map(|i| instance(&i.to_string(), &format!("w{i}"), false))
        .collect();
    harness.azure.put_instances(POOL_VMSS, instances);

    let next = execute(&harness, &target(pool()), NodePoolState::ScaleUpWorkerVMSS).await;

    // Surge target is 16 (double the 8 outdated instances); one tick adds
    // at most five.
    assert_eq!(next, NodePoolState::ScaleUpWorkerVMSS.into());
    assert_eq!(
        harness.azure.calls(),
        vec![
            format!("setTag {AUTOSCALER_ENABLED_TAG}=false"),
            "setCapacity 13".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_scale_up_done_moves_to_wait() {
    let harness = Harness::new();
    harness.azure.put_deployment(pool_deployment(ProvisioningState::Succeeded));
    harness.azure.put_scale_set(pool_vmss(6, &[]));
    harness.azure.put_instances(
        POOL_VMSS,
        vec![
            instance("0", "w0", false),
            instance("1", "w1", false),
            instance("2", "w2", false),
            instance("3", "w3", true),
            instance("4", "w4", true),
            instance("5", "w5", true),
        ],
    );

    let next = execute(&harness, &target(pool()), NodePoolState::ScaleUpWorkerVMSS).await;

    assert_eq!(next, NodePoolState::WaitForWorkersToBecomeReady.into());
    assert_eq!(harness.azure.mutation_count(), 0);
}

#[tokio::test]
async fn test_scale_up_restarts_when_scale_set_disappears() {
    let harness = Harness::new();
    harness.azure.put_deployment(pool_deployment(ProvisioningState::Succeeded));

    let next = execute(&harness, &target(pool()), NodePoolState::ScaleUpWorkerVMSS).await;

    assert_eq!(next, NodePoolState::DeploymentUninitialized.into());
    assert_eq!(harness.azure.mutation_count(), 0);
}

#[tokio::test]
async fn test_scale_up_holds_while_deployment_running() {
    let harness = Harness::new();
    harness.azure.put_deployment(pool_deployment(ProvisioningState::Running));
    harness.azure.put_scale_set(pool_vmss(3, &[]));

    let next = execute(&harness, &target(pool()), NodePoolState::ScaleUpWorkerVMSS).await;

    assert_eq!(next, NodePoolState::ScaleUpWorkerVMSS.into());
    assert_eq!(harness.azure.mutation_count(), 0);
}

#[tokio::test]
async fn test_wait_holds_until_fresh_worker_ready() {
    let harness = Harness::new();
    harness.workload.set_nodes(vec![
        worker_node("w0", true, &outdated_versions()),
        worker_node("w1", false, &current_versions()),
    ]);

    let next = execute(
        &harness,
        &target(pool()),
        NodePoolState::WaitForWorkersToBecomeReady,
    )
    .await;
    assert_eq!(next, NodePoolState::WaitForWorkersToBecomeReady.into());
}

#[tokio::test]
async fn test_wait_advances_on_fresh_ready_worker() {
    let harness = Harness::new();
    harness.workload.set_nodes(vec![
        worker_node("w0", true, &outdated_versions()),
        worker_node("w1", true, &current_versions()),
    ]);

    let next = execute(
        &harness,
        &target(pool()),
        NodePoolState::WaitForWorkersToBecomeReady,
    )
    .await;
    assert_eq!(next, NodePoolState::CordonOldWorkers.into());
}

#[tokio::test]
async fn test_spot_pool_skips_cordon_and_drain() {
    let harness = Harness::new();

    let next = execute(
        &harness,
        &target(spot_pool()),
        NodePoolState::WaitForWorkersToBecomeReady,
    )
    .await;

    assert_eq!(next, NodePoolState::TerminateOldWorkerInstances.into());
    assert!(harness.drainer.cordoned.lock().unwrap().is_empty());
    assert!(harness.drainer.drained.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cordon_marks_all_old_nodes() {
    let harness = Harness::new();
    harness.azure.put_scale_set(pool_vmss(3, &[]));
    harness.azure.put_instances(
        POOL_VMSS,
        vec![
            instance("0", "w0", false),
            instance("1", "w1", false),
            instance("2", "w2", true),
        ],
    );
    harness.workload.set_nodes(vec![
        worker_node("w0", true, &outdated_versions()),
        worker_node("w1", true, &outdated_versions()),
        worker_node("w2", true, &current_versions()),
    ]);

    let next = execute(&harness, &target(pool()), NodePoolState::CordonOldWorkers).await;

    assert_eq!(next, NodePoolState::DrainOldWorkerNodes.into());
    assert_eq!(
        *harness.drainer.cordoned.lock().unwrap(),
        vec!["w0".to_string(), "w1".to_string()]
    );
}

#[tokio::test]
async fn test_cordon_follows_scale_set_model_not_node_labels() {
    let harness = Harness::new();
    harness.azure.put_scale_set(pool_vmss(2, &[]));
    harness.azure.put_instances(
        POOL_VMSS,
        vec![instance("0", "w0", false), instance("1", "w1", true)],
    );
    // Node labels say the opposite of the model on both nodes; the model
    // decides, since termination will act on it too.
    harness.workload.set_nodes(vec![
        worker_node("w0", true, &current_versions()),
        worker_node("w1", true, &outdated_versions()),
    ]);

    let next = execute(&harness, &target(pool()), NodePoolState::CordonOldWorkers).await;

    assert_eq!(next, NodePoolState::DrainOldWorkerNodes.into());
    assert_eq!(
        *harness.drainer.cordoned.lock().unwrap(),
        vec!["w0".to_string()]
    );
}

#[tokio::test]
async fn test_drain_backpressure_holds() {
    let harness = Harness::new();
    harness.drainer.set_behavior(DrainBehavior::EvictionInProgress);
    harness
        .azure
        .put_instances(POOL_VMSS, vec![instance("0", "w0", false)]);
    harness
        .workload
        .set_nodes(vec![worker_node("w0", true, &outdated_versions())]);

    let next = execute(&harness, &target(pool()), NodePoolState::DrainOldWorkerNodes).await;
    assert_eq!(next, NodePoolState::DrainOldWorkerNodes.into());
}

#[tokio::test]
async fn test_drain_timeout_proceeds_to_termination() {
    let harness = Harness::new();
    harness.drainer.set_behavior(DrainBehavior::Timeout);
    harness
        .azure
        .put_instances(POOL_VMSS, vec![instance("0", "w0", false)]);
    harness
        .workload
        .set_nodes(vec![worker_node("w0", true, &outdated_versions())]);

    let next = execute(&harness, &target(pool()), NodePoolState::DrainOldWorkerNodes).await;
    assert_eq!(next, NodePoolState::TerminateOldWorkerInstances.into());
}

#[tokio::test]
async fn test_drain_success_proceeds_to_termination() {
    let harness = Harness::new();
    harness
        .azure
        .put_instances(POOL_VMSS, vec![instance("0", "w0", false)]);
    harness
        .workload
        .set_nodes(vec![worker_node("w0", true, &outdated_versions())]);

    let next = execute(&harness, &target(pool()), NodePoolState::DrainOldWorkerNodes).await;

    assert_eq!(next, NodePoolState::TerminateOldWorkerInstances.into());
    assert_eq!(*harness.drainer.drained.lock().unwrap(), vec!["w0".to_string()]);
}

#[tokio::test]
async fn test_drain_skips_current_model_nodes() {
    let harness = Harness::new();
    harness.azure.put_instances(
        POOL_VMSS,
        vec![instance("0", "w0", false), instance("1", "w1", true)],
    );
    harness.workload.set_nodes(vec![
        worker_node("w0", true, &current_versions()),
        worker_node("w1", true, &outdated_versions()),
    ]);

    let next = execute(&harness, &target(pool()), NodePoolState::DrainOldWorkerNodes).await;

    assert_eq!(next, NodePoolState::TerminateOldWorkerInstances.into());
    assert_eq!(*harness.drainer.drained.lock().unwrap(), vec!["w0".to_string()]);
}

#[tokio::test]
async fn test_terminate_deletes_old_instances_in_one_batch() {
    let harness = Harness::new();
    harness.azure.put_scale_set(pool_vmss(4, &[]));
    harness.azure.put_instances(
        POOL_VMSS,
        vec![
            instance("0", "w0", false),
            instance("1", "w1", false),
            instance("2", "w2", true),
            instance("3", "w3", true),
        ],
    );

    let next = execute(
        &harness,
        &target(pool()),
        NodePoolState::TerminateOldWorkerInstances,
    )
    .await;

    assert_eq!(next, NodePoolState::TerminateOldWorkerInstances.into());
    assert_eq!(harness.azure.calls(), vec!["deleteInstances 0,1".to_string()]);
}

#[tokio::test]
async fn test_terminate_spot_requests_eviction() {
    let harness = Harness::new();
    harness.azure.put_scale_set(pool_vmss(2, &[]));
    harness.azure.put_instances(
        POOL_VMSS,
        vec![instance("0", "w0", false), instance("1", "w1", true)],
    );

    let next = execute(
        &harness,
        &target(spot_pool()),
        NodePoolState::TerminateOldWorkerInstances,
    )
    .await;

    assert_eq!(next, NodePoolState::TerminateOldWorkerInstances.into());
    assert_eq!(harness.azure.calls(), vec!["simulateEviction 0".to_string()]);
}

#[tokio::test]
async fn test_terminate_spot_falls_back_to_delete_on_conflict() {
    let harness = Harness::new();
    *harness.azure.eviction_outcome.lock().unwrap() = Some(EvictionOutcome::Conflict);
    harness.azure.put_scale_set(pool_vmss(2, &[]));
    harness.azure.put_instances(
        POOL_VMSS,
        vec![instance("0", "w0", false), instance("1", "w1", false)],
    );

    let next = execute(
        &harness,
        &target(spot_pool()),
        NodePoolState::TerminateOldWorkerInstances,
    )
    .await;

    assert_eq!(next, NodePoolState::TerminateOldWorkerInstances.into());
    assert_eq!(
        harness.azure.calls(),
        vec![
            "simulateEviction 0".to_string(),
            "deleteInstances 0".to_string(),
            "simulateEviction 1".to_string(),
            "deleteInstances 1".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_terminate_done_restores_autoscaler_and_rests() {
    let harness = Harness::new();
    harness
        .azure
        .put_scale_set(pool_vmss(3, &[(AUTOSCALER_ENABLED_TAG, "false")]));
    harness.azure.put_instances(
        POOL_VMSS,
        vec![instance("0", "w0", true), instance("1", "w1", true)],
    );

    let next = execute(
        &harness,
        &target(pool()),
        NodePoolState::TerminateOldWorkerInstances,
    )
    .await;

    assert_eq!(next, NodePoolState::DeploymentUninitialized.into());
    assert_eq!(
        harness.azure.calls(),
        vec![format!("setTag {AUTOSCALER_ENABLED_TAG}=true")]
    );
}

#[tokio::test]
async fn test_terminate_done_leaves_untagged_scale_set_alone() {
    let harness = Harness::new();
    harness.azure.put_scale_set(pool_vmss(2, &[]));
    harness
        .azure
        .put_instances(POOL_VMSS, vec![instance("0", "w0", true)]);

    let next = execute(
        &harness,
        &target(pool()),
        NodePoolState::TerminateOldWorkerInstances,
    )
    .await;

    assert_eq!(next, NodePoolState::DeploymentUninitialized.into());
    assert_eq!(harness.azure.mutation_count(), 0);
}
