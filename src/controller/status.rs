//! Persisted state bridge.
//!
//! The upgrade state machines keep no state of their own; the current state
//! lives on the watched custom resource. For AzureCluster it is the "Stage"
//! status condition, for AzureNodePool an annotation. Writes re-fetch the
//! object first and swallow optimistic-concurrency conflicts: a conflict
//! means someone else moved the object, and the next tick re-reads anyway.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::crd::{
    AzureCluster, AzureNodePool, CONDITION_STAGE, Condition, UPGRADE_STATE_ANNOTATION,
    find_condition, upsert_condition,
};

use super::context::FIELD_MANAGER;
use super::error::Error;
use super::masters::control_plane_upgrading;
use super::state_machine::State;

/// Result of a compare-and-swap style status write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The value was written.
    Updated,
    /// The persisted value already matched; no write was issued.
    Unchanged,
    /// The write hit a resource-version conflict; retry next tick.
    Conflict,
}

/// Current masters upgrade state of a cluster. Absent means uninitialized,
/// which is the initial (empty) state.
pub fn stage_of(cluster: &AzureCluster) -> State {
    cluster
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, CONDITION_STAGE))
        .map(|c| State::from(c.status.clone()))
        .unwrap_or_default()
}

/// Current upgrade state of a node pool, from its annotation.
pub fn upgrade_state_of(pool: &AzureNodePool) -> Option<State> {
    pool.annotations()
        .get(UPGRADE_STATE_ANNOTATION)
        .map(|v| State::from(v.clone()))
}

/// Writes AzureCluster status entries owned by the masters state machine.
#[async_trait]
pub trait ClusterStatusClient: Send + Sync {
    /// Persist a new stage; `Unchanged` when it already matches.
    async fn set_stage(
        &self,
        cluster: &AzureCluster,
        state: &State,
    ) -> Result<UpdateOutcome, Error>;

    /// Record the checksums of the last submitted masters deployment.
    async fn set_deployment_checksums(
        &self,
        cluster: &AzureCluster,
        template_checksum: &str,
        parameters_checksum: &str,
    ) -> Result<UpdateOutcome, Error>;
}

/// Kube-backed implementation of [`ClusterStatusClient`].
pub struct KubeClusterStatusClient {
    client: Client,
}

impl KubeClusterStatusClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, cluster: &AzureCluster) -> Api<AzureCluster> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }
}

#[async_trait]
impl ClusterStatusClient for KubeClusterStatusClient {
    async fn set_stage(
        &self,
        cluster: &AzureCluster,
        state: &State,
    ) -> Result<UpdateOutcome, Error> {
        let api = self.api_for(cluster);
        let name = cluster.name_any();

        // Re-fetch right before the write so the patch is based on the
        // freshest status.
        let fresh = api.get_status(&name).await?;
        if stage_of(&fresh) == *state {
            return Ok(UpdateOutcome::Unchanged);
        }

        let mut conditions = fresh
            .status
            .clone()
            .unwrap_or_default()
            .conditions;
        upsert_condition(&mut conditions, Condition::stage(state.as_str()));

        // Mirror the stage into boolean conditions for kubectl visibility.
        let generation = fresh.metadata.generation;
        let upgrading = control_plane_upgrading(state);
        upsert_condition(
            &mut conditions,
            Condition::upgrading(
                upgrading,
                if upgrading { "UpgradeInProgress" } else { "NoUpgradeInProgress" },
                &format!("control plane stage is {state}"),
                generation,
            ),
        );
        upsert_condition(
            &mut conditions,
            Condition::ready(
                !upgrading,
                if upgrading { "ControlPlaneUpgrading" } else { "ControlPlaneSettled" },
                &format!("control plane stage is {state}"),
                generation,
            ),
        );

        let patch = json!({ "status": { "conditions": conditions } });
        patch_status_swallowing_conflict(&api, &name, patch).await
    }

    async fn set_deployment_checksums(
        &self,
        cluster: &AzureCluster,
        template_checksum: &str,
        parameters_checksum: &str,
    ) -> Result<UpdateOutcome, Error> {
        let api = self.api_for(cluster);
        let name = cluster.name_any();

        let fresh = api.get_status(&name).await?;
        let status = fresh.status.clone().unwrap_or_default();
        if status.deployment_template_checksum.as_deref() == Some(template_checksum)
            && status.deployment_parameters_checksum.as_deref() == Some(parameters_checksum)
        {
            return Ok(UpdateOutcome::Unchanged);
        }

        let patch = json!({
            "status": {
                "deploymentTemplateChecksum": template_checksum,
                "deploymentParametersChecksum": parameters_checksum,
            }
        });
        patch_status_swallowing_conflict(&api, &name, patch).await
    }
}

async fn patch_status_swallowing_conflict(
    api: &Api<AzureCluster>,
    name: &str,
    patch: serde_json::Value,
) -> Result<UpdateOutcome, Error> {
    let params = PatchParams::apply(FIELD_MANAGER);
    match api.patch_status(name, &params, &Patch::Merge(&patch)).await {
        Ok(_) => Ok(UpdateOutcome::Updated),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(name = %name, "Status write conflicted, retrying next tick");
            Ok(UpdateOutcome::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}

/// Persist a node pool's upgrade state annotation; `Unchanged` when it
/// already matches, `Conflict` swallowed like status writes.
pub async fn set_upgrade_state(
    api: &Api<AzureNodePool>,
    pool: &AzureNodePool,
    state: &State,
) -> Result<UpdateOutcome, Error> {
    let name = pool.name_any();

    let fresh = api.get(&name).await?;
    if upgrade_state_of(&fresh).as_ref() == Some(state) {
        return Ok(UpdateOutcome::Unchanged);
    }

    let patch = json!({
        "metadata": {
            "annotations": { (UPGRADE_STATE_ANNOTATION): state.as_str() }
        }
    });
    let params = PatchParams::apply(FIELD_MANAGER);
    match api.patch(&name, &params, &Patch::Merge(&patch)).await {
        Ok(_) => Ok(UpdateOutcome::Updated),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(name = %name, "Annotation write conflicted, retrying next tick");
            Ok(UpdateOutcome::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}
