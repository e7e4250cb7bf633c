//! Desired ARM deployments and parameter diffing.
//!
//! Template rendering is a collaborator: the controllers only require "the
//! desired Deployment object" and "the list of changed parameter names".
//! The diff is an explicit parameter-by-parameter comparison (not a blind
//! hash) so a scaling-only change can be distinguished from a change that
//! requires a full node roll.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::azure::types::{Deployment, ScaleSet};
use crate::controller::error::Error;
use crate::crd::{AzureCluster, AzureNodePool};

/// Parameter carrying the desired instance count. A change to this parameter
/// alone is a pure scale operation and must not trigger a rolling upgrade.
pub const PARAM_SCALING: &str = "scaling";

/// Parameters whose change requires rolling every node of the pool.
pub const ROLLING_PARAMETERS: &[&str] = &[
    "vmSize",
    "osImageVersion",
    "subnetName",
    "acceleratedNetworking",
    "spotInstances",
    "releaseVersion",
];

/// All tracked parameters: rolling ones plus scaling.
pub fn tracked_parameters() -> impl Iterator<Item = &'static str> {
    ROLLING_PARAMETERS.iter().copied().chain([PARAM_SCALING])
}

/// A deployment as the operator wants it: template plus named parameters.
#[derive(Clone, Debug, Default)]
pub struct DesiredDeployment {
    pub template: Value,
    pub parameters: BTreeMap<String, Value>,
}

impl DesiredDeployment {
    /// Content checksum of the template, for drift detection.
    pub fn template_checksum(&self) -> String {
        checksum(&self.template)
    }

    /// Content checksum of the parameters, for drift detection.
    pub fn parameters_checksum(&self) -> String {
        checksum(&json!(self.parameters))
    }
}

fn checksum(value: &Value) -> String {
    // serde_json serializes map keys in order (BTreeMap / preserve_order off),
    // so the digest is stable across processes.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)
}

/// Names of tracked parameters whose applied value differs from the desired
/// one. A parameter absent on either side counts as changed.
pub fn diff(current: &Deployment, desired: &DesiredDeployment) -> Vec<String> {
    tracked_parameters()
        .filter(|name| current.parameters.get(*name) != desired.parameters.get(*name))
        .map(str::to_string)
        .collect()
}

/// Whether a diff describes a scaling-only change.
pub fn is_scaling_only(changed: &[String]) -> bool {
    changed.len() == 1 && changed[0] == PARAM_SCALING
}

/// Renders desired deployments from custom resource specs.
///
/// A masters deployment may legitimately not be renderable yet (bootstrap
/// blob or encryption secret still missing); that surfaces as
/// `Error::NotReady` and holds the state machine without erroring.
#[async_trait]
pub trait DeploymentBuilder: Send + Sync {
    async fn masters_deployment(&self, cluster: &AzureCluster) -> Result<DesiredDeployment, Error>;

    /// `existing` is the pool's current scale set, when it already exists;
    /// its accelerated-networking setting is reused so an unset spec field
    /// never flips the capability on a live pool.
    async fn node_pool_deployment(
        &self,
        pool: &AzureNodePool,
        existing: Option<&ScaleSet>,
    ) -> Result<DesiredDeployment, Error>;
}

/// Deployment builder deriving parameters directly from the CRD specs.
///
/// The ARM template bodies themselves are owned by the release engineering
/// pipeline and addressed by checksum; this builder pins them through the
/// release version parameter.
pub struct SpecDeploymentBuilder;

#[async_trait]
impl DeploymentBuilder for SpecDeploymentBuilder {
    async fn masters_deployment(&self, cluster: &AzureCluster) -> Result<DesiredDeployment, Error> {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "vmSize".to_string(),
            json!(cluster.spec.control_plane.vm_size),
        );
        parameters.insert(
            "replicas".to_string(),
            json!(cluster.spec.control_plane.replicas),
        );
        parameters.insert(
            "availabilityZones".to_string(),
            json!(cluster.spec.control_plane.availability_zones),
        );
        parameters.insert(
            "releaseVersion".to_string(),
            json!(cluster.spec.release.version),
        );
        if let Some(sa) = &cluster.spec.control_plane.storage_account_type {
            parameters.insert("storageAccountType".to_string(), json!(sa));
        }

        Ok(DesiredDeployment {
            template: masters_template(&cluster.spec.location),
            parameters,
        })
    }

    async fn node_pool_deployment(
        &self,
        pool: &AzureNodePool,
        existing: Option<&ScaleSet>,
    ) -> Result<DesiredDeployment, Error> {
        let accelerated = pool
            .spec
            .accelerated_networking
            .or_else(|| existing.and_then(|s| s.accelerated_networking))
            .unwrap_or(false);

        let mut parameters = BTreeMap::new();
        parameters.insert("vmSize".to_string(), json!(pool.spec.vm_size));
        parameters.insert("subnetName".to_string(), json!(pool.spec.subnet));
        parameters.insert(
            "osImageVersion".to_string(),
            json!(pool.spec.os_image.version),
        );
        parameters.insert(
            "releaseVersion".to_string(),
            json!(pool.spec.release.version),
        );
        parameters.insert("acceleratedNetworking".to_string(), json!(accelerated));
        parameters.insert(
            PARAM_SCALING.to_string(),
            json!({ "min": pool.spec.scaling.min, "max": pool.spec.scaling.max }),
        );
        if let Some(spot) = &pool.spec.spot {
            parameters.insert(
                "spotInstances".to_string(),
                json!({
                    "enabled": true,
                    "maxPrice": spot.max_price,
                    "evictionPolicy": spot.eviction_policy,
                }),
            );
        }

        Ok(DesiredDeployment {
            template: node_pool_template(),
            parameters,
        })
    }
}

fn masters_template(location: &str) -> Value {
    json!({
        "kind": "masters",
        "location": location,
    })
}

fn node_pool_template() -> Value {
    json!({
        "kind": "nodepool",
    })
}
