//! Azure management API client interfaces.
//!
//! The controllers only require "get me a client scoped to cluster X that
//! lets me CRUD deployments and scale sets"; credential lookup, token
//! caching and retry live behind these traits. The factory must be safe to
//! call every tick.

use std::sync::Arc;

use async_trait::async_trait;

use crate::controller::error::Error;
use crate::template::DesiredDeployment;

use super::types::{Deployment, EvictionOutcome, ResourceScope, ScaleSet, ScaleSetInstance};

/// CRUD on ARM deployments within one resource group.
#[async_trait]
pub trait DeploymentsClient: Send + Sync {
    /// Fetch a deployment; `None` when it does not exist.
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<Deployment>, Error>;

    /// Submit (create or update) a deployment.
    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        desired: &DesiredDeployment,
    ) -> Result<(), Error>;
}

/// Operations on VM scale sets and their instances.
#[async_trait]
pub trait ScaleSetsClient: Send + Sync {
    /// Fetch a scale set; `None` when it does not exist.
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<ScaleSet>, Error>;

    /// List every VM instance of a scale set.
    async fn list_instances(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<Vec<ScaleSetInstance>, Error>;

    /// Apply the scale set's latest model to the given instances.
    async fn update_instances(
        &self,
        resource_group: &str,
        name: &str,
        instance_ids: &[String],
    ) -> Result<(), Error>;

    /// Reimage one instance (wipes and re-provisions it from the current
    /// model).
    async fn reimage_instance(
        &self,
        resource_group: &str,
        name: &str,
        instance_id: &str,
    ) -> Result<(), Error>;

    /// Batch-delete instances from the scale set.
    async fn delete_instances(
        &self,
        resource_group: &str,
        name: &str,
        instance_ids: &[String],
    ) -> Result<(), Error>;

    /// Request a simulated spot eviction for one instance.
    async fn simulate_eviction(
        &self,
        resource_group: &str,
        name: &str,
        instance_id: &str,
    ) -> Result<EvictionOutcome, Error>;

    /// Set the scale set's capacity (sku.capacity).
    async fn set_capacity(
        &self,
        resource_group: &str,
        name: &str,
        capacity: i64,
    ) -> Result<(), Error>;

    /// Set one tag on the scale set, preserving the others.
    async fn set_tag(
        &self,
        resource_group: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;
}

/// Produces Azure clients scoped to the credentials of one cluster.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn deployments(&self, scope: &ResourceScope) -> Result<Arc<dyn DeploymentsClient>, Error>;

    async fn scale_sets(&self, scope: &ResourceScope) -> Result<Arc<dyn ScaleSetsClient>, Error>;
}
