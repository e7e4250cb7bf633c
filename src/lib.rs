//! vmss-operator library crate
//!
//! This module exports the controllers, CRD definitions, Azure clients and
//! the upgrade state machine engine.

pub mod azure;
pub mod controller;
pub mod crd;
pub mod drain;
pub mod health;
pub mod template;
pub mod workload;

pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::context::{Collaborators, Context};
use controller::{masters_reconciler, node_pool_reconciler};
use crd::{AzureCluster, AzureNodePool};

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Create the default watcher configuration for all controllers.
///
/// This ensures consistent behavior across all controllers:
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
///
/// Returns the reflector store (for cache lookups) and the stream.
fn create_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects();
    (reader, stream)
}

/// Run both controllers (cluster-wide).
pub async fn run_controllers(
    client: Client,
    collaborators: Collaborators,
    health_state: Option<Arc<HealthState>>,
) {
    run_controllers_scoped(client, collaborators, health_state, None).await
}

/// Run both controllers with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// Use the scoped version for integration tests to enable parallel test
/// execution.
pub async fn run_controllers_scoped(
    client: Client,
    collaborators: Collaborators,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }
    let ctx = Arc::new(Context::new(client.clone(), collaborators, health_state));

    futures::join!(
        run_cluster_controller(client.clone(), ctx.clone(), namespace),
        run_node_pool_controller(client, ctx, namespace),
    );
}

/// Run the AzureCluster controller.
///
/// Watches AzureCluster resources and drives the masters upgrade state
/// machine. Spec-only changes are filtered via the generation predicate;
/// the machine itself is re-entered on the requeue cadence.
async fn run_cluster_controller(client: Client, ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    info!("Starting controller for AzureCluster resources (scope: {scope_msg})");

    let clusters: Api<AzureCluster> = scoped_api(client, namespace);
    let watcher_config = default_watcher_config();

    let (reader, stream) = create_stream(clusters, watcher_config);
    // Status writes (the persisted stage) must not wake the controller, so
    // only generation changes pass; requeues handle the rest.
    let stream = stream.predicate_filter(predicates::generation);

    Controller::for_stream(stream, reader)
        .run(masters_reconciler::reconcile, masters_reconciler::error_policy, ctx)
        .for_each(log_reconcile_result)
        .await;

    error!("AzureCluster controller stream ended unexpectedly");
}

/// Run the AzureNodePool controller.
///
/// Watches AzureNodePool resources and additionally the AzureClusters they
/// reference, so pools wake up as soon as their control plane finishes an
/// upgrade.
async fn run_node_pool_controller(client: Client, ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    info!("Starting controller for AzureNodePool resources (scope: {scope_msg})");

    let pools: Api<AzureNodePool> = scoped_api(client.clone(), namespace);
    let clusters: Api<AzureCluster> = scoped_api(client, namespace);
    let watcher_config = default_watcher_config();

    let (reader, stream) = create_stream(pools, watcher_config.clone());

    // Map a cluster change to every pool that references it.
    let pool_cache = reader.clone();
    let cluster_mapper = move |cluster: AzureCluster| {
        let cluster_name = cluster.name_any();
        let cluster_namespace = cluster.namespace();
        pool_cache
            .state()
            .into_iter()
            .filter(move |pool| {
                pool.spec.cluster_name == cluster_name && pool.namespace() == cluster_namespace
            })
            .map(|pool| ObjectRef::from_obj(pool.as_ref()))
            .collect::<Vec<_>>()
    };

    Controller::for_stream(stream, reader)
        .watches(clusters, watcher_config, cluster_mapper)
        .run(
            node_pool_reconciler::reconcile,
            node_pool_reconciler::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result)
        .await;

    error!("AzureNodePool controller stream ended unexpectedly");
}

async fn log_reconcile_result<K>(
    result: Result<(ObjectRef<K>, kube::runtime::controller::Action), kube::runtime::controller::Error<controller::error::Error, watcher::Error>>,
) where
    K: kube::Resource,
    K::DynamicType: std::fmt::Debug + std::hash::Hash + Eq + Clone,
{
    match result {
        Ok((obj, _action)) => {
            debug!("Reconciled: {}", obj.name);
        }
        Err(e) => {
            // ObjectNotFound/NotFound errors are expected after deletion when
            // related watch events trigger reconciliation for a deleted
            // object. Log these at debug level instead of error.
            let is_not_found = match &e {
                kube::runtime::controller::Error::ObjectNotFound(_) => true,
                kube::runtime::controller::Error::ReconcilerFailed(err, _) => err.is_not_found(),
                _ => false,
            };
            if is_not_found {
                debug!("Object no longer exists (likely deleted): {e:?}");
            } else {
                error!("Reconciliation error: {e:?}");
            }
        }
    }
}
