//! Shared context for the controllers.
//!
//! The Context struct holds shared state that is passed to both reconcilers:
//! the Kubernetes client, event recorder identity, the collaborator handles
//! the state machines act through, and the health state.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::azure::clients::ClientFactory;
use crate::drain::Drainer;
use crate::health::HealthState;
use crate::template::DeploymentBuilder;
use crate::workload::WorkloadClusterFactory;

use super::status::ClusterStatusClient;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "vmss-operator";

/// External systems the state machine handlers act through. Everything here
/// is a trait object so handlers run against mocks in tests.
#[derive(Clone)]
pub struct Collaborators {
    /// Azure ARM clients, scoped per cluster.
    pub azure: Arc<dyn ClientFactory>,
    /// Access to workload cluster node APIs.
    pub workload: Arc<dyn WorkloadClusterFactory>,
    /// Cordon and drain of workload nodes.
    pub drainer: Arc<dyn Drainer>,
    /// Renders desired ARM deployments from specs.
    pub builder: Arc<dyn DeploymentBuilder>,
    /// Writes AzureCluster status entries owned by the masters machine.
    pub cluster_status: Arc<dyn ClusterStatusClient>,
}

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Collaborator handles used by the state machines
    pub collaborators: Collaborators,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        collaborators: Collaborators,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            collaborators,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
        }
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let recorder = self.recorder();
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let recorder = self.recorder();
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish warning event");
        }
    }
}
