//! Eviction-based drainer for workload cluster nodes.
//!
//! Drain start is anchored in an annotation on the node itself, so the
//! deadline survives operator restarts. DaemonSet pods and mirror pods are
//! never evicted; a pod disruption budget pushing back (429) is reported as
//! eviction-in-progress so the caller holds and retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{EvictParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, warn};

use crate::workload::kube::KubeWorkloadClusterFactory;

use super::{DrainError, Drainer};

/// Node annotation recording when this node's drain began.
const DRAIN_STARTED_ANNOTATION: &str = "vmss-operator.io/drain-started-at";

/// Pod annotation marking kubelet-managed mirror pods.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

const FIELD_MANAGER: &str = "vmss-operator";

/// [`Drainer`] built on the eviction API of each workload cluster.
pub struct KubeDrainer {
    clusters: Arc<KubeWorkloadClusterFactory>,
}

impl KubeDrainer {
    pub fn new(clusters: Arc<KubeWorkloadClusterFactory>) -> Self {
        Self { clusters }
    }

    async fn client(&self, cluster_id: &str) -> Result<Client, DrainError> {
        self.clusters.client(cluster_id).await.map_err(|e| DrainError::Other {
            node: String::new(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Drainer for KubeDrainer {
    async fn cordon(&self, cluster_id: &str, node: &str) -> Result<(), DrainError> {
        let client = self.client(cluster_id).await?;
        let nodes: Api<Node> = Api::all(client);
        let patch = json!({ "spec": { "unschedulable": true } });
        nodes
            .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| DrainError::Other {
                node: node.to_string(),
                message: format!("cordon: {e}"),
            })?;
        debug!(%node, "Node cordoned");
        Ok(())
    }

    async fn drain(
        &self,
        cluster_id: &str,
        node: &str,
        timeout: Duration,
    ) -> Result<(), DrainError> {
        let client = self.client(cluster_id).await?;
        let started_at = ensure_drain_anchor(&client, node).await?;

        let pods = evictable_pods(&client, node).await?;
        if pods.is_empty() {
            debug!(%node, "Node drained");
            return Ok(());
        }

        let elapsed = Timestamp::now().as_second() - started_at.as_second();
        if elapsed >= 0 && elapsed as u64 >= timeout.as_secs() {
            warn!(%node, pods = pods.len(), "Drain deadline elapsed with pods remaining");
            return Err(DrainError::DrainTimeout {
                node: node.to_string(),
            });
        }

        for pod in &pods {
            let name = pod.name_any();
            let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
            let namespaced: Api<Pod> = Api::namespaced(client.clone(), &namespace);
            match namespaced.evict(&name, &EvictParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 429 => {
                    debug!(%node, pod = %name, "Eviction blocked by disruption budget");
                }
                Err(e) => {
                    return Err(DrainError::Other {
                        node: node.to_string(),
                        message: format!("evict {namespace}/{name}: {e}"),
                    });
                }
            }
        }

        Err(DrainError::EvictionInProgress {
            node: node.to_string(),
        })
    }
}

/// Read or set the drain-started annotation, returning the anchor time.
async fn ensure_drain_anchor(client: &Client, node: &str) -> Result<Timestamp, DrainError> {
    let nodes: Api<Node> = Api::all(client.clone());
    let current = nodes.get(node).await.map_err(|e| DrainError::Other {
        node: node.to_string(),
        message: format!("get node: {e}"),
    })?;

    if let Some(raw) = current.annotations().get(DRAIN_STARTED_ANNOTATION) {
        if let Ok(ts) = raw.parse::<Timestamp>() {
            return Ok(ts);
        }
        warn!(%node, value = %raw, "Unparseable drain anchor, resetting");
    }

    let now = Timestamp::now();
    let patch = json!({
        "metadata": {
            "annotations": { (DRAIN_STARTED_ANNOTATION): now.to_string() }
        }
    });
    nodes
        .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(|e| DrainError::Other {
            node: node.to_string(),
            message: format!("set drain anchor: {e}"),
        })?;
    Ok(now)
}

/// Pods on a node that eviction should remove. DaemonSet pods, mirror pods
/// and already-finished pods are skipped.
async fn evictable_pods(client: &Client, node: &str) -> Result<Vec<Pod>, DrainError> {
    let pods: Api<Pod> = Api::all(client.clone());
    let list = pods
        .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
        .await
        .map_err(|e| DrainError::Other {
            node: node.to_string(),
            message: format!("list pods: {e}"),
        })?;

    Ok(list
        .items
        .into_iter()
        .filter(|pod| !skip_pod(pod))
        .collect())
}

fn skip_pod(pod: &Pod) -> bool {
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        return true;
    }
    let daemonset_owned = pod
        .owner_references()
        .iter()
        .any(|o| o.kind == "DaemonSet");
    if daemonset_owned {
        return true;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Succeeded" || p == "Failed")
}
