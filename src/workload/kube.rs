//! Kube-backed workload cluster access.
//!
//! Each workload cluster's kubeconfig lives in a Secret named
//! `<cluster>-kubeconfig` in the operator's namespace. Clients are built
//! lazily and cached per cluster; an unreachable API server surfaces as
//! `ApiNotAvailable` so the state machines hold instead of failing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tokio::sync::Mutex;
use tracing::debug;

use super::{WorkloadCluster, WorkloadClusterFactory, WorkloadError, WorkloadNode};

/// Key inside the kubeconfig Secret holding the serialized kubeconfig.
const KUBECONFIG_SECRET_KEY: &str = "value";

/// Builds and caches workload cluster clients from kubeconfig Secrets.
pub struct KubeWorkloadClusterFactory {
    management: Client,
    namespace: String,
    cache: Mutex<HashMap<String, Client>>,
}

impl KubeWorkloadClusterFactory {
    /// `management` is the client for the management cluster the operator
    /// runs in; `namespace` is where the kubeconfig Secrets live.
    pub fn new(management: Client, namespace: impl Into<String>) -> Self {
        Self {
            management,
            namespace: namespace.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A client for one workload cluster's API server.
    pub async fn client(&self, cluster_id: &str) -> Result<Client, WorkloadError> {
        let mut cache = self.cache.lock().await;
        if let Some(client) = cache.get(cluster_id) {
            return Ok(client.clone());
        }

        debug!(cluster = %cluster_id, "Building workload cluster client");
        let secrets: Api<Secret> = Api::namespaced(self.management.clone(), &self.namespace);
        let secret_name = format!("{cluster_id}-kubeconfig");
        let secret = secrets
            .get(&secret_name)
            .await
            .map_err(|e| WorkloadError::ApiNotAvailable(format!("kubeconfig secret: {e}")))?;

        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .map(|b| b.0.clone())
            .ok_or_else(|| {
                WorkloadError::Other(format!(
                    "secret {secret_name} has no '{KUBECONFIG_SECRET_KEY}' key"
                ))
            })?;
        let yaml = String::from_utf8(raw)
            .map_err(|e| WorkloadError::Other(format!("kubeconfig is not UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| WorkloadError::Other(format!("kubeconfig parse: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| WorkloadError::Other(format!("kubeconfig load: {e}")))?;
        let client = Client::try_from(config)
            .map_err(|e| WorkloadError::Other(format!("client build: {e}")))?;

        cache.insert(cluster_id.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl WorkloadClusterFactory for KubeWorkloadClusterFactory {
    async fn workload_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Arc<dyn WorkloadCluster>, WorkloadError> {
        let client = self.client(cluster_id).await?;
        Ok(Arc::new(KubeWorkloadCluster { client }))
    }
}

/// Node view over one workload cluster.
pub struct KubeWorkloadCluster {
    client: Client,
}

#[async_trait]
impl WorkloadCluster for KubeWorkloadCluster {
    async fn nodes(&self, label_selector: &str) -> Result<Vec<WorkloadNode>, WorkloadError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref err) if err.code < 500 => {
                    WorkloadError::Other(e.to_string())
                }
                _ => WorkloadError::ApiNotAvailable(e.to_string()),
            })?;
        Ok(list.items.iter().map(reduce_node).collect())
    }
}

fn reduce_node(node: &Node) -> WorkloadNode {
    let name = node
        .metadata
        .name
        .clone()
        .unwrap_or_default();
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    let labels = node
        .metadata
        .labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    WorkloadNode { name, ready, labels }
}
