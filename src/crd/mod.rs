//! Custom Resource Definitions for vmss-operator.
//!
//! - `AzureCluster`: control plane (masters) of one workload cluster
//! - `AzureNodePool`: one worker node pool of a workload cluster

mod azure_cluster;
mod azure_node_pool;

pub use azure_cluster::*;
pub use azure_node_pool::*;
