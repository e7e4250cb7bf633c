//! Controller module for vmss-operator.
//!
//! Contains the reconciliation loops, the upgrade state machine engine,
//! error handling and status management.
//!
//! This module supports two controllers:
//! - AzureCluster controller (masters_* modules): masters deployment and
//!   one-at-a-time master instance rolls
//! - AzureNodePool controller (node_pool_* modules): surge-based worker
//!   pool rolls

// Shared modules
pub mod context;
pub mod error;
pub mod scale;
pub mod state_machine;
pub mod status;

// AzureCluster controller
pub mod masters;
pub mod masters_reconciler;

// AzureNodePool controller
pub mod node_pool;
pub mod node_pool_reconciler;
