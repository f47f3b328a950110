//! Kubernetes integration for the connectivity check
//!
//! This module handles all interactions with the clusters under test:
//! - The `ClusterApi` seam and its kube-rs implementation
//! - Building the topology's objects
//! - Provisioning and tearing down the topology

mod client;
mod deployment;
pub mod resources;

pub use client::{deployment_ready, ClusterApi, ClusterClients, K8sClient};
#[cfg(test)]
pub use client::MockClusterApi;
pub use deployment::{render, Provisioner};
