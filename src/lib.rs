//! Connectivity check library
//!
//! Provisions a known workload topology in one or two Kubernetes clusters and
//! waits until the CNI data plane delivers the connectivity it exercises.

pub mod config;
pub mod convergence;
pub mod error;
pub mod k8s;
pub mod models;
pub mod topology;

use tracing::{info, instrument};

use crate::config::Config;
use crate::convergence::{Validator, WaitContext};
use crate::error::Result;
use crate::k8s::{ClusterClients, Provisioner};
use crate::models::{FeatureSet, Inventory};

/// Provision the topology, validate it and tear it down when configured to.
///
/// Returns the populated inventory.
#[instrument(skip_all)]
pub async fn run(
    ctx: &WaitContext,
    clients: ClusterClients,
    config: Config,
    features: FeatureSet,
) -> Result<Inventory> {
    let mut inventory = Inventory::new();
    info!(run_id = %inventory.run_id, "Starting connectivity check");

    let provisioner = Provisioner::new(clients.clone(), config.clone(), features.clone());
    provisioner.deploy(ctx, &mut inventory).await?;

    Validator::new(&clients, &config, &features)
        .validate(ctx, &mut inventory)
        .await?;

    info!(
        client_pods = inventory.client_pods.len(),
        echo_pods = inventory.echo_pods.len(),
        echo_services = inventory.echo_services.len(),
        agent_pods = inventory.agent_pods.len(),
        "Connectivity check topology is ready"
    );

    if config.teardown {
        for client in clients.clients() {
            provisioner.delete_deployments(ctx, client.as_ref()).await?;
        }
    }

    Ok(inventory)
}
