//! Provisioning and teardown of the connectivity-check topology
//!
//! Objects are created only when absent, so re-running against an existing
//! topology is a no-op.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Metadata;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::client::{ClusterApi, ClusterClients};
use super::resources::{
    new_coredns_config_map, new_daemon_set, new_deployment, new_ingress,
    new_ingress_service_placeholder, new_namespace, new_service, new_service_account,
};
use crate::config::Config;
use crate::convergence::{poll_until, WaitContext, DEFAULT_PACING};
use crate::error::{Error, Result};
use crate::models::{
    ClusterTarget, FeatureSet, Inventory, PerfNames, Service, Topology, TopologyObject,
    CLIENT2_DEPLOYMENT_NAME, CLIENT_DEPLOYMENT_NAME, COREDNS_CONFIG_MAP_NAME,
    ECHO_EXTERNAL_NODE_DEPLOYMENT_NAME, ECHO_OTHER_NODE_DEPLOYMENT_NAME,
    ECHO_SAME_NODE_DEPLOYMENT_NAME, HOST_NETNS_DEPLOYMENT_NAME, INGRESS_NAME,
};
use crate::topology::{plan, select_perf_zone};

/// `Ok(true)` when the lookup reported the object missing
fn absent<T>(lookup: Result<T>) -> Result<bool> {
    match lookup {
        Ok(_) => Ok(false),
        Err(e) if e.is_not_found() => Ok(true),
        Err(e) => Err(e),
    }
}

/// Swallow a lost create race, propagate anything else
fn created<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => {
            debug!(error = %e, "Object already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Deployment names teardown removes, covering every scenario
fn all_deployment_names() -> Vec<String> {
    let mut names: Vec<String> = [
        ECHO_SAME_NODE_DEPLOYMENT_NAME,
        ECHO_OTHER_NODE_DEPLOYMENT_NAME,
        ECHO_EXTERNAL_NODE_DEPLOYMENT_NAME,
        CLIENT_DEPLOYMENT_NAME,
        CLIENT2_DEPLOYMENT_NAME,
    ]
    .iter()
    .map(|n| n.to_string())
    .collect();
    for host_net in [false, true] {
        let perf = PerfNames::new(host_net);
        names.extend([perf.client, perf.server, perf.client_across]);
    }
    names
}

/// Creates and deletes the topology on the run's clusters
pub struct Provisioner {
    clients: ClusterClients,
    config: Config,
    features: FeatureSet,
}

impl Provisioner {
    pub fn new(clients: ClusterClients, config: Config, features: FeatureSet) -> Self {
        Self {
            clients,
            config,
            features,
        }
    }

    pub fn clients(&self) -> &ClusterClients {
        &self.clients
    }

    fn namespace(&self) -> &str {
        &self.config.test_namespace
    }

    /// Make every planned object exist, in plan order.
    ///
    /// With `force_deploy` the topology is torn down on every cluster first.
    /// Returns the executed plan.
    #[instrument(skip_all, fields(namespace = %self.config.test_namespace))]
    pub async fn deploy(&self, ctx: &WaitContext, inventory: &mut Inventory) -> Result<Topology> {
        if self.config.force_deploy {
            for client in self.clients.clients() {
                self.delete_deployments(ctx, client.as_ref()).await?;
            }
        }

        let zone = if self.config.perf {
            let nodes = ctx
                .race("node list", self.clients.src().list_nodes())
                .await?;
            let zone = select_perf_zone(&nodes);
            info!(zone = %zone, "Selected zone for perf deployments");
            if self.config.perf_host_net {
                info!("Deploying perf deployments using host networking");
            }
            zone
        } else {
            String::new()
        };

        let topology = plan(&self.config, &self.features, &zone);
        for (target, object) in &topology.steps {
            self.ensure(ctx, *target, object, inventory).await?;
        }

        info!(
            objects = topology.steps.len(),
            "Connectivity check topology deployed"
        );
        Ok(topology)
    }

    async fn ensure(
        &self,
        ctx: &WaitContext,
        target: ClusterTarget,
        object: &TopologyObject,
        inventory: &mut Inventory,
    ) -> Result<()> {
        let client = self.clients.get(target);
        let cluster = client.cluster_name();
        let ns = self.namespace();

        match object {
            TopologyObject::Namespace(name) => {
                if absent(ctx.race("namespace lookup", client.get_namespace(name)).await)? {
                    info!(cluster = %cluster, name = %name, "Creating namespace for connectivity check");
                    created(
                        ctx.race("namespace creation", client.create_namespace(&new_namespace(name)))
                            .await,
                    )?;
                }
            }
            TopologyObject::DnsConfigMap => {
                let lookup = client.get_config_map(ns, COREDNS_CONFIG_MAP_NAME);
                if absent(ctx.race("configmap lookup", lookup).await)? {
                    info!(cluster = %cluster, name = COREDNS_CONFIG_MAP_NAME, "Deploying configmap");
                    let config_map = new_coredns_config_map();
                    created(
                        ctx.race("configmap creation", client.create_config_map(ns, &config_map))
                            .await,
                    )?;
                }
            }
            TopologyObject::Service(svc) => {
                if absent(ctx.race("service lookup", client.get_service(ns, &svc.name)).await)? {
                    info!(cluster = %cluster, name = %svc.name, "Deploying service");
                    let service = new_service(svc);
                    created(ctx.race("service creation", client.create_service(ns, &service)).await)?;
                }
            }
            TopologyObject::Deployment(w) => {
                if absent(ctx.race("deployment lookup", client.get_deployment(ns, &w.name)).await)? {
                    info!(cluster = %cluster, name = %w.name, "Deploying deployment");
                    let service_account = new_service_account(&w.name);
                    created(
                        ctx.race(
                            "service account creation",
                            client.create_service_account(ns, &service_account),
                        )
                        .await,
                    )?;
                    let deployment = new_deployment(w);
                    created(
                        ctx.race("deployment creation", client.create_deployment(ns, &deployment))
                            .await,
                    )?;
                }
            }
            TopologyObject::DaemonSet(w) => {
                if absent(ctx.race("daemonset lookup", client.get_daemon_set(ns, &w.name)).await)? {
                    info!(cluster = %cluster, name = %w.name, "Deploying daemonset");
                    let daemon_set = new_daemon_set(w);
                    created(
                        ctx.race("daemonset creation", client.create_daemon_set(ns, &daemon_set))
                            .await,
                    )?;
                }
            }
            TopologyObject::Ingress => {
                if absent(ctx.race("ingress lookup", client.get_ingress(ns, INGRESS_NAME)).await)? {
                    info!(cluster = %cluster, name = INGRESS_NAME, "Deploying ingress");
                    let ingress = new_ingress();
                    created(ctx.race("ingress creation", client.create_ingress(ns, &ingress)).await)?;

                    let placeholder = Service::new(new_ingress_service_placeholder());
                    inventory
                        .ingress_services
                        .insert(placeholder.name().to_string(), placeholder);
                }
            }
        }
        Ok(())
    }

    /// Delete the topology from one cluster and wait for its namespace to go.
    ///
    /// Individual delete failures are ignored. The namespace delete is
    /// re-issued every attempt since admission guards may reject it. The wait
    /// has no deadline of its own.
    #[instrument(skip_all, fields(cluster = %client.cluster_name()))]
    pub async fn delete_deployments(&self, ctx: &WaitContext, client: &dyn ClusterApi) -> Result<()> {
        let ns = self.namespace();
        info!("Deleting connectivity check deployments");

        let deployments = all_deployment_names();
        for name in &deployments {
            let _ = ctx.race("deployment deletion", client.delete_deployment(ns, name)).await;
        }
        for name in &deployments {
            let _ = ctx
                .race("service account deletion", client.delete_service_account(ns, name))
                .await;
        }
        for name in [ECHO_SAME_NODE_DEPLOYMENT_NAME, ECHO_OTHER_NODE_DEPLOYMENT_NAME] {
            let _ = ctx.race("service deletion", client.delete_service(ns, name)).await;
        }
        let _ = ctx
            .race("daemonset deletion", client.delete_daemon_set(ns, HOST_NETNS_DEPLOYMENT_NAME))
            .await;
        let _ = ctx.race("ingress deletion", client.delete_ingress(ns, INGRESS_NAME)).await;
        let _ = ctx
            .race("configmap deletion", client.delete_config_map(ns, COREDNS_CONFIG_MAP_NAME))
            .await;
        let _ = ctx.race("namespace deletion", client.delete_namespace(ns)).await;

        match ctx.race("namespace lookup", client.get_namespace(ns)).await {
            Ok(_) => {}
            Err(e) if e.is_cancelled() || e.is_deadline_exceeded() => return Err(e),
            Err(_) => return Ok(()),
        }

        info!(namespace = %ns, "Waiting for namespace to disappear");
        poll_until(ctx, DEFAULT_PACING, &format!("namespace {} deletion", ns), move || async move {
            let _ = client.delete_namespace(ns).await;
            match client.get_namespace(ns).await {
                Ok(_) => Err(Error::NotReady(format!("namespace {} still exists", ns))),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => {
                    warn!(error = %e, "Stopped waiting for namespace deletion");
                    Ok(())
                }
            }
        })
        .await
    }
}

/// Render the planned objects as a multi-document YAML stream
pub fn render(topology: &Topology, namespace: &str) -> Result<String> {
    let mut docs = Vec::new();
    for (target, object) in &topology.steps {
        for doc in render_object(object, namespace)? {
            docs.push(format!("# cluster: {}\n{}", target, doc));
        }
    }
    Ok(docs.join("---\n"))
}

fn to_yaml<K>(mut object: K, namespace: &str) -> Result<String>
where
    K: Metadata<Ty = ObjectMeta> + Serialize,
{
    if K::KIND != "Namespace" {
        object.metadata_mut().namespace = Some(namespace.to_string());
    }
    Ok(serde_yaml::to_string(&object)?)
}

fn render_object(object: &TopologyObject, namespace: &str) -> Result<Vec<String>> {
    Ok(match object {
        TopologyObject::Namespace(name) => vec![to_yaml(new_namespace(name), namespace)?],
        TopologyObject::DnsConfigMap => vec![to_yaml(new_coredns_config_map(), namespace)?],
        TopologyObject::Service(svc) => vec![to_yaml(new_service(svc), namespace)?],
        TopologyObject::Deployment(w) => vec![
            to_yaml(new_service_account(&w.name), namespace)?,
            to_yaml(new_deployment(w), namespace)?,
        ],
        TopologyObject::DaemonSet(w) => vec![to_yaml(new_daemon_set(w), namespace)?],
        TopologyObject::Ingress => vec![to_yaml(new_ingress(), namespace)?],
    })
}
