//! Discovery pass: wait for the provisioned topology and record it

use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::checks::{
    wait_for_cilium_endpoint, wait_for_deployments, wait_for_ipcache, wait_for_node_ports,
    wait_for_pod_dns, wait_for_service, wait_for_service_dns,
};
use super::wait::WaitContext;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::k8s::{ClusterApi, ClusterClients};
use crate::models::{
    name_selector, ExternalWorkload, Feature, FeatureSet, Inventory, Pod, Service, WorkloadKind,
    ECHO_EXTERNAL_NODE_DEPLOYMENT_NAME, ECHO_OTHER_NODE_DEPLOYMENT_NAME,
    ECHO_SAME_NODE_DEPLOYMENT_NAME, ECHO_SERVER_PORT, PERF_SERVER_PORT,
};
use crate::topology;

const INGRESS_SERVICE_SELECTOR: &str = "cilium.io/ingress=true";

/// Waits for every provisioned workload and network property, populating
/// the [`Inventory`] on the way
pub struct Validator<'a> {
    clients: &'a ClusterClients,
    config: &'a Config,
    features: &'a FeatureSet,
}

impl<'a> Validator<'a> {
    pub fn new(clients: &'a ClusterClients, config: &'a Config, features: &'a FeatureSet) -> Self {
        Self {
            clients,
            config,
            features,
        }
    }

    fn namespace(&self) -> &str {
        &self.config.test_namespace
    }

    /// Run the discovery pass. Steps run sequentially, source cluster first.
    #[instrument(skip_all, fields(run_id = %inventory.run_id))]
    pub async fn validate(&self, ctx: &WaitContext, inventory: &mut Inventory) -> Result<()> {
        info!("Validating deployments");

        self.discover_agent_pods(ctx, inventory).await?;

        let plan = topology::plan(self.config, self.features, "");
        if !plan.src_deployments.is_empty() {
            wait_for_deployments(
                ctx,
                self.clients.src().as_ref(),
                self.namespace(),
                &plan.src_deployments,
                self.config.pod_ready_timeout(),
            )
            .await?;
        }
        if !plan.dst_deployments.is_empty() {
            wait_for_deployments(
                ctx,
                self.clients.dst().as_ref(),
                self.namespace(),
                &plan.dst_deployments,
                self.config.pod_ready_timeout(),
            )
            .await?;
        }

        if self.config.perf {
            return self.discover_perf_pods(ctx, inventory).await;
        }

        self.discover_client_pods(ctx, inventory).await?;

        let same_node = self
            .single_echo_pod(
                ctx,
                self.clients.src(),
                ECHO_SAME_NODE_DEPLOYMENT_NAME,
                "same node pods",
            )
            .await?;
        let dns_ctx = ctx.with_timeout(self.config.ipcache_timeout());
        for client in inventory.client_pods.values() {
            wait_for_pod_dns(&dns_ctx, client, &same_node).await?;
        }

        if self.config.spans_nodes() {
            let other_node = self
                .single_echo_pod(
                    ctx,
                    self.clients.dst(),
                    ECHO_OTHER_NODE_DEPLOYMENT_NAME,
                    "other node pods",
                )
                .await?;
            let dns_ctx = ctx.with_timeout(self.config.ipcache_timeout());
            for client in inventory.client_pods.values() {
                wait_for_pod_dns(&dns_ctx, client, &other_node).await?;
            }
        }

        if self.features.enabled(Feature::NodeWithoutCilium) {
            let dst = self.clients.dst();
            let selector = name_selector(ECHO_EXTERNAL_NODE_DEPLOYMENT_NAME);
            for pod in ctx
                .race("external echo pod list", dst.list_pods(self.namespace(), &selector))
                .await?
            {
                let pod = Pod::new(dst.clone(), pod).with_endpoint("http", ECHO_SERVER_PORT as u16);
                inventory.echo_external_pods.insert(pod.name().to_string(), pod);
            }
        }

        let dns_ctx = ctx.with_timeout(self.config.ipcache_timeout());
        for client in inventory.client_pods.values() {
            wait_for_service_dns(&dns_ctx, client).await?;
        }

        self.discover_echo_pods(ctx, inventory).await?;
        self.discover_echo_services(ctx, inventory).await?;

        for service in inventory.echo_services.values() {
            wait_for_service(ctx, inventory, service, self.config.service_ready_timeout()).await?;
        }

        if self.features.enabled(Feature::IngressController) {
            let src = self.clients.src();
            for service in ctx
                .race(
                    "ingress service list",
                    src.list_services(self.namespace(), INGRESS_SERVICE_SELECTOR),
                )
                .await?
            {
                let service = Service::new(service);
                inventory
                    .ingress_services
                    .insert(service.name().to_string(), service);
            }
        }

        if !self.config.is_multi_cluster() {
            for agent in inventory.agent_pods.values() {
                let Some(host_ip) = agent.host_ip() else {
                    warn!(agent = %agent, "Agent pod has no host IP, skipping its node ports");
                    continue;
                };
                for service in inventory.echo_services.values() {
                    wait_for_node_ports(
                        ctx,
                        inventory,
                        host_ip,
                        service,
                        self.config.service_ready_timeout(),
                    )
                    .await?;
                }
            }
        }

        let dst = self.clients.dst();
        let selector = WorkloadKind::HostNetNs.selector();
        for pod in ctx
            .race("host-netns pod list", dst.list_pods(self.namespace(), &selector))
            .await?
        {
            let pod = Pod::new(dst.clone(), pod);
            let node = pod.node_name().unwrap_or_default().to_string();
            inventory.host_netns_pods.insert(node, pod);
        }

        self.discover_external_workloads(ctx, inventory).await?;

        if self.config.skip_ipcache_check {
            info!("Skipping IPCache check");
        } else {
            let ipcache_ctx = ctx.with_timeout(self.config.ipcache_timeout());
            for agent in inventory.agent_pods.values() {
                wait_for_ipcache(&ipcache_ctx, agent, &self.config.agent_container, inventory)
                    .await?;
            }
        }

        Ok(())
    }

    async fn discover_agent_pods(&self, ctx: &WaitContext, inventory: &mut Inventory) -> Result<()> {
        for client in self.clients.clients() {
            let pods = ctx
                .race(
                    "agent pod list",
                    client.list_pods(&self.config.agent_namespace, &self.config.agent_selector),
                )
                .await?;
            if pods.is_empty() {
                warn!(
                    cluster = %client.cluster_name(),
                    selector = %self.config.agent_selector,
                    "No agent pods found"
                );
            }
            for pod in pods {
                let pod = Pod::new(client.clone(), pod);
                inventory.agent_pods.insert(pod.name().to_string(), pod);
            }
        }
        Ok(())
    }

    async fn discover_perf_pods(&self, ctx: &WaitContext, inventory: &mut Inventory) -> Result<()> {
        let src = self.clients.src();
        let selector = WorkloadKind::Perf.selector();
        let pods = ctx
            .race("perf pod list", src.list_pods(self.namespace(), &selector))
            .await?;

        for pod in pods {
            let pod = Pod::new(src.clone(), pod);
            // Leftovers of the other networking variant share the namespace
            if pod.host_network() != self.config.perf_host_net {
                continue;
            }
            // Host-network pods get no endpoint of their own
            if !self.config.perf_host_net {
                wait_for_cilium_endpoint(
                    ctx,
                    src.as_ref(),
                    self.namespace(),
                    pod.name(),
                    self.config.cilium_endpoint_timeout(),
                )
                .await?;
            }
            if pod.label("server").is_some() {
                let pod = pod.with_port(PERF_SERVER_PORT);
                inventory.perf_server_pods.insert(pod.name().to_string(), pod);
            } else {
                inventory.perf_client_pods.insert(pod.name().to_string(), pod);
            }
        }
        Ok(())
    }

    async fn discover_client_pods(&self, ctx: &WaitContext, inventory: &mut Inventory) -> Result<()> {
        let src = self.clients.src();
        let selector = WorkloadKind::Client.selector();
        for pod in ctx
            .race("client pod list", src.list_pods(self.namespace(), &selector))
            .await?
        {
            let pod = Pod::new(src.clone(), pod);
            wait_for_cilium_endpoint(
                ctx,
                src.as_ref(),
                self.namespace(),
                pod.name(),
                self.config.cilium_endpoint_timeout(),
            )
            .await?;
            inventory.client_pods.insert(pod.name().to_string(), pod);
        }
        Ok(())
    }

    async fn single_echo_pod(
        &self,
        ctx: &WaitContext,
        client: &Arc<dyn ClusterApi>,
        deployment: &str,
        what: &str,
    ) -> Result<Pod> {
        let selector = name_selector(deployment);
        let mut pods = ctx
            .race(what, client.list_pods(self.namespace(), &selector))
            .await?;
        if pods.len() != 1 {
            return Err(Error::UnexpectedCount {
                what: what.to_string(),
                count: pods.len(),
            });
        }
        let pod = pods.remove(0);
        Ok(Pod::new(client.clone(), pod))
    }

    async fn discover_echo_pods(&self, ctx: &WaitContext, inventory: &mut Inventory) -> Result<()> {
        let selector = WorkloadKind::Echo.selector();
        for client in self.clients.clients() {
            for pod in ctx
                .race("echo pod list", client.list_pods(self.namespace(), &selector))
                .await?
            {
                let pod = Pod::new(client.clone(), pod).with_endpoint("http", ECHO_SERVER_PORT as u16);
                wait_for_cilium_endpoint(
                    ctx,
                    client.as_ref(),
                    self.namespace(),
                    pod.name(),
                    self.config.cilium_endpoint_timeout(),
                )
                .await?;
                inventory.echo_pods.insert(pod.name().to_string(), pod);
            }
        }
        Ok(())
    }

    async fn discover_echo_services(&self, ctx: &WaitContext, inventory: &mut Inventory) -> Result<()> {
        let selector = WorkloadKind::Echo.selector();
        for client in self.clients.clients() {
            for service in ctx
                .race("echo service list", client.list_services(self.namespace(), &selector))
                .await?
            {
                let service = Service::new(service);
                // Keep the source cluster's copy of a global service so its
                // ClusterIP stays valid for the client pods
                if self.config.is_multi_cluster()
                    && inventory.echo_services.contains_key(service.name())
                {
                    continue;
                }
                inventory
                    .echo_services
                    .insert(service.name().to_string(), service);
            }
        }
        Ok(())
    }

    async fn discover_external_workloads(
        &self,
        ctx: &WaitContext,
        inventory: &mut Inventory,
    ) -> Result<()> {
        let mut crd_missing_logged = false;
        for client in self.clients.clients() {
            match ctx
                .race("external workload list", client.list_cilium_external_workloads())
                .await
            {
                Ok(workloads) => {
                    for workload in workloads {
                        let workload = ExternalWorkload { workload };
                        inventory
                            .external_workloads
                            .insert(workload.name().to_string(), workload);
                    }
                }
                Err(e) if e.is_not_found() => {
                    if !crd_missing_logged {
                        info!("ciliumexternalworkloads.cilium.io is not defined, disabling external workload tests");
                        crd_missing_logged = true;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
