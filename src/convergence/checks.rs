//! Readiness and connectivity checks
//!
//! Every check is a thin probe driven by [`poll_until`].

use std::time::Duration;
use tracing::{debug, info, instrument};

use super::ipcache::IpCache;
use super::wait::{poll_until, WaitContext, CILIUM_ENDPOINT_PACING, DEFAULT_PACING};
use crate::error::{Error, Result};
use crate::k8s::ClusterApi;
use crate::models::{Inventory, IpFamily, Pod, Service};

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Wait for each deployment in turn, all under one `timeout`
#[instrument(skip_all, fields(cluster = %client.cluster_name()))]
pub async fn wait_for_deployments(
    ctx: &WaitContext,
    client: &dyn ClusterApi,
    namespace: &str,
    deployments: &[String],
    timeout: Duration,
) -> Result<()> {
    info!(?deployments, "Waiting for deployments to become ready");
    let ctx = ctx.with_timeout(timeout);
    for name in deployments {
        let name = name.as_str();
        poll_until(&ctx, DEFAULT_PACING, &format!("deployment {}", name), move || {
            client.check_deployment_status(namespace, name)
        })
        .await?;
    }
    Ok(())
}

/// Wait for the agent to create the CiliumEndpoint of a pod
pub async fn wait_for_cilium_endpoint(
    ctx: &WaitContext,
    client: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    info!(
        cluster = %client.cluster_name(),
        pod = %format!("{}/{}", namespace, name),
        "Waiting for CiliumEndpoint to appear"
    );
    let ctx = ctx.with_timeout(timeout);
    poll_until(
        &ctx,
        CILIUM_ENDPOINT_PACING,
        &format!("CiliumEndpoint for pod {}", name),
        move || async move {
            client.get_cilium_endpoint(namespace, name).await.map(|_| ())
        },
    )
    .await
}

/// Wait until `src` can resolve `localhost` against the DNS test server
/// sidecar running in `dst`
pub async fn wait_for_pod_dns(ctx: &WaitContext, src: &Pod, dst: &Pod) -> Result<()> {
    info!(
        cluster = %src.client.cluster_name(),
        src = %src,
        dst = %dst,
        "Waiting for pod to reach DNS server on pod"
    );
    let command = argv(&["nslookup", "localhost", &dst.address(IpFamily::Any)]);
    poll_until(
        ctx,
        DEFAULT_PACING,
        &format!("lookup for localhost from pod {} to server on pod {}", src, dst),
        move || {
            src.client
                .exec_in_pod(src.namespace(), src.name(), "", command.clone())
        },
    )
    .await
    .map(|_| ())
}

/// Wait until cluster DNS answers for the `default/kubernetes` service
pub async fn wait_for_service_dns(ctx: &WaitContext, pod: &Pod) -> Result<()> {
    info!(
        cluster = %pod.client.cluster_name(),
        pod = %pod,
        "Waiting for pod to reach default/kubernetes service"
    );
    let command = argv(&["nslookup", "kubernetes.default"]);
    poll_until(
        ctx,
        DEFAULT_PACING,
        &format!("lookup for kubernetes.default from pod {}", pod),
        move || {
            pod.client
                .exec_in_pod(pod.namespace(), pod.name(), "", command.clone())
        },
    )
    .await
    .map(|_| ())
}

/// Check `nslookup` output against the address the service should resolve to.
///
/// Services without an expected address pass unverified.
pub fn verify_service_lookup(service: &Service, output: &str) -> Result<()> {
    let expected = service.expected_address();
    if expected.is_empty() {
        return Ok(());
    }
    let output = output.replace("\r\n", "\n");
    if output.contains(&format!("Address: {}\n", expected)) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Service IP {:?} not found in nslookup output {:?}",
            expected, output
        )))
    }
}

/// Wait until a client pod resolves the service to its expected address
pub async fn wait_for_service(
    ctx: &WaitContext,
    inventory: &Inventory,
    service: &Service,
    timeout: Duration,
) -> Result<()> {
    let pod = inventory.random_client_pod().ok_or(Error::NoClientPod)?;
    info!(
        cluster = %pod.client.cluster_name(),
        service = service.name(),
        "Waiting for Service to become ready"
    );

    let ctx = ctx.with_timeout(timeout);
    let container = pod.label("name").unwrap_or_default();
    let command = argv(&["nslookup", service.name()]);
    poll_until(
        &ctx,
        DEFAULT_PACING,
        &format!("service {}", service.name()),
        move || {
            let command = command.clone();
            async move {
                let output = pod
                    .client
                    .exec_in_pod(pod.namespace(), pod.name(), container, command)
                    .await?;
                verify_service_lookup(service, &output)
            }
        },
    )
    .await
}

/// Wait until every allocated node port of the service answers on `node_ip`
pub async fn wait_for_node_ports(
    ctx: &WaitContext,
    inventory: &Inventory,
    node_ip: &str,
    service: &Service,
    timeout: Duration,
) -> Result<()> {
    let pod = inventory.random_client_pod().ok_or(Error::NoClientPod)?;
    let ctx = ctx.with_timeout(timeout);
    let container = pod.label("name").unwrap_or_default();

    for node_port in service.node_ports() {
        info!(
            cluster = %pod.client.cluster_name(),
            service = service.name(),
            "Waiting for NodePort {}:{} to become ready",
            node_ip,
            node_port
        );
        let command = argv(&["nc", "-w", "3", "-z", node_ip, &node_port.to_string()]);
        poll_until(
            &ctx,
            DEFAULT_PACING,
            &format!("NodePort {}:{} ({})", node_ip, node_port, service.name()),
            move || {
                pod.client
                    .exec_in_pod(pod.namespace(), pod.name(), container, command.clone())
            },
        )
        .await?;
    }
    Ok(())
}

/// One attempt: every tracked client and echo pod must be in the agent's ipcache
pub async fn validate_ipcache(agent: &Pod, container: &str, inventory: &Inventory) -> Result<()> {
    let dump = agent
        .client
        .exec_in_pod(
            agent.namespace(),
            agent.name(),
            container,
            argv(&["cilium", "bpf", "ipcache", "list", "-o", "json"]),
        )
        .await?;
    let cache = IpCache::parse(&dump)?;

    for (role, pod) in inventory.tracked_pods() {
        cache.find_pod_id(pod).map_err(|e| {
            Error::Validation(format!("couldn't find {} pod {} in ipcache: {}", role, pod, e))
        })?;
    }
    debug!(agent = %agent, entries = cache.len(), "Validated all pod identities in ipcache");
    Ok(())
}

/// Retry [`validate_ipcache`] on one agent pod under `ctx`
pub async fn wait_for_ipcache(
    ctx: &WaitContext,
    agent: &Pod,
    container: &str,
    inventory: &Inventory,
) -> Result<()> {
    info!(
        cluster = %agent.client.cluster_name(),
        agent = %agent,
        "Waiting for agent to have all the pod IPs in eBPF ipcache"
    );
    poll_until(
        ctx,
        DEFAULT_PACING,
        &format!("pod IDs in ipcache of agent pod {}", agent.name()),
        move || validate_ipcache(agent, container, inventory),
    )
    .await
}
