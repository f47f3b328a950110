//! Topology planning: which objects a run needs, on which cluster, in order
//!
//! Planning is pure. The same configuration, feature set and zone always
//! yield the same steps, names and labels.

use k8s_openapi::api::core::v1::Node;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

use crate::config::Config;
use crate::k8s::resources::{
    in_zone, in_zone_apart_from, in_zone_with, new_local_readiness_probe, other_node_than,
    same_node_as, tolerate_all, LABEL_TOPOLOGY_ZONE,
};
use crate::models::{
    ClusterTarget, Feature, FeatureSet, PerfNames, ServiceDescriptor, Topology, TopologyObject,
    WorkloadDescriptor, WorkloadKind, CLIENT2_DEPLOYMENT_NAME, CLIENT_DEPLOYMENT_NAME,
    ECHO_EXTERNAL_NODE_DEPLOYMENT_NAME, ECHO_OTHER_NODE_DEPLOYMENT_NAME,
    ECHO_SAME_NODE_DEPLOYMENT_NAME, ECHO_SERVER_HOST_PORT, ECHO_SERVER_PORT,
    HOST_NETNS_DEPLOYMENT_NAME,
};

const SLEEP_FOREVER: &str = "sleep 10000000";

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn shell(shell: &str, script: &str) -> Vec<String> {
    vec![shell.to_string(), "-c".to_string(), script.to_string()]
}

fn echo_service(name: &str, global: bool) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        selector: labels(&[("name", name)]),
        labels: labels(&[("kind", WorkloadKind::Echo.as_ref())]),
        port_name: "http".to_string(),
        port: ECHO_SERVER_PORT,
        global,
    }
}

/// Pick the zone perf workloads should prefer.
///
/// The first zone seen on a second node wins. When every zone holds a
/// single node the last zone seen is used.
pub fn select_perf_zone(nodes: &[Node]) -> String {
    let mut seen = HashSet::new();
    let mut last = String::new();
    for node in nodes {
        let zone = node
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_TOPOLOGY_ZONE))
            .cloned()
            .unwrap_or_default();
        if !seen.insert(zone.clone()) {
            return zone;
        }
        last = zone;
    }
    warn!("Each zone only has a single node, this could impact the performance test results");
    last
}

/// Plan the objects for one run.
///
/// `zone` only matters in perf mode.
pub fn plan(config: &Config, features: &FeatureSet, zone: &str) -> Topology {
    if config.perf {
        plan_perf(config, zone)
    } else {
        plan_connectivity(config, features)
    }
}

fn plan_perf(config: &Config, zone: &str) -> Topology {
    let names = PerfNames::new(config.perf_host_net);
    let mut topology = Topology::default();

    topology.push(
        ClusterTarget::Src,
        TopologyObject::Namespace(config.test_namespace.clone()),
    );

    let perf = |name: &str, port: i32, script: &str, extra: &[(&str, &str)]| WorkloadDescriptor {
        name: name.to_string(),
        kind: Some(WorkloadKind::Perf),
        image: config.performance_image.clone(),
        port,
        command: shell("/bin/bash", script),
        labels: labels(extra),
        node_selector: config.node_selector.clone(),
        host_network: config.perf_host_net,
        ..Default::default()
    };

    let mut client = perf(&names.client, 80, SLEEP_FOREVER, &[("client", "role")]);
    client.named_port = "http-80".to_string();
    client.affinity = Some(in_zone(zone));
    topology.push(ClusterTarget::Src, TopologyObject::Deployment(client));

    let mut server = perf(
        &names.server,
        5001,
        "netserver;sleep 10000000",
        &[("server", "role")],
    );
    server.affinity = Some(in_zone_with(zone, &names.client));
    topology.push(ClusterTarget::Src, TopologyObject::Deployment(server));

    topology.src_deployments = vec![names.client.clone(), names.server.clone()];

    if !config.single_node {
        let mut across = perf(&names.client_across, 5001, SLEEP_FOREVER, &[("client", "role")]);
        across.affinity = Some(in_zone_apart_from(zone, &names.client));
        topology.push(ClusterTarget::Src, TopologyObject::Deployment(across));
        topology.src_deployments.push(names.client_across);
    }

    topology
}

fn plan_connectivity(config: &Config, features: &FeatureSet) -> Topology {
    let multi = config.is_multi_cluster();
    let mut topology = Topology::default();

    topology.push(
        ClusterTarget::Src,
        TopologyObject::Namespace(config.test_namespace.clone()),
    );
    if multi {
        topology.push(
            ClusterTarget::Dst,
            TopologyObject::Namespace(config.test_namespace.clone()),
        );
    }

    topology.push(
        ClusterTarget::Src,
        TopologyObject::Service(echo_service(ECHO_SAME_NODE_DEPLOYMENT_NAME, false)),
    );
    if multi {
        topology.push(
            ClusterTarget::Src,
            TopologyObject::Service(echo_service(ECHO_OTHER_NODE_DEPLOYMENT_NAME, true)),
        );
    }

    topology.push(ClusterTarget::Src, TopologyObject::DnsConfigMap);
    if multi {
        topology.push(ClusterTarget::Dst, TopologyObject::DnsConfigMap);
    }

    let echo = |name: &str, extra: &[(&str, &str)]| WorkloadDescriptor {
        name: name.to_string(),
        kind: Some(WorkloadKind::Echo),
        image: config.json_mock_image.clone(),
        port: ECHO_SERVER_PORT,
        named_port: "http-8080".to_string(),
        labels: labels(extra),
        readiness_probe: Some(new_local_readiness_probe(ECHO_SERVER_PORT, "/")),
        dns_test_server_image: Some(config.dns_test_server_image.clone()),
        ..Default::default()
    };

    let mut same_node = echo(ECHO_SAME_NODE_DEPLOYMENT_NAME, &[("other", "echo")]);
    if features.enabled(Feature::HostPort) {
        same_node.host_port = Some(ECHO_SERVER_HOST_PORT);
    }
    same_node.affinity = Some(same_node_as(CLIENT_DEPLOYMENT_NAME));
    topology.push(ClusterTarget::Src, TopologyObject::Deployment(same_node));

    let client = |name: &str, extra: &[(&str, &str)]| WorkloadDescriptor {
        name: name.to_string(),
        kind: Some(WorkloadKind::Client),
        image: config.curl_image.clone(),
        port: ECHO_SERVER_PORT,
        named_port: "http-8080".to_string(),
        command: shell("/bin/ash", SLEEP_FOREVER),
        labels: labels(extra),
        node_selector: config.node_selector.clone(),
        ..Default::default()
    };

    topology.push(
        ClusterTarget::Src,
        TopologyObject::Deployment(client(CLIENT_DEPLOYMENT_NAME, &[])),
    );

    let mut client2 = client(CLIENT2_DEPLOYMENT_NAME, &[("other", "client")]);
    client2.affinity = Some(same_node_as(CLIENT_DEPLOYMENT_NAME));
    topology.push(ClusterTarget::Src, TopologyObject::Deployment(client2));

    topology.src_deployments = vec![
        CLIENT_DEPLOYMENT_NAME.to_string(),
        CLIENT2_DEPLOYMENT_NAME.to_string(),
        ECHO_SAME_NODE_DEPLOYMENT_NAME.to_string(),
    ];

    if config.spans_nodes() {
        topology.push(
            ClusterTarget::Dst,
            TopologyObject::Service(echo_service(ECHO_OTHER_NODE_DEPLOYMENT_NAME, multi)),
        );

        let mut other_node = echo(ECHO_OTHER_NODE_DEPLOYMENT_NAME, &[("first", "echo")]);
        if features.enabled(Feature::HostPort) {
            other_node.host_port = Some(ECHO_SERVER_HOST_PORT);
        }
        other_node.affinity = Some(other_node_than(CLIENT_DEPLOYMENT_NAME));
        other_node.node_selector = config.node_selector.clone();
        topology.push(ClusterTarget::Dst, TopologyObject::Deployment(other_node));

        topology
            .dst_deployments
            .push(ECHO_OTHER_NODE_DEPLOYMENT_NAME.to_string());
    }

    if features.enabled(Feature::NodeWithoutCilium) {
        let host_netns = WorkloadDescriptor {
            name: HOST_NETNS_DEPLOYMENT_NAME.to_string(),
            kind: Some(WorkloadKind::HostNetNs),
            image: config.curl_image.clone(),
            port: ECHO_SERVER_PORT,
            command: shell("/bin/ash", SLEEP_FOREVER),
            labels: labels(&[("other", "host-netns")]),
            host_network: true,
            tolerations: tolerate_all(),
            ..Default::default()
        };
        topology.push(ClusterTarget::Dst, TopologyObject::DaemonSet(host_netns));

        let external = WorkloadDescriptor {
            name: ECHO_EXTERNAL_NODE_DEPLOYMENT_NAME.to_string(),
            kind: Some(WorkloadKind::EchoExternalNode),
            image: config.json_mock_image.clone(),
            port: ECHO_SERVER_PORT,
            named_port: "http-8080".to_string(),
            host_port: Some(ECHO_SERVER_PORT),
            labels: labels(&[("external", "echo")]),
            node_selector: labels(&[("cilium.io/no-schedule", "true")]),
            readiness_probe: Some(new_local_readiness_probe(ECHO_SERVER_PORT, "/")),
            host_network: true,
            tolerations: tolerate_all(),
            ..Default::default()
        };
        topology.push(ClusterTarget::Dst, TopologyObject::Deployment(external));

        topology
            .dst_deployments
            .push(ECHO_EXTERNAL_NODE_DEPLOYMENT_NAME.to_string());
    }

    if features.enabled(Feature::IngressController) {
        topology.push(ClusterTarget::Src, TopologyObject::Ingress);
    }

    topology
}
