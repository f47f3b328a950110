//! Kubernetes resource builders for the connectivity-check topology
//!
//! Pure functions turning workload and service descriptors into Deployment,
//! DaemonSet, Service, ConfigMap, ServiceAccount, Namespace and Ingress specs.

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar,
    HTTPGetAction, KeyToPath, Namespace, NodeAffinity, NodeSelectorRequirement,
    NodeSelectorTerm, PodAffinity, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec,
    PreferredSchedulingTerm, Probe, SecurityContext, Service, ServiceAccount, ServicePort,
    ServiceSpec, Toleration, Volume, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use crate::models::{
    ServiceDescriptor, WorkloadDescriptor, COREDNS_CONFIG_MAP_NAME, COREDNS_CONFIG_VOLUME_NAME,
    DNS_TEST_SERVER_CONTAINER_NAME, ECHO_SAME_NODE_DEPLOYMENT_NAME, ECHO_SERVER_PORT,
    INGRESS_CLASS_NAME, INGRESS_INSECURE_NODE_PORT, INGRESS_NAME, INGRESS_SECURE_NODE_PORT,
};

pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

/// Corefile of the DNS test server: answers `localhost` lookups locally
pub const COREDNS_COREFILE: &str = ". {
\t\t\t\tlocal
\t\t\t\tready
\t\t\t\tlog
\t\t\t}";

/// Labels marking objects created by this tool
pub fn managed_labels() -> BTreeMap<String, String> {
    [(
        "app.kubernetes.io/managed-by".to_string(),
        "conncheck".to_string(),
    )]
    .into_iter()
    .collect()
}

/// Create the test Namespace
pub fn new_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Create the ServiceAccount a workload runs as
pub fn new_service_account(name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Create the ConfigMap holding the DNS test server's Corefile
pub fn new_coredns_config_map() -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(COREDNS_CONFIG_MAP_NAME.to_string()),
            ..Default::default()
        },
        data: Some(
            [("Corefile".to_string(), COREDNS_COREFILE.to_string())]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

/// Local HTTP GET readiness probe with a fast fixed cadence
pub fn new_local_readiness_probe(port: i32, path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        timeout_seconds: Some(2),
        success_threshold: Some(1),
        period_seconds: Some(1),
        initial_delay_seconds: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Toleration matching every taint
pub fn tolerate_all() -> Vec<Toleration> {
    vec![Toleration {
        operator: Some("Exists".to_string()),
        ..Default::default()
    }]
}

fn name_in(values: &[&str]) -> LabelSelector {
    LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: "name".to_string(),
            operator: "In".to_string(),
            values: Some(values.iter().map(|v| v.to_string()).collect()),
        }]),
        ..Default::default()
    }
}

fn same_host_term(workload: &str) -> PodAffinityTerm {
    PodAffinityTerm {
        label_selector: Some(name_in(&[workload])),
        topology_key: LABEL_HOSTNAME.to_string(),
        ..Default::default()
    }
}

fn zone_preference(zone: &str) -> NodeAffinity {
    NodeAffinity {
        preferred_during_scheduling_ignored_during_execution: Some(vec![
            PreferredSchedulingTerm {
                weight: 100,
                preference: NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: LABEL_TOPOLOGY_ZONE.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![zone.to_string()]),
                    }]),
                    ..Default::default()
                },
            },
        ]),
        ..Default::default()
    }
}

/// Require scheduling on the same node as the pods of `workload`
pub fn same_node_as(workload: &str) -> Affinity {
    Affinity {
        pod_affinity: Some(PodAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![same_host_term(
                workload,
            )]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Require scheduling on a different node than the pods of `workload`
pub fn other_node_than(workload: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![same_host_term(
                workload,
            )]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Prefer nodes in `zone`
pub fn in_zone(zone: &str) -> Affinity {
    Affinity {
        node_affinity: Some(zone_preference(zone)),
        ..Default::default()
    }
}

/// Prefer `zone` and require the same node as `workload`
pub fn in_zone_with(zone: &str, workload: &str) -> Affinity {
    Affinity {
        node_affinity: Some(zone_preference(zone)),
        ..same_node_as(workload)
    }
}

/// Prefer `zone` and prefer a different node than `workload`
pub fn in_zone_apart_from(zone: &str, workload: &str) -> Affinity {
    Affinity {
        node_affinity: Some(zone_preference(zone)),
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: same_host_term(workload),
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn none_if_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn none_if_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

fn net_raw() -> SecurityContext {
    SecurityContext {
        capabilities: Some(Capabilities {
            add: Some(vec!["NET_RAW".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn workload_container(w: &WorkloadDescriptor, with_port: bool) -> Container {
    let (env, ports) = if with_port {
        let named_port = w.named_port();
        (
            Some(vec![
                EnvVar {
                    name: "PORT".to_string(),
                    value: Some(w.port.to_string()),
                    ..Default::default()
                },
                EnvVar {
                    name: "NAMED_PORT".to_string(),
                    value: Some(named_port.clone()),
                    ..Default::default()
                },
            ]),
            Some(vec![ContainerPort {
                name: Some(named_port),
                container_port: w.port,
                host_port: w.host_port.filter(|p| *p != 0),
                ..Default::default()
            }]),
        )
    } else {
        (None, None)
    };

    Container {
        name: w.name.clone(),
        image: Some(w.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: none_if_empty(w.command.clone()),
        env,
        ports,
        readiness_probe: w.readiness_probe.clone(),
        security_context: Some(net_raw()),
        ..Default::default()
    }
}

fn dns_test_server_container(image: &str) -> Container {
    Container {
        name: DNS_TEST_SERVER_CONTAINER_NAME.to_string(),
        args: Some(vec!["-conf".to_string(), "/etc/coredns/Corefile".to_string()]),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![
            ContainerPort {
                container_port: 53,
                name: Some("dns-53".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: 53,
                name: Some("dns-udp-53".to_string()),
                protocol: Some("UDP".to_string()),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(new_local_readiness_probe(8181, "/ready")),
        volume_mounts: Some(vec![VolumeMount {
            name: COREDNS_CONFIG_VOLUME_NAME.to_string(),
            mount_path: "/etc/coredns".to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn coredns_config_volume() -> Volume {
    Volume {
        name: COREDNS_CONFIG_VOLUME_NAME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(COREDNS_CONFIG_MAP_NAME.to_string()),
            items: Some(vec![KeyToPath {
                key: "Corefile".to_string(),
                path: "Corefile".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_template(w: &WorkloadDescriptor, spec: PodSpec) -> PodTemplateSpec {
    let mut labels = w.selector_labels();
    labels.extend(w.labels.clone());

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            name: Some(w.name.clone()),
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(spec),
    }
}

/// Create a Deployment for a topology workload.
///
/// The object, its selector and its pods all carry `name` and `kind`
/// labels; discovery relies on exactly these. Extra labels only go on the
/// pods. When the descriptor names a DNS test server image, the CoreDNS
/// sidecar and its config map volume are added.
pub fn new_deployment(w: &WorkloadDescriptor) -> Deployment {
    let mut containers = vec![workload_container(w, true)];
    let mut volumes = Vec::new();
    if let Some(image) = &w.dns_test_server_image {
        containers.push(dns_test_server_container(image));
        volumes.push(coredns_config_volume());
    }

    let pod_spec = PodSpec {
        containers,
        volumes: none_if_empty(volumes),
        affinity: w.affinity.clone(),
        node_selector: none_if_empty_map(&w.node_selector),
        host_network: w.host_network.then_some(true),
        tolerations: none_if_empty(w.tolerations.clone()),
        service_account_name: Some(w.name.clone()),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(w.name.clone()),
            labels: Some(w.selector_labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(w.replicas()),
            selector: LabelSelector {
                match_labels: Some(w.selector_labels()),
                ..Default::default()
            },
            template: pod_template(w, pod_spec),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create a DaemonSet for a topology workload (one pod per node, no ports)
pub fn new_daemon_set(w: &WorkloadDescriptor) -> DaemonSet {
    let pod_spec = PodSpec {
        containers: vec![workload_container(w, false)],
        affinity: w.affinity.clone(),
        host_network: w.host_network.then_some(true),
        tolerations: none_if_empty(w.tolerations.clone()),
        ..Default::default()
    };

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(w.name.clone()),
            labels: Some(w.selector_labels()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(w.selector_labels()),
                ..Default::default()
            },
            template: pod_template(w, pod_spec),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create a dual-stack NodePort Service for an echo workload
pub fn new_service(s: &ServiceDescriptor) -> Service {
    let annotations = s.global.then(|| {
        [
            ("service.cilium.io/global".to_string(), "true".to_string()),
            ("io.cilium/global-service".to_string(), "true".to_string()),
        ]
        .into_iter()
        .collect()
    });

    Service {
        metadata: ObjectMeta {
            name: Some(s.name.clone()),
            labels: none_if_empty_map(&s.labels),
            annotations,
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(s.port_name.clone()),
                port: s.port,
                ..Default::default()
            }]),
            selector: Some(s.selector.clone()),
            ip_family_policy: Some("PreferDualStack".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create the Ingress routing `/` to the same-node echo service through a
/// dedicated Cilium load balancer
pub fn new_ingress() -> Ingress {
    let annotations = [
        ("ingress.cilium.io/loadbalancer-mode", "dedicated"),
        ("ingress.cilium.io/service-type", "NodePort"),
        ("ingress.cilium.io/insecure-node-port", INGRESS_INSECURE_NODE_PORT),
        ("ingress.cilium.io/secure-node-port", INGRESS_SECURE_NODE_PORT),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    Ingress {
        metadata: ObjectMeta {
            name: Some(INGRESS_NAME.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS_NAME.to_string()),
            rules: Some(vec![IngressRule {
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "ImplementationSpecific".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: ECHO_SAME_NODE_DEPLOYMENT_NAME.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(ECHO_SERVER_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Placeholder for the load balancer service the ingress controller creates
/// for [`new_ingress`]
pub fn new_ingress_service_placeholder() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(format!("cilium-ingress-{}", INGRESS_NAME)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: 80,
                    ..Default::default()
                },
                ServicePort {
                    name: Some("https".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: 443,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
