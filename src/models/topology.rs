use k8s_openapi::api::core::v1::{Affinity, Probe, Toleration};
use std::collections::BTreeMap;
use strum::{AsRefStr, Display};

pub const CLIENT_DEPLOYMENT_NAME: &str = "client";
pub const CLIENT2_DEPLOYMENT_NAME: &str = "client2";
pub const ECHO_SAME_NODE_DEPLOYMENT_NAME: &str = "echo-same-node";
pub const ECHO_OTHER_NODE_DEPLOYMENT_NAME: &str = "echo-other-node";
pub const ECHO_EXTERNAL_NODE_DEPLOYMENT_NAME: &str = "echo-external-node";
pub const HOST_NETNS_DEPLOYMENT_NAME: &str = "host-netns";

pub const PERF_CLIENT_DEPLOYMENT_NAME: &str = "perf-client";
pub const PERF_CLIENT_ACROSS_DEPLOYMENT_NAME: &str = "perf-client-other-node";
pub const PERF_SERVER_DEPLOYMENT_NAME: &str = "perf-server";
pub const PERF_HOST_NET_SUFFIX: &str = "-host-net";

pub const DNS_TEST_SERVER_CONTAINER_NAME: &str = "dns-test-server";
pub const COREDNS_CONFIG_MAP_NAME: &str = "coredns-configmap";
pub const COREDNS_CONFIG_VOLUME_NAME: &str = "coredns-config-volume";

pub const INGRESS_NAME: &str = "ingress-service";
pub const INGRESS_INSECURE_NODE_PORT: &str = "31000";
pub const INGRESS_SECURE_NODE_PORT: &str = "31001";
pub const INGRESS_CLASS_NAME: &str = "cilium";

pub const ECHO_SERVER_HOST_PORT: i32 = 40000;
pub const ECHO_SERVER_PORT: i32 = 8080;
pub const PERF_SERVER_PORT: u16 = 5201;

/// Value of the `kind` label on every provisioned workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum WorkloadKind {
    #[strum(serialize = "echo")]
    Echo,
    #[strum(serialize = "echo-external-node")]
    EchoExternalNode,
    #[strum(serialize = "client")]
    Client,
    #[strum(serialize = "perf")]
    Perf,
    #[strum(serialize = "host-netns")]
    HostNetNs,
}

impl WorkloadKind {
    /// Label selector matching every pod of this kind
    pub fn selector(&self) -> String {
        format!("kind={}", self)
    }
}

/// Label selector matching the pods of one named workload
pub fn name_selector(name: &str) -> String {
    format!("name={}", name)
}

/// Which of the two cluster clients an object is provisioned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ClusterTarget {
    #[strum(serialize = "src")]
    Src,
    #[strum(serialize = "dst")]
    Dst,
}

/// Everything needed to build one Deployment or DaemonSet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadDescriptor {
    pub name: String,
    pub kind: Option<WorkloadKind>,
    pub image: String,
    /// Zero means one replica
    pub replicas: i32,
    /// Empty means `port-<port>`
    pub named_port: String,
    pub port: i32,
    pub host_port: Option<i32>,
    pub command: Vec<String>,
    pub affinity: Option<Affinity>,
    pub node_selector: BTreeMap<String, String>,
    pub readiness_probe: Option<Probe>,
    /// Extra pod template labels on top of `name` and `kind`
    pub labels: BTreeMap<String, String>,
    pub host_network: bool,
    pub tolerations: Vec<Toleration>,
    /// Adds the DNS test server sidecar and its config map volume
    pub dns_test_server_image: Option<String>,
}

impl WorkloadDescriptor {
    pub fn replicas(&self) -> i32 {
        if self.replicas == 0 {
            1
        } else {
            self.replicas
        }
    }

    pub fn named_port(&self) -> String {
        if self.named_port.is_empty() {
            format!("port-{}", self.port)
        } else {
            self.named_port.clone()
        }
    }

    pub fn kind_label(&self) -> &str {
        self.kind.as_ref().map(|k| k.as_ref()).unwrap_or_default()
    }

    /// The `name`/`kind` labels shared by the object, its selector and its pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        [
            ("name".to_string(), self.name.clone()),
            ("kind".to_string(), self.kind_label().to_string()),
        ]
        .into_iter()
        .collect()
    }
}

/// Everything needed to build one echo Service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub selector: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub port_name: String,
    pub port: i32,
    /// Annotate as a cluster-mesh global service
    pub global: bool,
}

/// One object the provisioner must make exist
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyObject {
    Namespace(String),
    DnsConfigMap,
    Service(ServiceDescriptor),
    /// Service account named after the workload, then the deployment itself
    Deployment(WorkloadDescriptor),
    DaemonSet(WorkloadDescriptor),
    Ingress,
}

impl TopologyObject {
    pub fn kind(&self) -> &'static str {
        match self {
            TopologyObject::Namespace(_) => "namespace",
            TopologyObject::DnsConfigMap => "configmap",
            TopologyObject::Service(_) => "service",
            TopologyObject::Deployment(_) => "deployment",
            TopologyObject::DaemonSet(_) => "daemonset",
            TopologyObject::Ingress => "ingress",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TopologyObject::Namespace(name) => name,
            TopologyObject::DnsConfigMap => COREDNS_CONFIG_MAP_NAME,
            TopologyObject::Service(svc) => &svc.name,
            TopologyObject::Deployment(w) | TopologyObject::DaemonSet(w) => &w.name,
            TopologyObject::Ingress => INGRESS_NAME,
        }
    }
}

/// Ordered provisioning plan for one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub steps: Vec<(ClusterTarget, TopologyObject)>,
    /// Deployments to wait for on the source cluster
    pub src_deployments: Vec<String>,
    /// Deployments to wait for on the destination cluster
    pub dst_deployments: Vec<String>,
}

impl Topology {
    pub fn push(&mut self, target: ClusterTarget, object: TopologyObject) {
        self.steps.push((target, object));
    }

    pub fn objects_on(&self, target: ClusterTarget) -> impl Iterator<Item = &TopologyObject> {
        self.steps
            .iter()
            .filter(move |(t, _)| *t == target)
            .map(|(_, o)| o)
    }

    /// `(target, kind, name)` of every step, in order
    pub fn manifest(&self) -> Vec<(ClusterTarget, &'static str, String)> {
        self.steps
            .iter()
            .map(|(t, o)| (*t, o.kind(), o.name().to_string()))
            .collect()
    }

    pub fn contains(&self, target: ClusterTarget, kind: &str, name: &str) -> bool {
        self.objects_on(target)
            .any(|o| o.kind() == kind && o.name() == name)
    }
}

/// Deployment names of the perf workloads.
///
/// Host-network variants carry a suffix so they never collide with the
/// pod-network ones in the same namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfNames {
    pub client: String,
    pub client_across: String,
    pub server: String,
}

impl PerfNames {
    pub fn new(host_net: bool) -> Self {
        let suffix = if host_net { PERF_HOST_NET_SUFFIX } else { "" };
        Self {
            client: format!("{}{}", PERF_CLIENT_DEPLOYMENT_NAME, suffix),
            client_across: format!("{}{}", PERF_CLIENT_ACROSS_DEPLOYMENT_NAME, suffix),
            server: format!("{}{}", PERF_SERVER_DEPLOYMENT_NAME, suffix),
        }
    }
}
