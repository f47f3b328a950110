//! Run-scoped registry of the pods and services discovered during validation

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod as K8sPod, Service as K8sService};
use kube::api::DynamicObject;
use rand::seq::IteratorRandom;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::k8s::ClusterApi;

/// Address family filter for [`Pod::address`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    Any,
    V4,
    V6,
}

impl IpFamily {
    fn matches(&self, ip: &str) -> bool {
        match self {
            IpFamily::Any => true,
            IpFamily::V4 => matches!(ip.parse::<IpAddr>(), Ok(IpAddr::V4(_))),
            IpFamily::V6 => matches!(ip.parse::<IpAddr>(), Ok(IpAddr::V6(_))),
        }
    }
}

/// A discovered pod together with the cluster it lives in
#[derive(Clone)]
pub struct Pod {
    pub client: Arc<dyn ClusterApi>,
    pub pod: K8sPod,
    pub scheme: Option<String>,
    pub port: Option<u16>,
}

impl Pod {
    pub fn new(client: Arc<dyn ClusterApi>, pod: K8sPod) -> Self {
        Self {
            client,
            pod,
            scheme: None,
            port: None,
        }
    }

    pub fn with_endpoint(mut self, scheme: &str, port: u16) -> Self {
        self.scheme = Some(scheme.to_string());
        self.port = Some(port);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.pod.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    pub fn node_name(&self) -> Option<&str> {
        self.pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
    }

    pub fn host_ip(&self) -> Option<&str> {
        self.pod.status.as_ref().and_then(|s| s.host_ip.as_deref())
    }

    pub fn host_network(&self) -> bool {
        self.pod
            .spec
            .as_ref()
            .and_then(|s| s.host_network)
            .unwrap_or(false)
    }

    /// All pod IPs, falling back to the legacy single `podIP` field
    pub fn ips(&self) -> Vec<String> {
        let Some(status) = self.pod.status.as_ref() else {
            return Vec::new();
        };
        let ips: Vec<String> = status
            .pod_ips
            .iter()
            .flatten()
            .filter_map(|p| p.ip.clone())
            .collect();
        if !ips.is_empty() {
            return ips;
        }
        status.pod_ip.iter().cloned().collect()
    }

    /// First pod IP of the requested family, or an empty string
    pub fn address(&self, family: IpFamily) -> String {
        self.ips()
            .into_iter()
            .find(|ip| family.matches(ip))
            .unwrap_or_default()
    }
}

impl fmt::Debug for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pod")
            .field("cluster", &self.client.cluster_name())
            .field("namespace", &self.namespace())
            .field("name", &self.name())
            .field("ips", &self.ips())
            .finish()
    }
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace(), self.name())
    }
}

/// A discovered Service
#[derive(Debug, Clone)]
pub struct Service {
    pub service: K8sService,
}

impl Service {
    pub fn new(service: K8sService) -> Self {
        Self { service }
    }

    pub fn name(&self) -> &str {
        self.service.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn service_type(&self) -> &str {
        self.service
            .spec
            .as_ref()
            .and_then(|s| s.type_.as_deref())
            .unwrap_or("ClusterIP")
    }

    /// The address a DNS lookup of this service is expected to return.
    ///
    /// Empty for service types that carry no address yet (or none at all).
    pub fn expected_address(&self) -> String {
        match self.service_type() {
            "ClusterIP" | "NodePort" => self
                .service
                .spec
                .as_ref()
                .and_then(|s| s.cluster_ip.clone())
                .unwrap_or_default(),
            "LoadBalancer" => self
                .service
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .and_then(|ingress| ingress.first())
                .and_then(|i| i.ip.clone())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Allocated node ports, skipping ports without one
    pub fn node_ports(&self) -> Vec<i32> {
        self.service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .filter_map(|p| p.node_port)
                    .filter(|p| *p != 0)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ExternalWorkload {
    pub workload: DynamicObject,
}

impl ExternalWorkload {
    pub fn name(&self) -> &str {
        self.workload.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Everything the validation pass discovered, keyed by object name.
///
/// Populated once by the sequential discovery pass and read afterwards by the
/// test executor.
#[derive(Debug, Clone)]
pub struct Inventory {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub agent_pods: BTreeMap<String, Pod>,
    pub client_pods: BTreeMap<String, Pod>,
    pub echo_pods: BTreeMap<String, Pod>,
    pub echo_external_pods: BTreeMap<String, Pod>,
    pub perf_client_pods: BTreeMap<String, Pod>,
    pub perf_server_pods: BTreeMap<String, Pod>,
    /// Keyed by node name
    pub host_netns_pods: BTreeMap<String, Pod>,
    pub echo_services: BTreeMap<String, Service>,
    pub ingress_services: BTreeMap<String, Service>,
    pub external_workloads: BTreeMap<String, ExternalWorkload>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            agent_pods: BTreeMap::new(),
            client_pods: BTreeMap::new(),
            echo_pods: BTreeMap::new(),
            echo_external_pods: BTreeMap::new(),
            perf_client_pods: BTreeMap::new(),
            perf_server_pods: BTreeMap::new(),
            host_netns_pods: BTreeMap::new(),
            echo_services: BTreeMap::new(),
            ingress_services: BTreeMap::new(),
            external_workloads: BTreeMap::new(),
        }
    }

    /// Any client pod, for probes that only need a vantage point
    pub fn random_client_pod(&self) -> Option<&Pod> {
        self.client_pods.values().choose(&mut rand::thread_rng())
    }

    /// Echo pods belonging to one deployment
    pub fn echo_pods_of(&self, deployment: &str) -> Vec<&Pod> {
        self.echo_pods
            .values()
            .filter(|p| p.label("name") == Some(deployment))
            .collect()
    }

    /// Client and echo pods, the set the identity cache must cover
    pub fn tracked_pods(&self) -> impl Iterator<Item = (&'static str, &Pod)> {
        self.client_pods
            .values()
            .map(|p| ("client", p))
            .chain(self.echo_pods.values().map(|p| ("echo", p)))
    }
}
