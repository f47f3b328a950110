//! In-memory cluster used by the integration tests
//!
//! Deployments and daemonsets get ready pods immediately, services get a
//! ClusterIP and node ports, and exec emulates the handful of commands the
//! checks run (`nslookup`, `nc`, `cilium bpf ipcache list`).

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Node, Pod, PodIP, PodSpec, PodStatus, Service, ServiceAccount,
    ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::ErrorResponse;
use kube::discovery::ApiResource;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use conncheck::error::{Error, Result};
use conncheck::k8s::ClusterApi;

pub const AGENT_NAMESPACE: &str = "kube-system";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).map(String::as_str) == Some(v),
            None => false,
        })
}

struct FakeNode {
    name: String,
    zone: String,
    host_ip: String,
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    deployments: BTreeMap<Key, Deployment>,
    daemon_sets: BTreeMap<Key, DaemonSet>,
    services: BTreeMap<Key, Service>,
    config_maps: BTreeMap<Key, ConfigMap>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    ingresses: BTreeMap<Key, Ingress>,
    pods: BTreeMap<Key, Pod>,
    creates: usize,
    namespace_deletes: usize,
    namespace_rejections: usize,
    ipcache_omissions: HashSet<String>,
    /// `None` while the CiliumExternalWorkload CRD is not installed
    external_workloads: Option<Vec<String>>,
    external_workloads_forbidden: bool,
    next_pod: u32,
    next_service: u32,
}

impl State {
    fn remove_namespace(&mut self, namespace: &str) {
        self.namespaces.remove(namespace);
        self.deployments.retain(|(ns, _), _| ns != namespace);
        self.daemon_sets.retain(|(ns, _), _| ns != namespace);
        self.services.retain(|(ns, _), _| ns != namespace);
        self.config_maps.retain(|(ns, _), _| ns != namespace);
        self.service_accounts.retain(|(ns, _), _| ns != namespace);
        self.ingresses.retain(|(ns, _), _| ns != namespace);
        self.pods.retain(|(ns, _), _| ns != namespace);
    }

    fn remove_pods_of(&mut self, namespace: &str, owner: &str) {
        self.pods.retain(|(ns, _), pod| {
            ns != namespace
                || pod.metadata.labels.as_ref().and_then(|l| l.get("name")).map(String::as_str)
                    != Some(owner)
        });
    }

    /// Assign a ClusterIP, plus node ports for NodePort services
    fn allocate(&mut self, namespace: &str, service: &Service) -> Service {
        self.next_service += 1;
        let n = self.next_service;

        let mut stored = service.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        if let Some(spec) = stored.spec.as_mut() {
            spec.cluster_ip = Some(format!("10.96.0.{}", n + 10));
            let node_port = spec.type_.as_deref() == Some("NodePort");
            for (i, port) in spec.ports.iter_mut().flatten().enumerate() {
                if node_port {
                    port.node_port = Some(30000 + (n as i32) * 10 + i as i32);
                }
            }
        }
        stored
    }

    fn spawn_pod(&mut self, namespace: &str, owner: &str, template: &Option<ObjectMeta>, spec: PodSpec, node: &FakeNode) {
        self.next_pod += 1;
        let name = format!("{}-{:05x}", owner, self.next_pod);
        let host_network = spec.host_network.unwrap_or(false);
        let ip = if host_network {
            node.host_ip.clone()
        } else {
            format!("10.0.{}.{}", self.next_pod / 250, self.next_pod % 250 + 2)
        };
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: template.as_ref().and_then(|m| m.labels.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.name.clone()),
                ..spec
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                host_ip: Some(node.host_ip.clone()),
                pod_ip: Some(ip.clone()),
                pod_ips: Some(vec![PodIP { ip: Some(ip) }]),
                ..Default::default()
            }),
        };
        self.pods.insert(key(namespace, &name), pod);
    }
}

/// A fake cluster with two schedulable nodes and one agent pod per node
pub struct FakeCluster {
    name: String,
    nodes: Vec<FakeNode>,
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new(name: &str) -> Self {
        let nodes = vec![
            FakeNode {
                name: format!("{}-worker", name),
                zone: "zone-a".to_string(),
                host_ip: "172.18.0.2".to_string(),
            },
            FakeNode {
                name: format!("{}-worker2", name),
                zone: "zone-a".to_string(),
                host_ip: "172.18.0.3".to_string(),
            },
        ];
        let cluster = Self {
            name: name.to_string(),
            nodes,
            state: Mutex::new(State::default()),
        };
        cluster.seed_agents();
        cluster
    }

    fn seed_agents(&self) {
        let mut state = self.state.lock().unwrap();
        for (i, node) in self.nodes.iter().enumerate() {
            let name = format!("cilium-{}", i);
            state.pods.insert(
                key(AGENT_NAMESPACE, &name),
                Pod {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(AGENT_NAMESPACE.to_string()),
                        labels: Some([("k8s-app".to_string(), "cilium".to_string())].into()),
                        ..Default::default()
                    },
                    spec: Some(PodSpec {
                        node_name: Some(node.name.clone()),
                        host_network: Some(true),
                        ..Default::default()
                    }),
                    status: Some(PodStatus {
                        host_ip: Some(node.host_ip.clone()),
                        pod_ip: Some(node.host_ip.clone()),
                        ..Default::default()
                    }),
                },
            );
        }
    }

    /// Reject the next `n` namespace deletions, like an admission guard
    pub fn reject_namespace_deletions(&self, n: usize) {
        self.state.lock().unwrap().namespace_rejections = n;
    }

    pub fn namespace_deletes(&self) -> usize {
        self.state.lock().unwrap().namespace_deletes
    }

    /// Number of successful create calls so far
    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    /// Leave the IPs of pods whose name starts with `prefix` out of the ipcache
    pub fn omit_from_ipcache(&self, prefix: &str) {
        self.state
            .lock()
            .unwrap()
            .ipcache_omissions
            .insert(prefix.to_string());
    }

    /// Install the external workload CRD with the given workloads
    pub fn add_external_workloads(&self, names: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let workloads = state.external_workloads.get_or_insert_with(Vec::new);
        workloads.extend(names.iter().map(|n| n.to_string()));
    }

    /// Make external workload listing fail with 403
    pub fn forbid_external_workloads(&self) {
        self.state.lock().unwrap().external_workloads_forbidden = true;
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains_key(name)
    }

    pub fn deployment_names(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .deployments
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn service_names(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .services
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn has_config_map(&self, namespace: &str, name: &str) -> bool {
        self.state.lock().unwrap().config_maps.contains_key(&key(namespace, name))
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state.lock().unwrap().deployments.get(&key(namespace, name)).cloned()
    }

    /// Node a new pod lands on: anti-affinity pushes it to the second node
    fn schedule(&self, spec: &PodSpec) -> &FakeNode {
        let anti = spec
            .affinity
            .as_ref()
            .and_then(|a| a.pod_anti_affinity.as_ref())
            .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref())
            .is_some();
        if anti {
            &self.nodes[1]
        } else {
            &self.nodes[0]
        }
    }

    fn ipcache_dump(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut entries = BTreeMap::new();
        for ((ns, name), pod) in &state.pods {
            if ns == AGENT_NAMESPACE
                || state.ipcache_omissions.iter().any(|p| name.starts_with(p.as_str()))
            {
                continue;
            }
            for ip in pod.status.iter().flat_map(|s| s.pod_ips.iter().flatten()) {
                if let Some(ip) = &ip.ip {
                    let identity = 1000 + entries.len();
                    entries.insert(
                        format!("{}/32", ip),
                        vec![format!("identity={} encryptkey=0 tunnelendpoint=0.0.0.0", identity)],
                    );
                }
            }
        }
        serde_json::to_string(&entries).unwrap()
    }

    fn exec_failure(namespace: &str, pod: &str, command: Vec<String>, message: &str) -> Error {
        Error::Exec {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            command,
            message: message.to_string(),
            stdout: String::new(),
        }
    }
}

fn cilium_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: "cilium.io".to_string(),
        version: "v2".to_string(),
        api_version: "cilium.io/v2".to_string(),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

fn named<T: Clone>(map: &BTreeMap<Key, T>, kind: &'static str, namespace: &str, name: &str) -> Result<T> {
    map.get(&key(namespace, name))
        .cloned()
        .ok_or_else(|| Error::not_found(kind, name))
}

fn insert<T: Clone>(
    map: &mut BTreeMap<Key, T>,
    kind: &'static str,
    namespace: &str,
    name: &str,
    object: T,
) -> Result<T> {
    let k = key(namespace, name);
    if map.contains_key(&k) {
        return Err(Error::already_exists(kind, name));
    }
    map.insert(k, object.clone());
    Ok(object)
}

fn remove<T>(map: &mut BTreeMap<Key, T>, kind: &'static str, namespace: &str, name: &str) -> Result<()> {
    map.remove(&key(namespace, name))
        .map(|_| ())
        .ok_or_else(|| Error::not_found(kind, name))
}

fn ingress_controller_service(ingress: &str) -> Service {
    let port = |name: &str, port: i32| ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port,
        ..Default::default()
    };
    Service {
        metadata: ObjectMeta {
            name: Some(format!("cilium-ingress-{}", ingress)),
            labels: Some([("cilium.io/ingress".to_string(), "true".to_string())].into()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            ports: Some(vec![port("http", 80), port("https", 443)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn cluster_name(&self) -> String {
        self.name.clone()
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("namespace", name))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let name = name_of(&namespace.metadata);
        let mut state = self.state.lock().unwrap();
        if state.namespaces.contains_key(&name) {
            return Err(Error::already_exists("namespace", name));
        }
        state.namespaces.insert(name, namespace.clone());
        state.creates += 1;
        Ok(namespace.clone())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.namespace_deletes += 1;
        if state.namespace_rejections > 0 {
            state.namespace_rejections -= 1;
            return Err(Error::Validation(format!(
                "admission webhook denied deletion of namespace {}",
                name
            )));
        }
        if !state.namespaces.contains_key(name) {
            return Err(Error::not_found("namespace", name));
        }
        state.remove_namespace(name);
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        named(&self.state.lock().unwrap().deployments, "deployment", namespace, name)
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment> {
        let name = name_of(&deployment.metadata);
        let spec = deployment.spec.clone().unwrap_or_default();
        let replicas = spec.replicas.unwrap_or(1);

        let mut stored = deployment.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.generation = Some(1);
        stored.status = Some(DeploymentStatus {
            observed_generation: Some(1),
            replicas: Some(replicas),
            updated_replicas: Some(replicas),
            ready_replicas: Some(replicas),
            available_replicas: Some(replicas),
            ..Default::default()
        });

        let pod_spec = spec.template.spec.clone().unwrap_or_default();
        let node = self.schedule(&pod_spec);
        let mut state = self.state.lock().unwrap();
        let created = insert(&mut state.deployments, "deployment", namespace, &name, stored)?;
        for _ in 0..replicas {
            state.spawn_pod(namespace, &name, &spec.template.metadata, pod_spec.clone(), node);
        }
        state.creates += 1;
        Ok(created)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        remove(&mut state.deployments, "deployment", namespace, name)?;
        state.remove_pods_of(namespace, name);
        Ok(())
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        named(&self.state.lock().unwrap().daemon_sets, "daemonset", namespace, name)
    }

    async fn create_daemon_set(&self, namespace: &str, daemon_set: &DaemonSet) -> Result<DaemonSet> {
        let name = name_of(&daemon_set.metadata);
        let spec = daemon_set.spec.clone().unwrap_or_default();
        let pod_spec = spec.template.spec.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        let created = insert(
            &mut state.daemon_sets,
            "daemonset",
            namespace,
            &name,
            daemon_set.clone(),
        )?;
        for node in &self.nodes {
            state.spawn_pod(namespace, &name, &spec.template.metadata, pod_spec.clone(), node);
        }
        state.creates += 1;
        Ok(created)
    }

    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        remove(&mut state.daemon_sets, "daemonset", namespace, name)?;
        state.remove_pods_of(namespace, name);
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        named(&self.state.lock().unwrap().services, "service", namespace, name)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let name = name_of(&service.metadata);
        let mut state = self.state.lock().unwrap();
        if state.services.contains_key(&key(namespace, &name)) {
            return Err(Error::already_exists("service", name));
        }
        let stored = state.allocate(namespace, service);
        let created = insert(&mut state.services, "service", namespace, &name, stored)?;
        state.creates += 1;
        Ok(created)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        remove(&mut self.state.lock().unwrap().services, "service", namespace, name)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        named(&self.state.lock().unwrap().config_maps, "configmap", namespace, name)
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let name = name_of(&config_map.metadata);
        let mut state = self.state.lock().unwrap();
        let created = insert(
            &mut state.config_maps,
            "configmap",
            namespace,
            &name,
            config_map.clone(),
        )?;
        state.creates += 1;
        Ok(created)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        remove(&mut self.state.lock().unwrap().config_maps, "configmap", namespace, name)
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        let name = name_of(&service_account.metadata);
        let mut state = self.state.lock().unwrap();
        let created = insert(
            &mut state.service_accounts,
            "serviceaccount",
            namespace,
            &name,
            service_account.clone(),
        )?;
        state.creates += 1;
        Ok(created)
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        remove(
            &mut self.state.lock().unwrap().service_accounts,
            "serviceaccount",
            namespace,
            name,
        )
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress> {
        named(&self.state.lock().unwrap().ingresses, "ingress", namespace, name)
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        let name = name_of(&ingress.metadata);
        let mut state = self.state.lock().unwrap();
        let created = insert(&mut state.ingresses, "ingress", namespace, &name, ingress.clone())?;
        state.creates += 1;

        // the ingress controller publishes a dedicated load balancer service
        let controller_service = ingress_controller_service(&name);
        let service_name = name_of(&controller_service.metadata);
        let stored = state.allocate(namespace, &controller_service);
        state.services.insert(key(namespace, &service_name), stored);
        Ok(created)
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()> {
        remove(&mut self.state.lock().unwrap().ingresses, "ingress", namespace, name)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && matches_selector(pod.metadata.labels.as_ref(), selector)
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .services
            .iter()
            .filter(|((ns, _), svc)| {
                ns == namespace && matches_selector(svc.metadata.labels.as_ref(), selector)
            })
            .map(|(_, svc)| svc.clone())
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self
            .nodes
            .iter()
            .map(|n| Node {
                metadata: ObjectMeta {
                    name: Some(n.name.clone()),
                    labels: Some(
                        [("topology.kubernetes.io/zone".to_string(), n.zone.clone())].into(),
                    ),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect())
    }

    async fn list_cilium_external_workloads(&self) -> Result<Vec<DynamicObject>> {
        let state = self.state.lock().unwrap();
        if state.external_workloads_forbidden {
            return Err(Error::Kube(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "ciliumexternalworkloads.cilium.io is forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            })));
        }
        match &state.external_workloads {
            Some(names) => {
                let resource = cilium_resource("CiliumExternalWorkload", "ciliumexternalworkloads");
                Ok(names
                    .iter()
                    .map(|name| DynamicObject::new(name, &resource))
                    .collect())
            }
            None => Err(Error::not_found(
                "customresourcedefinition",
                "ciliumexternalworkloads.cilium.io",
            )),
        }
    }

    async fn get_cilium_endpoint(&self, namespace: &str, name: &str) -> Result<DynamicObject> {
        let state = self.state.lock().unwrap();
        match state.pods.get(&key(namespace, name)) {
            Some(pod) if !pod.spec.as_ref().and_then(|s| s.host_network).unwrap_or(false) => {
                Ok(DynamicObject::new(name, &cilium_resource("CiliumEndpoint", "ciliumendpoints"))
                    .within(namespace))
            }
            _ => Err(Error::not_found("ciliumendpoint", name)),
        }
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
        command: Vec<String>,
    ) -> Result<String> {
        if !self.state.lock().unwrap().pods.contains_key(&key(namespace, pod)) {
            return Err(Error::not_found("pod", pod));
        }
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["nslookup", "localhost", _server] => {
                Ok("Server:\t\t10.0.0.5\nAddress:\t10.0.0.5:53\n\nName:\tlocalhost\nAddress: 127.0.0.1\n".to_string())
            }
            ["nslookup", "kubernetes.default"] => {
                Ok("Server:\t\t10.96.0.10\nAddress:\t10.96.0.10:53\n\nName:\tkubernetes.default.svc.cluster.local\nAddress: 10.96.0.1\n".to_string())
            }
            ["nslookup", service] => {
                let state = self.state.lock().unwrap();
                let ip = state
                    .services
                    .get(&key(namespace, service))
                    .and_then(|s| s.spec.as_ref())
                    .and_then(|s| s.cluster_ip.clone());
                match ip {
                    Some(ip) => Ok(format!(
                        "Server:\t\t10.96.0.10\r\nAddress:\t10.96.0.10:53\r\n\r\nName:\t{}.{}.svc.cluster.local\r\nAddress: {}\r\n",
                        service, namespace, ip
                    )),
                    None => Err(Self::exec_failure(namespace, pod, command.clone(), "NXDOMAIN")),
                }
            }
            ["nc", "-w", "3", "-z", _ip, _port] => Ok(String::new()),
            ["cilium", "bpf", "ipcache", "list", "-o", "json"] => Ok(self.ipcache_dump()),
            _ => Err(Self::exec_failure(namespace, pod, command.clone(), "command not found")),
        }
    }
}
