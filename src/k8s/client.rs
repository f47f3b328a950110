//! Kubernetes client abstraction for the connectivity check
//!
//! [`ClusterApi`] is the seam every provisioning, convergence and teardown
//! step goes through. [`K8sClient`] implements it against a live cluster.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Node, Pod, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{Api, AttachParams, DeleteParams, DynamicObject, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    client::UpgradeConnectionError,
    core::ErrorResponse,
    discovery::ApiResource,
    Client, Config,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::models::ClusterTarget;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

fn cilium_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: "cilium.io".to_string(),
        version: "v2".to_string(),
        api_version: "cilium.io/v2".to_string(),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Operations the connectivity check needs from one cluster.
///
/// Getters report a missing object as [`Error::NotFound`] and creators
/// report a name collision as [`Error::AlreadyExists`], whatever the
/// backing implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Name of the cluster (kube context) this client talks to
    fn cluster_name(&self) -> String;

    async fn get_namespace(&self, name: &str) -> Result<Namespace>;
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<Deployment>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet>;
    async fn create_daemon_set(&self, namespace: &str, daemon_set: &DaemonSet)
        -> Result<DaemonSet>;
    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<ConfigMap>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount>;
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress>;
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress>;
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;
    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Cluster-scoped CiliumExternalWorkload objects
    async fn list_cilium_external_workloads(&self) -> Result<Vec<DynamicObject>>;

    /// The CiliumEndpoint object the agent creates for a pod
    async fn get_cilium_endpoint(&self, namespace: &str, name: &str) -> Result<DynamicObject>;

    /// Run a command in one container of a pod and return its stdout.
    ///
    /// A non-successful exit status or any stderr output is an
    /// [`Error::Exec`] carrying the captured stdout.
    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String>;

    /// Succeeds once every desired replica of the deployment is ready
    async fn check_deployment_status(&self, namespace: &str, name: &str) -> Result<()> {
        let deployment = self.get_deployment(namespace, name).await?;
        deployment_ready(&deployment)
    }
}

/// Whether a deployment has converged: the controller observed the latest
/// generation and every desired replica is updated, available and ready.
pub fn deployment_ready(deployment: &Deployment) -> Result<()> {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return Err(Error::NotReady(format!("deployment {} has no status yet", name)));
    };

    if let (Some(generation), Some(observed)) =
        (deployment.metadata.generation, status.observed_generation)
    {
        if observed < generation {
            return Err(Error::NotReady(format!(
                "deployment {} update not observed yet (generation {}, observed {})",
                name, generation, observed
            )));
        }
    }

    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);

    if updated < desired {
        return Err(Error::NotReady(format!(
            "deployment {}: {} of {} replicas updated",
            name, updated, desired
        )));
    }
    if total > updated {
        return Err(Error::NotReady(format!(
            "deployment {}: {} old replicas pending termination",
            name,
            total - updated
        )));
    }
    if available < desired || ready < desired {
        return Err(Error::NotReady(format!(
            "deployment {}: {} of {} replicas available, {} ready",
            name, available, desired, ready
        )));
    }
    Ok(())
}

/// [`ClusterApi`] backed by a kube client for one kube context
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    cluster_name: String,
}

impl K8sClient {
    /// Connect using the given kube context, or the current one when unset
    #[instrument(skip_all, fields(context = ?context))]
    pub async fn connect(context: Option<&str>) -> Result<Self> {
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };
        let mut config = match context {
            Some(_) => Config::from_kubeconfig(&options).await.map_err(|e| {
                Error::Validation(format!("failed to load kubeconfig: {}", e))
            })?,
            None => Config::infer()
                .await
                .map_err(|e| Error::Validation(format!("failed to infer kube config: {}", e)))?,
        };
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        let cluster_name = match context {
            Some(ctx) => ctx.to_string(),
            None => Kubeconfig::read()
                .ok()
                .and_then(|k| k.current_context)
                .unwrap_or_else(|| "in-cluster".to_string()),
        };

        let client = Client::try_from(config)?;
        info!(cluster = %cluster_name, "Connected to Kubernetes cluster");

        Ok(Self {
            client,
            cluster_name,
        })
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Non-interactive exec capturing both output streams. An empty container
/// name leaves the choice to the API server.
fn attach_params(container: &str) -> AttachParams {
    AttachParams {
        container: (!container.is_empty()).then(|| container.to_string()),
        stdin: false,
        stdout: true,
        stderr: true,
        tty: false,
        ..Default::default()
    }
}

/// Map a failure to attach to a pod.
///
/// Requests the API server rejects keep their status so that forbidden or
/// missing pods are not retried like a dropped exec stream.
fn attach_error(pod: &str, err: kube::Error, exec_error: impl FnOnce(String) -> Error) -> Error {
    match err {
        kube::Error::Api(_) => Error::from_kube("pod", pod, err),
        kube::Error::UpgradeConnection(UpgradeConnectionError::ProtocolSwitch(status))
            if status.is_client_error() =>
        {
            let response = ErrorResponse {
                status: "Failure".to_string(),
                message: format!("exec upgrade rejected with {}", status),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                code: status.as_u16(),
            };
            Error::from_kube("pod", pod, kube::Error::Api(response))
        }
        other => exec_error(other.to_string()),
    }
}

fn list_params(selector: &str) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    }
}

#[async_trait]
impl ClusterApi for K8sClient {
    fn cluster_name(&self) -> String {
        self.cluster_name.clone()
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| Error::from_kube("namespace", name, e))
    }

    #[instrument(skip(self, namespace), fields(name = ?namespace.metadata.name))]
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let name = namespace.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Namespace> = Api::all(self.client.clone());
        let created = api
            .create(&PostParams::default(), namespace)
            .await
            .map_err(|e| Error::from_kube("namespace", name, e))?;
        info!(name, "Created namespace");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("namespace", name, e))?;
        debug!(name, "Deleted namespace");
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.namespaced::<Deployment>(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube("deployment", name, e))
    }

    #[instrument(skip(self, deployment), fields(name = ?deployment.metadata.name))]
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        let created = self
            .namespaced::<Deployment>(namespace)
            .create(&PostParams::default(), deployment)
            .await
            .map_err(|e| Error::from_kube("deployment", name, e))?;
        info!(name, "Created deployment");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced::<Deployment>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("deployment", name, e))?;
        debug!(name, "Deleted deployment");
        Ok(())
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        self.namespaced::<DaemonSet>(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube("daemonset", name, e))
    }

    #[instrument(skip(self, daemon_set), fields(name = ?daemon_set.metadata.name))]
    async fn create_daemon_set(&self, namespace: &str, daemon_set: &DaemonSet) -> Result<DaemonSet> {
        let name = daemon_set.metadata.name.as_deref().unwrap_or_default();
        let created = self
            .namespaced::<DaemonSet>(namespace)
            .create(&PostParams::default(), daemon_set)
            .await
            .map_err(|e| Error::from_kube("daemonset", name, e))?;
        info!(name, "Created daemonset");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced::<DaemonSet>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("daemonset", name, e))?;
        debug!(name, "Deleted daemonset");
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.namespaced::<Service>(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube("service", name, e))
    }

    #[instrument(skip(self, service), fields(name = ?service.metadata.name))]
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let name = service.metadata.name.as_deref().unwrap_or_default();
        let created = self
            .namespaced::<Service>(namespace)
            .create(&PostParams::default(), service)
            .await
            .map_err(|e| Error::from_kube("service", name, e))?;
        info!(name, "Created service");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced::<Service>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("service", name, e))?;
        debug!(name, "Deleted service");
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        self.namespaced::<ConfigMap>(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube("configmap", name, e))
    }

    #[instrument(skip(self, config_map), fields(name = ?config_map.metadata.name))]
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        let created = self
            .namespaced::<ConfigMap>(namespace)
            .create(&PostParams::default(), config_map)
            .await
            .map_err(|e| Error::from_kube("configmap", name, e))?;
        info!(name, "Created configmap");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced::<ConfigMap>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("configmap", name, e))?;
        debug!(name, "Deleted configmap");
        Ok(())
    }

    #[instrument(skip(self, service_account), fields(name = ?service_account.metadata.name))]
    async fn create_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        let name = service_account.metadata.name.as_deref().unwrap_or_default();
        let created = self
            .namespaced::<ServiceAccount>(namespace)
            .create(&PostParams::default(), service_account)
            .await
            .map_err(|e| Error::from_kube("serviceaccount", name, e))?;
        info!(name, "Created service account");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced::<ServiceAccount>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("serviceaccount", name, e))?;
        debug!(name, "Deleted service account");
        Ok(())
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress> {
        self.namespaced::<Ingress>(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube("ingress", name, e))
    }

    #[instrument(skip(self, ingress), fields(name = ?ingress.metadata.name))]
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        let name = ingress.metadata.name.as_deref().unwrap_or_default();
        let created = self
            .namespaced::<Ingress>(namespace)
            .create(&PostParams::default(), ingress)
            .await
            .map_err(|e| Error::from_kube("ingress", name, e))?;
        info!(name, "Created ingress");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced::<Ingress>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("ingress", name, e))?;
        debug!(name, "Deleted ingress");
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .namespaced::<Pod>(namespace)
            .list(&list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        let list = self
            .namespaced::<Service>(namespace)
            .list(&list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_cilium_external_workloads(&self) -> Result<Vec<DynamicObject>> {
        let ar = cilium_resource("CiliumExternalWorkload", "ciliumexternalworkloads");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube("ciliumexternalworkload", "", e))?;
        Ok(list.items)
    }

    async fn get_cilium_endpoint(&self, namespace: &str, name: &str) -> Result<DynamicObject> {
        let ar = cilium_resource("CiliumEndpoint", "ciliumendpoints");
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        api.get(name)
            .await
            .map_err(|e| Error::from_kube("ciliumendpoint", name, e))
    }

    #[instrument(skip(self, command), fields(command = ?command))]
    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String> {
        let ap = attach_params(container);

        let exec_error = |message: String, stdout: String| Error::Exec {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            command: command.clone(),
            message,
            stdout,
        };

        let mut attached = self
            .namespaced::<Pod>(namespace)
            .exec(pod, command.clone(), &ap)
            .await
            .map_err(|e| attach_error(pod, e, |message| exec_error(message, String::new())))?;

        let status = attached.take_status();
        let (stdout_reader, stderr_reader) = (attached.stdout(), attached.stderr());

        let mut stdout = String::new();
        let mut stderr = String::new();
        let read_stdout = async {
            match stdout_reader {
                Some(mut r) => r.read_to_string(&mut stdout).await.map(|_| ()),
                None => Ok(()),
            }
        };
        let read_stderr = async {
            match stderr_reader {
                Some(mut r) => r.read_to_string(&mut stderr).await.map(|_| ()),
                None => Ok(()),
            }
        };
        let (out, err) = tokio::join!(read_stdout, read_stderr);
        out?;
        err?;

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() != Some("Success") {
                    let message = status
                        .message
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| stderr.clone());
                    return Err(exec_error(message, stdout));
                }
            }
        }

        if !stderr.is_empty() {
            return Err(exec_error(stderr, stdout));
        }

        debug!(pod, container, "Command succeeded");
        Ok(stdout)
    }
}

/// The source and destination cluster clients of a run.
///
/// In single-cluster mode both point at the same client.
#[derive(Clone)]
pub struct ClusterClients {
    src: Arc<dyn ClusterApi>,
    dst: Arc<dyn ClusterApi>,
}

impl ClusterClients {
    pub fn single(client: Arc<dyn ClusterApi>) -> Self {
        Self {
            src: client.clone(),
            dst: client,
        }
    }

    pub fn multi(src: Arc<dyn ClusterApi>, dst: Arc<dyn ClusterApi>) -> Self {
        Self { src, dst }
    }

    pub fn src(&self) -> &Arc<dyn ClusterApi> {
        &self.src
    }

    pub fn dst(&self) -> &Arc<dyn ClusterApi> {
        &self.dst
    }

    pub fn get(&self, target: ClusterTarget) -> &Arc<dyn ClusterApi> {
        match target {
            ClusterTarget::Src => &self.src,
            ClusterTarget::Dst => &self.dst,
        }
    }

    /// Distinct clients, source first
    pub fn clients(&self) -> Vec<Arc<dyn ClusterApi>> {
        if Arc::ptr_eq(&self.src, &self.dst) {
            vec![self.src.clone()]
        } else {
            vec![self.src.clone(), self.dst.clone()]
        }
    }
}
