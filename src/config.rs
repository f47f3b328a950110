use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::error::Result;

/// Run parameters for one connectivity-check invocation.
///
/// Loaded once at startup and treated as read-only for the rest of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_test_namespace")]
    pub test_namespace: String,

    /// Kube context of the source cluster; the current context when unset
    #[serde(default)]
    pub kube_context: Option<String>,

    /// Kube context of the destination cluster; empty runs single-cluster
    #[serde(default)]
    pub multi_cluster: String,

    #[serde(default = "default_curl_image")]
    pub curl_image: String,

    #[serde(default = "default_json_mock_image")]
    pub json_mock_image: String,

    #[serde(default = "default_dns_test_server_image")]
    pub dns_test_server_image: String,

    #[serde(default = "default_performance_image")]
    pub performance_image: String,

    #[serde(default)]
    pub perf: bool,

    #[serde(default)]
    pub perf_host_net: bool,

    #[serde(default)]
    pub single_node: bool,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub force_deploy: bool,

    #[serde(default)]
    pub skip_ipcache_check: bool,

    #[serde(default = "default_pod_ready_timeout_secs")]
    pub pod_ready_timeout_secs: u64,

    #[serde(default = "default_cilium_endpoint_timeout_secs")]
    pub cilium_endpoint_timeout_secs: u64,

    #[serde(default = "default_ipcache_timeout_secs")]
    pub ipcache_timeout_secs: u64,

    #[serde(default = "default_service_ready_timeout_secs")]
    pub service_ready_timeout_secs: u64,

    #[serde(default = "default_agent_namespace")]
    pub agent_namespace: String,

    #[serde(default = "default_agent_selector")]
    pub agent_selector: String,

    #[serde(default = "default_agent_container")]
    pub agent_container: String,

    /// Feature overrides, e.g. `HostPort = true`
    #[serde(default)]
    pub features: HashMap<String, bool>,

    /// Render the topology as YAML instead of touching any cluster
    #[serde(default)]
    pub dry_run: bool,

    /// Delete the topology once validation finished
    #[serde(default)]
    pub teardown: bool,

    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_test_namespace() -> String {
    "cilium-test".to_string()
}

fn default_curl_image() -> String {
    "quay.io/cilium/alpine-curl:v1.7.0".to_string()
}

fn default_json_mock_image() -> String {
    "quay.io/cilium/json-mock:v1.3.5".to_string()
}

fn default_dns_test_server_image() -> String {
    "docker.io/coredns/coredns:1.10.1".to_string()
}

fn default_performance_image() -> String {
    "quay.io/cilium/network-perf:a816f935930cb2b40ba43230643da4d5751a5711".to_string()
}

fn default_pod_ready_timeout_secs() -> u64 {
    300
}

fn default_cilium_endpoint_timeout_secs() -> u64 {
    300
}

fn default_ipcache_timeout_secs() -> u64 {
    60
}

fn default_service_ready_timeout_secs() -> u64 {
    30
}

fn default_agent_namespace() -> String {
    "kube-system".to_string()
}

fn default_agent_selector() -> String {
    "k8s-app=cilium".to_string()
}

fn default_agent_container() -> String {
    "cilium-agent".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from an optional file and `CONNCHECK_*` environment variables
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let file = std::env::var("CONNCHECK_CONFIG").unwrap_or_else(|_| "conncheck".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix("CONNCHECK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn is_multi_cluster(&self) -> bool {
        !self.multi_cluster.is_empty()
    }

    /// Whether the topology spans two nodes (or two clusters)
    pub fn spans_nodes(&self) -> bool {
        !self.single_node || self.is_multi_cluster()
    }

    pub fn pod_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_ready_timeout_secs)
    }

    pub fn cilium_endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.cilium_endpoint_timeout_secs)
    }

    pub fn ipcache_timeout(&self) -> Duration {
        Duration::from_secs(self.ipcache_timeout_secs)
    }

    pub fn service_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.service_ready_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            test_namespace: default_test_namespace(),
            kube_context: None,
            multi_cluster: String::new(),
            curl_image: default_curl_image(),
            json_mock_image: default_json_mock_image(),
            dns_test_server_image: default_dns_test_server_image(),
            performance_image: default_performance_image(),
            perf: false,
            perf_host_net: false,
            single_node: false,
            node_selector: BTreeMap::new(),
            force_deploy: false,
            skip_ipcache_check: false,
            pod_ready_timeout_secs: default_pod_ready_timeout_secs(),
            cilium_endpoint_timeout_secs: default_cilium_endpoint_timeout_secs(),
            ipcache_timeout_secs: default_ipcache_timeout_secs(),
            service_ready_timeout_secs: default_service_ready_timeout_secs(),
            agent_namespace: default_agent_namespace(),
            agent_selector: default_agent_selector(),
            agent_container: default_agent_container(),
            features: HashMap::new(),
            dry_run: false,
            teardown: false,
            log_format: default_log_format(),
        }
    }
}
