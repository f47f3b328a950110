//! Convergence engine
//!
//! Bounded polling checks that wait for the provisioned topology to become
//! ready and for the data plane to reflect it:
//! - deployment readiness and CiliumEndpoint appearance
//! - pod DNS, service DNS and service readiness
//! - NodePort reachability
//! - ipcache consistency

mod checks;
mod ipcache;
mod validate;
mod wait;

pub use checks::{
    validate_ipcache, verify_service_lookup, wait_for_cilium_endpoint, wait_for_deployments,
    wait_for_ipcache, wait_for_node_ports, wait_for_pod_dns, wait_for_service,
    wait_for_service_dns,
};
pub use ipcache::IpCache;
pub use validate::Validator;
pub use wait::{poll_until, Interrupt, WaitContext, CILIUM_ENDPOINT_PACING, DEFAULT_PACING};
