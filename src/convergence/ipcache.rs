//! Parsed dump of the agent's address-to-identity cache

use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::models::Pod;

/// Prefix (`10.0.1.5/32`) to entry strings (`identity=1234 encryptkey=0 ...`)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct IpCache(HashMap<String, Vec<String>>);

impl IpCache {
    pub fn parse(dump: &str) -> Result<Self> {
        Ok(serde_json::from_str(dump)?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Numeric identity of the host prefix covering `ip`
    pub fn find_identity(&self, ip: &str) -> Result<u32> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| Error::Validation(format!("invalid pod IP {:?}", ip)))?;
        let prefix = match addr {
            IpAddr::V4(_) => format!("{}/32", ip),
            IpAddr::V6(_) => format!("{}/128", ip),
        };

        let entry = self
            .0
            .get(&prefix)
            .and_then(|entries| entries.first())
            .ok_or_else(|| Error::Validation(format!("{} not found in ipcache", prefix)))?;

        entry
            .split_whitespace()
            .find_map(|field| field.strip_prefix("identity="))
            .ok_or_else(|| {
                Error::Validation(format!("no identity in ipcache entry {:?} for {}", entry, prefix))
            })?
            .parse()
            .map_err(|_| Error::Validation(format!("malformed identity in ipcache entry {:?}", entry)))
    }

    /// Identity of a pod. Every one of its IPs must be present.
    pub fn find_pod_id(&self, pod: &Pod) -> Result<u32> {
        let ips = pod.ips();
        let mut identity = None;
        for ip in &ips {
            identity = Some(self.find_identity(ip)?);
        }
        identity.ok_or_else(|| Error::Validation(format!("pod {} has no IP yet", pod)))
    }
}
