use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use strum::{Display, EnumString};
use tracing::warn;

/// Cluster capabilities that change which workloads get provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Feature {
    HostPort,
    IngressController,
    NodeWithoutCilium,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStatus {
    pub enabled: bool,
}

/// Read-only view of the detected cluster features.
///
/// Features that were never reported read as disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet(HashMap<Feature, FeatureStatus>);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, feature: Feature, enabled: bool) -> Self {
        self.0.insert(feature, FeatureStatus { enabled });
        self
    }

    pub fn enabled(&self, feature: Feature) -> bool {
        self.0.get(&feature).map(|s| s.enabled).unwrap_or(false)
    }

    /// Build from the `features` overrides of the run configuration
    pub fn from_overrides(overrides: &HashMap<String, bool>) -> Self {
        let mut set = Self::new();
        for (name, enabled) in overrides {
            match Feature::from_str(name) {
                Ok(feature) => set = set.with(feature, *enabled),
                Err(_) => warn!(feature = %name, "Ignoring unknown feature override"),
            }
        }
        set
    }
}
