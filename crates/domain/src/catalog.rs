//! Catalog entities as returned by the cluster membership backend.
//!
//! These are plain values: the DNS engine never mutates a result in place,
//! and health filtering copies the instance list before dropping entries so
//! cached replies are never aliased.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;

/// A member node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub datacenter: String,
    /// Literal IP in the common case, but may be an external hostname.
    pub address: String,
    /// Secondary addresses keyed by tag (`lan`, `wan`, ...).
    #[serde(default)]
    pub tagged_addresses: HashMap<String, String>,
    /// Arbitrary key/value metadata, surfaced as TXT records.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Address and port advertised for a service under a specific tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTaggedAddress {
    pub address: String,
    pub port: u16,
}

/// Relative weights applied to SRV answers by health bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weights {
    pub passing: u16,
    pub warning: u16,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            passing: 1,
            warning: 1,
        }
    }
}

/// A service instance registered on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    /// Empty when the service inherits the node address.
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tagged_addresses: HashMap<String, ServiceTaggedAddress>,
    #[serde(default)]
    pub weights: Weights,
    /// Whether the instance exposes a Connect-capable endpoint.
    #[serde(default)]
    pub connect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
    Unknown,
}

impl HealthStatus {
    /// Severity rank used for worst-of aggregation.
    fn rank(self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Passing => 1,
            HealthStatus::Warning => 2,
            HealthStatus::Critical => 3,
            HealthStatus::Maintenance => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Empty for node-level checks, which apply to every service on the node.
    #[serde(default)]
    pub service_name: String,
    pub status: HealthStatus,
}

/// A node/service pair together with the checks that apply to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckServiceInstance {
    pub node: Node,
    pub service: Service,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

impl CheckServiceInstance {
    /// Worst status among the checks scoped to this service (node-level
    /// checks included). No checks means passing.
    pub fn aggregated_status(&self) -> HealthStatus {
        self.checks
            .iter()
            .filter(|c| c.service_name.is_empty() || c.service_name == self.service.name)
            .map(|c| c.status)
            .max_by_key(|s| s.rank())
            .unwrap_or(HealthStatus::Passing)
    }

    /// SRV weight for the bucket matching the aggregated status.
    pub fn srv_weight(&self) -> u16 {
        match self.aggregated_status() {
            HealthStatus::Warning => self.service.weights.warning,
            HealthStatus::Passing => self.service.weights.passing,
            // Filtered out before synthesis, contribute nothing if they slip through.
            HealthStatus::Critical | HealthStatus::Maintenance => 0,
            HealthStatus::Unknown => 1,
        }
    }
}

/// Drops instances that failed their checks. Critical and maintenance
/// instances are always removed; `only_passing` additionally removes
/// warning instances. Returns a fresh vector, the input is not mutated.
pub fn filter_by_health(
    instances: &[CheckServiceInstance],
    only_passing: bool,
) -> Vec<CheckServiceInstance> {
    instances
        .iter()
        .filter(|instance| match instance.aggregated_status() {
            HealthStatus::Critical | HealthStatus::Maintenance => false,
            HealthStatus::Warning => !only_passing,
            HealthStatus::Passing | HealthStatus::Unknown => true,
        })
        .cloned()
        .collect()
}
