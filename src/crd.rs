use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cloud providers the driver layer knows how to speak to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Gcp,
    Aws,
    Azure,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudDescriptor {
    pub provider: CloudProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Legacy alias for `workloadRef` that only ever pointed at a Deployment.
/// Kept so existing manifests written against the old field name keep
/// working; normalized away by [`NetIPAllocationSpec::effective_workload_ref`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDeploymentRef {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_reconcile_interval_seconds() -> u64 {
    30
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "netinfra.darkbrains.com",
    version = "v1alpha1",
    kind = "NetIPAllocation",
    plural = "netipallocations",
    status = "NetIPAllocationStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct NetIPAllocationSpec {
    /// Pre-reserved public IPs this pool is responsible for keeping bound
    /// to a schedulable node. Never allocated or released by this
    /// controller, only attached/detached.
    pub reserved_ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_ref: Option<WorkloadRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_ref: Option<LegacyDeploymentRef>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    pub cloud: CloudDescriptor,

    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,
}

impl NetIPAllocationSpec {
    /// Resolves `workloadRef`/`deploymentRef` into a single reference,
    /// preferring the modern field. Returns `None` if the pool has no
    /// workload affinity (eviction deferral never applies).
    pub fn effective_workload_ref(&self) -> Option<WorkloadRef> {
        if let Some(r) = &self.workload_ref {
            return Some(r.clone());
        }
        self.deployment_ref.as_ref().map(|r| WorkloadRef {
            kind: WorkloadKind::Deployment,
            name: r.name.clone(),
            namespace: r.namespace.clone(),
        })
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.reserved_ips.is_empty() {
            return Err(SpecError::EmptyReservedIps);
        }
        let mut seen = std::collections::HashSet::new();
        for ip in &self.reserved_ips {
            if !seen.insert(ip.as_str()) {
                return Err(SpecError::DuplicateReservedIp(ip.clone()));
            }
        }
        if self.reconcile_interval_seconds == 0 {
            return Err(SpecError::NonPositiveInterval);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("reservedIps must not be empty")]
    EmptyReservedIps,
    #[error("reservedIps contains a duplicate entry: {0}")]
    DuplicateReservedIp(String),
    #[error("reconcileIntervalSeconds must be positive")]
    NonPositiveInterval,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetIPAllocationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unattached: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
