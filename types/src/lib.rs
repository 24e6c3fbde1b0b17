use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VClusterResources {
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub storage: Option<String>,
}

/// Placement of the virtual control plane onto tenant-dedicated nodes.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DedicatedNodes {
    pub node_selector: Option<BTreeMap<String, String>>,
    pub taint_key: Option<String>,
}

fn default_kubernetes_version() -> String {
    "1.31".to_string()
}

fn default_sync_replicas() -> u32 {
    1
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "atoll.dev",
    version = "v1",
    kind = "VCluster",
    plural = "vclusters",
    derive = "PartialEq",
    status = "VClusterStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct VClusterSpec {
    /// Billing plan the instance is sized from.
    pub plan: String,
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,
    #[serde(default = "default_sync_replicas")]
    pub sync_replicas: u32,
    /// A paused instance keeps its state but scales the virtual control
    /// plane to zero.
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub resources: VClusterResources,
    #[serde(default)]
    pub dedicated_nodes: Option<DedicatedNodes>,
    /// Opaque chart value overrides passed through to the instance.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct VClusterStatus {
    pub phase: VClusterPhase,
    pub message: Option<String>,
    /// Name of the generated kubeconfig Secret in the host namespace.
    pub kubeconfig_secret: Option<String>,
    pub ready_replicas: u32,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum VClusterPhase {
    #[default]
    Pending,
    Deploying,
    Running,
    Paused,
    Upgrading,
    Failed,
    Unknown,
}

impl FromStr for VClusterPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(VClusterPhase::Pending),
            "Deploying" => Ok(VClusterPhase::Deploying),
            "Running" => Ok(VClusterPhase::Running),
            "Paused" => Ok(VClusterPhase::Paused),
            "Upgrading" => Ok(VClusterPhase::Upgrading),
            "Failed" => Ok(VClusterPhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for VClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VClusterPhase::Pending => write!(f, "Pending"),
            VClusterPhase::Deploying => write!(f, "Deploying"),
            VClusterPhase::Running => write!(f, "Running"),
            VClusterPhase::Paused => write!(f, "Paused"),
            VClusterPhase::Upgrading => write!(f, "Upgrading"),
            VClusterPhase::Failed => write!(f, "Failed"),
            VClusterPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Coordinates of the HNC subnamespace anchor CRD. The control plane does
/// not own this type, so it is addressed through the dynamic API.
pub mod hnc {
    use kube::api::ApiResource;
    use kube::core::GroupVersionKind;

    pub const GROUP: &str = "hnc.x-k8s.io";
    pub const VERSION: &str = "v1alpha2";
    pub const KIND: &str = "SubnamespaceAnchor";

    pub fn api_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(GROUP, VERSION, KIND),
            "subnamespaceanchors",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_str() {
        for phase in [
            VClusterPhase::Pending,
            VClusterPhase::Deploying,
            VClusterPhase::Running,
            VClusterPhase::Paused,
            VClusterPhase::Upgrading,
            VClusterPhase::Failed,
        ] {
            assert_eq!(phase.to_string().parse::<VClusterPhase>(), Ok(phase));
        }
    }
}
