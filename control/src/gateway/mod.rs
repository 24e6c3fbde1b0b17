//! Capability interface to the host Kubernetes cluster.
//!
//! The reconciler only ever sees this trait; the kube-backed
//! implementation lives in [`kube`] and tests substitute hand-written
//! fakes. Every mutating operation takes a deterministic name so a
//! repeated call converges on the same host object.

use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::Result;
use atoll_types::VClusterPhase;

pub mod kube;

/// Desired state of one vCluster instance.
#[derive(Debug, Clone, PartialEq)]
pub struct VClusterSpecReq {
    pub workspace_id: Uuid,
    pub instance_name: String,
    pub namespace: String,
    pub plan: String,
    pub kubernetes_version: String,
    pub paused: bool,
    pub resources: Option<serde_json::Value>,
    pub dedicated_node_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct VClusterHandle {
    pub instance_name: String,
    /// `namespace/secret` reference to the exported kubeconfig.
    pub kubeconfig_ref: String,
}

#[derive(Debug, Clone)]
pub struct VClusterObserved {
    pub phase: VClusterPhase,
    pub message: Option<String>,
    pub conditions: Vec<(String, String)>,
}

impl VClusterObserved {
    pub fn is_running(&self) -> bool {
        self.phase == VClusterPhase::Running
    }

    pub fn is_paused(&self) -> bool {
        self.phase == VClusterPhase::Paused
    }
}

#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ContainerUsage {
    pub name: String,
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone)]
pub struct PodMetricsEntry {
    pub pod: String,
    pub containers: Vec<ContainerUsage>,
}

#[derive(Debug, Clone, Default)]
pub struct QuotaStatus {
    pub hard: BTreeMap<String, String>,
    pub used: BTreeMap<String, String>,
}

/// Desired state of a stateless app's Deployment + Service pair.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkloadSpecReq {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: i32,
    pub container_port: i32,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ObservedWorkload {
    pub replicas: i32,
    pub ready_replicas: i32,
}

/// One-shot Job request (cron executions and function builds).
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSpecReq {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Secret names mounted as env sources (registry/git credentials).
    pub secret_refs: Vec<String>,
    pub backoff_limit: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Active,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ObservedJob {
    pub state: JobState,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    InProgress,
    Completed,
    Failed,
}

#[async_trait]
pub trait HostGateway: Send + Sync {
    // -- vCluster lifecycle --
    async fn apply_vcluster(&self, spec: &VClusterSpecReq) -> Result<VClusterHandle>;
    async fn delete_vcluster(&self, namespace: &str, instance_name: &str) -> Result<()>;
    async fn get_vcluster_status(
        &self,
        namespace: &str,
        instance_name: &str,
    ) -> Result<VClusterObserved>;
    async fn export_kubeconfig(&self, namespace: &str, instance_name: &str) -> Result<Vec<u8>>;

    // -- namespaces & hierarchy --
    async fn apply_namespace_with_anchor(&self, parent: &str, name: &str) -> Result<()>;
    async fn namespace_active(&self, name: &str) -> Result<bool>;
    async fn delete_namespace_anchor(&self, parent: &str, name: &str) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;
    async fn get_namespace_resource_quota(&self, namespace: &str) -> Result<QuotaStatus>;

    // -- observation --
    async fn get_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetricsEntry>>;
    async fn check_component_health(&self) -> Result<BTreeMap<String, ComponentHealth>>;

    // -- workloads --
    async fn apply_workload(&self, spec: &WorkloadSpecReq) -> Result<()>;
    async fn observe_workload(&self, namespace: &str, name: &str) -> Result<ObservedWorkload>;
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;

    // -- one-shot jobs --
    async fn create_job(&self, spec: &JobSpecReq) -> Result<()>;
    async fn observe_job(&self, namespace: &str, name: &str) -> Result<ObservedJob>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    // -- snapshots (velero-backed) --
    async fn create_snapshot(&self, namespace: &str, snapshot_name: &str) -> Result<String>;
    async fn get_snapshot_state(&self, snapshot_ref: &str) -> Result<SnapshotState>;
    async fn restore_snapshot(&self, namespace: &str, snapshot_ref: &str) -> Result<String>;
    async fn get_restore_state(&self, restore_ref: &str) -> Result<SnapshotState>;
}
