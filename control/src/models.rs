use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Lifecycle of a workspace (one vCluster instance per workspace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    PendingCreation,
    ConfiguringHnc,
    Running,
    UpdatingPlan,
    UpdatingNodes,
    Starting,
    Stopping,
    Stopped,
    Upgrading,
    BackingUp,
    Restoring,
    Deleting,
    Error,
    Unknown,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::PendingCreation => "PENDING_CREATION",
            WorkspaceStatus::ConfiguringHnc => "CONFIGURING_HNC",
            WorkspaceStatus::Running => "RUNNING",
            WorkspaceStatus::UpdatingPlan => "UPDATING_PLAN",
            WorkspaceStatus::UpdatingNodes => "UPDATING_NODES",
            WorkspaceStatus::Starting => "STARTING",
            WorkspaceStatus::Stopping => "STOPPING",
            WorkspaceStatus::Stopped => "STOPPED",
            WorkspaceStatus::Upgrading => "UPGRADING",
            WorkspaceStatus::BackingUp => "BACKING_UP",
            WorkspaceStatus::Restoring => "RESTORING",
            WorkspaceStatus::Deleting => "DELETING",
            WorkspaceStatus::Error => "ERROR",
            WorkspaceStatus::Unknown => "UNKNOWN",
        }
    }

    pub const ALL: &'static [WorkspaceStatus] = &[
        WorkspaceStatus::PendingCreation,
        WorkspaceStatus::ConfiguringHnc,
        WorkspaceStatus::Running,
        WorkspaceStatus::UpdatingPlan,
        WorkspaceStatus::UpdatingNodes,
        WorkspaceStatus::Starting,
        WorkspaceStatus::Stopping,
        WorkspaceStatus::Stopped,
        WorkspaceStatus::Upgrading,
        WorkspaceStatus::BackingUp,
        WorkspaceStatus::Restoring,
        WorkspaceStatus::Deleting,
        WorkspaceStatus::Error,
        WorkspaceStatus::Unknown,
    ];
}

impl FromStr for WorkspaceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkspaceStatus::ALL
            .iter()
            .find(|v| v.as_str() == s)
            .copied()
            .ok_or(())
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    PendingCreation,
    Active,
    Deleting,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::PendingCreation => "PENDING_CREATION",
            ProjectStatus::Active => "ACTIVE",
            ProjectStatus::Deleting => "DELETING",
            ProjectStatus::Error => "ERROR",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_CREATION" => Ok(ProjectStatus::PendingCreation),
            "ACTIVE" => Ok(ProjectStatus::Active),
            "DELETING" => Ok(ProjectStatus::Deleting),
            "ERROR" => Ok(ProjectStatus::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of durable work items. The exclusive subset serializes
/// workspace-level mutations (at most one non-terminal per workspace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Create,
    SetupHnc,
    Start,
    Stop,
    UpdatePlan,
    UpdateNodes,
    Upgrade,
    Backup,
    Restore,
    Delete,
    ProjectCreate,
    ProjectDelete,
    AppDeploy,
    AppDelete,
    CronjobExecution,
    FunctionBuild,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Create => "CREATE",
            TaskKind::SetupHnc => "SETUP_HNC",
            TaskKind::Start => "START",
            TaskKind::Stop => "STOP",
            TaskKind::UpdatePlan => "UPDATE_PLAN",
            TaskKind::UpdateNodes => "UPDATE_NODES",
            TaskKind::Upgrade => "UPGRADE",
            TaskKind::Backup => "BACKUP",
            TaskKind::Restore => "RESTORE",
            TaskKind::Delete => "DELETE",
            TaskKind::ProjectCreate => "PROJECT_CREATE",
            TaskKind::ProjectDelete => "PROJECT_DELETE",
            TaskKind::AppDeploy => "APP_DEPLOY",
            TaskKind::AppDelete => "APP_DELETE",
            TaskKind::CronjobExecution => "CRONJOB_EXECUTION",
            TaskKind::FunctionBuild => "FUNCTION_BUILD",
        }
    }

    pub const ALL: &'static [TaskKind] = &[
        TaskKind::Create,
        TaskKind::SetupHnc,
        TaskKind::Start,
        TaskKind::Stop,
        TaskKind::UpdatePlan,
        TaskKind::UpdateNodes,
        TaskKind::Upgrade,
        TaskKind::Backup,
        TaskKind::Restore,
        TaskKind::Delete,
        TaskKind::ProjectCreate,
        TaskKind::ProjectDelete,
        TaskKind::AppDeploy,
        TaskKind::AppDelete,
        TaskKind::CronjobExecution,
        TaskKind::FunctionBuild,
    ];

    /// At most one non-terminal task of an exclusive kind may exist per
    /// workspace at a time.
    pub fn is_exclusive(&self) -> bool {
        matches!(
            self,
            TaskKind::Create
                | TaskKind::Delete
                | TaskKind::UpdatePlan
                | TaskKind::Upgrade
                | TaskKind::Backup
                | TaskKind::Restore
                | TaskKind::Start
                | TaskKind::Stop
        )
    }
}

impl FromStr for TaskKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .iter()
            .find(|v| v.as_str() == s)
            .copied()
            .ok_or(())
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Stateless,
    Cronjob,
    Function,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Stateless => "stateless",
            AppType::Cronjob => "cronjob",
            AppType::Function => "function",
        }
    }
}

impl FromStr for AppType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stateless" => Ok(AppType::Stateless),
            "cronjob" => Ok(AppType::Cronjob),
            "function" => Ok(AppType::Function),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Image,
    Git,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Image => "image",
            SourceType::Git => "git",
        }
    }
}

impl FromStr for SourceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(SourceType::Image),
            "git" => Ok(SourceType::Git),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Pending,
    Deploying,
    Running,
    Degraded,
    Deleting,
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Pending => "PENDING",
            AppStatus::Deploying => "DEPLOYING",
            AppStatus::Running => "RUNNING",
            AppStatus::Degraded => "DEGRADED",
            AppStatus::Deleting => "DELETING",
            AppStatus::Error => "ERROR",
        }
    }
}

impl FromStr for AppStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AppStatus::Pending),
            "DEPLOYING" => Ok(AppStatus::Deploying),
            "RUNNING" => Ok(AppStatus::Running),
            "DEGRADED" => Ok(AppStatus::Degraded),
            "DELETING" => Ok(AppStatus::Deleting),
            "ERROR" => Ok(AppStatus::Error),
            _ => Err(()),
        }
    }
}

/// Kubernetes CronJob concurrency semantics, mirrored for manual triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    Allow,
    Forbid,
}

impl ConcurrencyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcurrencyPolicy::Allow => "Allow",
            ConcurrencyPolicy::Forbid => "Forbid",
        }
    }
}

impl FromStr for ConcurrencyPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Allow" => Ok(ConcurrencyPolicy::Allow),
            "Forbid" => Ok(ConcurrencyPolicy::Forbid),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Building,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Building => "building",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
        }
    }
}

impl FromStr for BuildStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(BuildStatus::Building),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Tenant organization owning workspaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub owner_id: String,
    pub billing_ref: Option<String>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Unix epoch timestamp in milliseconds. NULL means not deleted.
    pub deleted_at: Option<i64>,
}

/// The tenant-facing unit that owns exactly one vCluster instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub plan_id: String,
    pub status: WorkspaceStatus,
    /// Set exactly once during CREATE; globally unique; never mutated.
    pub instance_name: Option<String>,
    /// Reference to the exported kubeconfig secret.
    pub kubeconfig_ref: Option<String>,
    pub config: Option<serde_json::Value>,
    pub dedicated_node_config: Option<serde_json::Value>,
    /// Kind of the task that drove the workspace into ERROR, if any.
    pub error_task_kind: Option<TaskKind>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Namespace under a workspace, optionally nested via an HNC anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub parent_project_id: Option<Uuid>,
    pub ns_status: ProjectStatus,
    /// Immutable once assigned.
    pub k8s_namespace: Option<String>,
    pub hnc_anchor_name: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A durable, leased work item processed by the reconciler pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub attempt: i32,
    pub max_attempts: i32,
    pub lease_owner: Option<String>,
    /// Unix epoch ms; lease is void past this instant.
    pub lease_expires_at: Option<i64>,
    /// Earliest instant the task may be leased (backoff delay).
    pub available_at: i64,
    pub cancel_requested: bool,
    pub idempotency_key: Option<String>,
    pub requested_by: String,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub app_type: AppType,
    pub source_type: SourceType,
    pub status: AppStatus,
    pub config: serde_json::Value,
    pub cron_schedule: Option<String>,
    pub concurrency_policy: Option<ConcurrencyPolicy>,
    /// Unix epoch ms of the next scheduled run (cronjob only).
    pub next_execution_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobExecution {
    pub id: Uuid,
    pub application_id: Uuid,
    /// Deterministic one-shot Job name on the host side.
    pub job_name: String,
    pub status: ExecutionStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub logs_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionVersion {
    pub id: Uuid,
    pub application_id: Uuid,
    pub version: i32,
    pub build_status: BuildStatus,
    pub image_uri: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub provider_type: String,
    pub config: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub provider_run_id: String,
    /// Last observed provider status; live reads go through the provider.
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceProviderConfig {
    pub workspace_id: Uuid,
    pub provider_type: String,
    pub config: serde_json::Value,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub credential_type: String,
    pub secret_ref: String,
    pub created_at: i64,
}

// ---- API request/response shapes ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub org_id: Uuid,
    pub name: String,
    pub plan_id: String,
    pub config: Option<serde_json::Value>,
    pub dedicated_node_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePlanRequest {
    pub plan_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodesRequest {
    pub dedicated_node_config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub backup_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub kubernetes_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateScheduleRequest {
    pub cron_schedule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPipelineRequest {
    #[serde(default)]
    pub params: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
    pub owner_id: String,
    pub billing_ref: Option<String>,
}

/// Accepted long-running mutation: poll the task for progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub task_id: Uuid,
    pub task_status: TaskStatus,
    pub workspace_id: Uuid,
    pub workspace_status: WorkspaceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub parent_project_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApplicationRequest {
    pub project_id: Uuid,
    pub name: String,
    pub app_type: AppType,
    pub source_type: SourceType,
    pub config: serde_json::Value,
    pub cron_schedule: Option<String>,
    pub concurrency_policy: Option<ConcurrencyPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateVersionRequest {
    pub version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipelineRequest {
    pub name: String,
    pub provider_type: Option<String>,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCredentialRequest {
    pub name: String,
    pub credential_type: String,
    /// Opaque secret material; never persisted in the relational store.
    pub data: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetProviderConfigRequest {
    pub provider_type: String,
    pub config: serde_json::Value,
}

/// Window of a paginated listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub offset: i64,
    pub limit: i64,
    pub full_count: i64,
    pub truncated: bool,
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_status_round_trips() {
        for s in WorkspaceStatus::ALL {
            assert_eq!(s.as_str().parse::<WorkspaceStatus>(), Ok(*s));
        }
    }

    #[test]
    fn task_kind_round_trips_and_matches_serde() {
        for k in TaskKind::ALL {
            assert_eq!(k.as_str().parse::<TaskKind>(), Ok(*k));
            // The DB string and the JSON representation must agree.
            let json = serde_json::to_value(k).unwrap();
            assert_eq!(json, serde_json::Value::String(k.as_str().to_string()));
        }
    }

    #[test]
    fn workspace_status_matches_serde() {
        for s in WorkspaceStatus::ALL {
            let json = serde_json::to_value(s).unwrap();
            assert_eq!(json, serde_json::Value::String(s.as_str().to_string()));
        }
    }

    #[test]
    fn exclusive_set_is_exactly_the_workspace_mutations() {
        let exclusive: Vec<_> = TaskKind::ALL
            .iter()
            .filter(|k| k.is_exclusive())
            .map(|k| k.as_str())
            .collect();
        assert_eq!(
            exclusive,
            vec![
                "CREATE",
                "START",
                "STOP",
                "UPDATE_PLAN",
                "UPGRADE",
                "BACKUP",
                "RESTORE",
                "DELETE",
            ]
        );
    }

    #[test]
    fn terminal_task_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }
}
