use clap::{Parser, Subcommand};
use std::{collections::HashMap, time::Duration};

use atoll_common::args::{MetricsArgs, PostgresArgs};

use crate::{
    models::TaskKind,
    reconciler::EngineConfig,
    tasks::QueueConfig,
};

#[derive(Parser, Debug)]
#[command(name = "atoll-control")]
#[command(about = "Workspace provisioning and lifecycle engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane HTTP server
    Server(ServerArgs),

    /// Run the reconciler worker pool (lease reaper + cron scheduler)
    Worker(WorkerArgs),

    /// Workspace operations
    Workspace(WorkspaceCommandArgs),

    /// Project operations
    Project(ProjectCommandArgs),

    /// Task operations
    Task(TaskCommandArgs),

    /// Check service health
    Health(HealthArgs),
}

/// Engine tuning shared by the server (enqueue defaults) and the
/// worker pool.
#[derive(Parser, Debug, Clone)]
pub struct EngineArgs {
    /// Worker count; 0 means 2x the available parallelism
    #[arg(long, env = "WORKER_COUNT", default_value_t = 0)]
    pub worker_count: usize,

    /// How long one lease is valid without a heartbeat (e.g. 60s)
    #[arg(long, env = "LEASE_DURATION", default_value = "60s")]
    pub lease_duration: String,

    /// Max delivery attempts before a task is dead-lettered
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: i32,

    /// Base retry backoff (e.g. 2s)
    #[arg(long, env = "BASE_BACKOFF", default_value = "2s")]
    pub base_backoff: String,

    /// Retry backoff ceiling (e.g. 5m)
    #[arg(long, env = "MAX_BACKOFF", default_value = "5m")]
    pub max_backoff: String,

    /// How often expired leases are reaped
    #[arg(long, env = "REAP_INTERVAL", default_value = "15s")]
    pub reap_interval: String,

    /// Cron scheduler tick interval
    #[arg(long, env = "CRON_TICK_INTERVAL", default_value = "20s")]
    pub cron_tick_interval: String,

    /// Per-call timeout against the host cluster
    #[arg(long, env = "CALL_TIMEOUT", default_value = "30s")]
    pub call_timeout: String,

    /// Whole-task timeout (per attempt)
    #[arg(long, env = "TASK_TIMEOUT", default_value = "30m")]
    pub task_timeout: String,

    /// Per-kind concurrency ceilings, repeatable: --kind-concurrency BACKUP=2
    #[arg(long = "kind-concurrency", env = "KIND_CONCURRENCY", value_delimiter = ',')]
    pub kind_concurrency: Vec<String>,
}

fn duration(what: &str, value: &str) -> anyhow::Result<Duration> {
    parse_duration::parse(value)
        .map_err(|e| anyhow::anyhow!("invalid {what} duration {value:?}: {e}"))
}

pub fn parse_kind_concurrency(entries: &[String]) -> anyhow::Result<HashMap<TaskKind, usize>> {
    let mut out = HashMap::new();
    for entry in entries {
        let (kind, limit) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected KIND=N, got {entry:?}"))?;
        let kind: TaskKind = kind
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown task kind {kind:?}"))?;
        let limit: usize = limit
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("bad concurrency in {entry:?}: {e}"))?;
        out.insert(kind, limit);
    }
    Ok(out)
}

impl EngineArgs {
    pub fn queue_config(&self) -> anyhow::Result<QueueConfig> {
        Ok(QueueConfig {
            max_attempts: self.max_attempts,
            lease_duration: duration("lease", &self.lease_duration)?,
            base_backoff: duration("base backoff", &self.base_backoff)?,
            max_backoff: duration("max backoff", &self.max_backoff)?,
        })
    }

    pub fn call_timeout(&self) -> anyhow::Result<Duration> {
        duration("call timeout", &self.call_timeout)
    }

    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let defaults = EngineConfig::default();
        Ok(EngineConfig {
            worker_count: if self.worker_count == 0 {
                defaults.worker_count
            } else {
                self.worker_count
            },
            queue: self.queue_config()?,
            reap_interval: duration("reap interval", &self.reap_interval)?,
            cron_tick_interval: duration("cron tick", &self.cron_tick_interval)?,
            default_task_timeout: duration("task timeout", &self.task_timeout)?,
            kind_concurrency: parse_kind_concurrency(&self.kind_concurrency)?,
            ..defaults
        })
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Host namespace holding tenant secrets
    #[arg(long, env = "VAULT_NAMESPACE", default_value = "atoll-secrets")]
    pub vault_namespace: String,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub metrics: MetricsArgs,

    #[clap(flatten)]
    pub engine: EngineArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct WorkerArgs {
    /// Host namespace holding tenant secrets
    #[arg(long, env = "VAULT_NAMESPACE", default_value = "atoll-secrets")]
    pub vault_namespace: String,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub metrics: MetricsArgs,

    #[clap(flatten)]
    pub engine: EngineArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct WorkspaceCommandArgs {
    #[command(subcommand)]
    pub command: WorkspaceCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum WorkspaceCommands {
    /// Create a workspace
    Create(CreateWorkspaceArgs),
    /// Get a workspace by ID
    Get(IdArgs),
    /// List workspaces
    List(ListArgs),
    /// Start a stopped workspace
    Start(IdArgs),
    /// Stop a running workspace
    Stop(IdArgs),
    /// Delete a workspace
    Delete(IdArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ProjectCommandArgs {
    #[command(subcommand)]
    pub command: ProjectCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProjectCommands {
    /// Create a project in a workspace
    Create(CreateProjectArgs),
    /// List projects in a workspace
    List(ListProjectsArgs),
    /// Delete a project
    Delete(IdArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct TaskCommandArgs {
    #[command(subcommand)]
    pub command: TaskCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TaskCommands {
    /// Get a task by ID
    Get(IdArgs),
    /// Request cooperative cancellation of a task
    Cancel(IdArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct EndpointArgs {
    /// Control plane endpoint
    #[arg(long, env = "ATOLL_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Caller identity recorded on enqueued tasks
    #[arg(long, env = "ATOLL_USER")]
    pub user: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct IdArgs {
    #[clap(flatten)]
    pub endpoint: EndpointArgs,

    /// Resource UUID
    #[arg(long)]
    pub id: String,
}

#[derive(Parser, Debug, Clone)]
pub struct ListArgs {
    #[clap(flatten)]
    pub endpoint: EndpointArgs,

    #[arg(long, default_value_t = 0)]
    pub offset: i64,

    #[arg(long, default_value_t = 50)]
    pub limit: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct CreateWorkspaceArgs {
    #[clap(flatten)]
    pub endpoint: EndpointArgs,

    /// Owning organization UUID
    #[arg(long)]
    pub org_id: String,

    /// Workspace name
    #[arg(long)]
    pub name: String,

    /// Billing plan
    #[arg(long, default_value = "starter")]
    pub plan: String,
}

#[derive(Parser, Debug, Clone)]
pub struct CreateProjectArgs {
    #[clap(flatten)]
    pub endpoint: EndpointArgs,

    /// Workspace UUID
    #[arg(long)]
    pub workspace_id: String,

    /// Project name
    #[arg(long)]
    pub name: String,

    /// Optional parent project UUID
    #[arg(long)]
    pub parent: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ListProjectsArgs {
    #[clap(flatten)]
    pub endpoint: EndpointArgs,

    /// Workspace UUID
    #[arg(long)]
    pub workspace_id: String,

    #[arg(long, default_value_t = 0)]
    pub offset: i64,

    #[arg(long, default_value_t = 50)]
    pub limit: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    #[clap(flatten)]
    pub endpoint: EndpointArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_concurrency_entries_parse() {
        let parsed = parse_kind_concurrency(&[
            "BACKUP=2".to_string(),
            "CRONJOB_EXECUTION=8".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed.get(&TaskKind::Backup), Some(&2));
        assert_eq!(parsed.get(&TaskKind::CronjobExecution), Some(&8));
    }

    #[test]
    fn bad_kind_concurrency_is_rejected() {
        assert!(parse_kind_concurrency(&["NOPE=1".to_string()]).is_err());
        assert!(parse_kind_concurrency(&["BACKUP".to_string()]).is_err());
        assert!(parse_kind_concurrency(&["BACKUP=x".to_string()]).is_err());
    }
}
