//! Reconciler worker pool.
//!
//! Workers lease tasks, drive one state-machine transition each, and
//! report the outcome back to the queue. Handlers are idempotent: any
//! step may be re-run after a crash or lost lease and must converge.

use deadpool_postgres::Pool;
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    db::workspaces,
    error::{Error, Result},
    fsm,
    gateway::HostGateway,
    models::{Task, TaskKind},
    scheduler,
    tasks::{QueueConfig, queue},
    vault::SecretVault,
};

pub mod application;
pub mod cronjob;
pub mod function;
pub mod project;
pub mod workspace;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub queue: QueueConfig,
    pub reap_interval: Duration,
    pub cron_tick_interval: Duration,
    /// Bounded attempts for readiness polls inside one task execution.
    pub readiness_attempts: u32,
    pub poll_base: Duration,
    pub poll_cap: Duration,
    pub default_task_timeout: Duration,
    pub task_timeouts: HashMap<TaskKind, Duration>,
    pub kind_concurrency: HashMap<TaskKind, usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4),
            queue: QueueConfig::default(),
            reap_interval: Duration::from_secs(15),
            cron_tick_interval: Duration::from_secs(20),
            readiness_attempts: 30,
            poll_base: Duration::from_millis(500),
            poll_cap: Duration::from_secs(10),
            default_task_timeout: Duration::from_secs(30 * 60),
            task_timeouts: HashMap::new(),
            kind_concurrency: HashMap::new(),
        }
    }
}

impl EngineConfig {
    fn timeout_for(&self, kind: TaskKind) -> Duration {
        self.task_timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_task_timeout)
    }
}

/// Dependencies handed to every task handler.
pub struct TaskCtx {
    pub pool: Pool,
    pub gateway: Arc<dyn HostGateway>,
    pub vault: Arc<dyn SecretVault>,
    pub cfg: EngineConfig,
    /// Cancelled when the lease is lost or the process is shutting down.
    pub abort: CancellationToken,
}

impl TaskCtx {
    /// Cooperative cancellation point, called between phases and
    /// between readiness polls.
    pub async fn checkpoint(&self, task_id: Uuid) -> Result<()> {
        if self.abort.is_cancelled() {
            return Err(Error::Transient(
                "lease lost or worker shutting down".into(),
            ));
        }
        let client = self.pool.get().await?;
        if queue::cancel_requested(&**client, task_id).await? {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Best-effort progress event; never fails the task.
    pub async fn progress(&self, task_id: Uuid, message: &str, fields: serde_json::Value) {
        let Ok(client) = self.pool.get().await else {
            return;
        };
        if let Err(e) = queue::record_progress(&**client, task_id, message, fields).await {
            tracing::debug!(%task_id, error = %e, "failed to record progress");
        }
    }

    /// Poll `pred` with jittered backoff until it holds, the attempt
    /// allowance runs out, or the task is cancelled.
    pub async fn poll_until<F, Fut>(&self, task_id: Uuid, what: &str, mut pred: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        for attempt in 0..self.cfg.readiness_attempts {
            self.checkpoint(task_id).await?;
            if pred().await? {
                return Ok(());
            }
            if atoll_common::backoff::wait(&self.abort, self.cfg.poll_base, self.cfg.poll_cap, attempt)
                .await
                .is_err()
            {
                return Err(Error::Transient(
                    "lease lost or worker shutting down".into(),
                ));
            }
        }
        Err(Error::Timeout(format!(
            "{what} not ready after {} attempts",
            self.cfg.readiness_attempts
        )))
    }
}

pub struct Engine {
    pub pool: Pool,
    pub gateway: Arc<dyn HostGateway>,
    pub vault: Arc<dyn SecretVault>,
    pub cfg: EngineConfig,
}

impl Engine {
    /// Run workers, the lease reaper, and the cron scheduler until the
    /// token is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        println!(
            "{}{}",
            "⚙️ Starting reconciler pool • workers=".green(),
            format!("{}", self.cfg.worker_count).green().dimmed(),
        );

        let mut handles = Vec::new();
        for i in 0..self.cfg.worker_count {
            let engine = self.clone();
            let token = shutdown.clone();
            let worker_id = format!("worker-{i}-{}", crate::names::short_id(Uuid::new_v4()));
            handles.push(tokio::spawn(async move {
                engine.worker_loop(worker_id, token).await;
            }));
        }

        {
            let engine = self.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                engine.reaper_loop(token).await;
            }));
        }
        {
            let engine = self.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                scheduler::run(&engine.pool, &engine.cfg, token).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("reconciler pool stopped");
    }

    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        let idle = Duration::from_millis(750);
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let leased = queue::lease(
                &self.pool,
                &worker_id,
                TaskKind::ALL,
                &self.cfg.queue,
                &self.cfg.kind_concurrency,
            )
            .await;

            match leased {
                Ok(Some(task)) => {
                    self.process(&worker_id, task, &shutdown).await;
                }
                Ok(None) => {
                    // Nothing runnable; nap with jitter to avoid lockstep.
                    let nap = atoll_common::backoff::full_jitter(idle, idle * 2, 1);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(nap) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = %worker_id, error = %e, "lease attempt failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    }
                }
            }
        }
    }

    async fn process(&self, worker_id: &str, task: Task, shutdown: &CancellationToken) {
        let abort = shutdown.child_token();
        let ctx = TaskCtx {
            pool: self.pool.clone(),
            gateway: self.gateway.clone(),
            vault: self.vault.clone(),
            cfg: self.cfg.clone(),
            abort: abort.clone(),
        };

        tracing::info!(
            task = %task.id,
            workspace = %task.workspace_id,
            kind = %task.kind,
            attempt = task.attempt,
            "task leased"
        );

        // Keep the lease alive while the handler runs. A failed
        // heartbeat means the lease is gone: abort the handler, since
        // every further write of ours would be fenced anyway.
        let heartbeat = {
            let pool = self.pool.clone();
            let queue_cfg = self.cfg.queue.clone();
            let worker = worker_id.to_string();
            let task_id = task.id;
            let abort = abort.clone();
            tokio::spawn(async move {
                let interval = queue_cfg.lease_duration / 3;
                loop {
                    tokio::select! {
                        _ = abort.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = queue::heartbeat(&pool, task_id, &worker, &queue_cfg).await {
                        tracing::warn!(task = %task_id, error = %e, "heartbeat failed; aborting");
                        abort.cancel();
                        return;
                    }
                }
            })
        };

        let timeout = self.cfg.timeout_for(task.kind);
        let outcome = match tokio::time::timeout(timeout, dispatch(&ctx, &task)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "task exceeded its {timeout:?} deadline"
            ))),
        };
        abort.cancel();
        let _ = heartbeat.await;

        let disposition = match &outcome {
            Ok(()) => {
                queue::complete(&self.pool, task.id, worker_id, queue::Outcome::Success, &self.cfg.queue)
                    .await
            }
            Err(Error::Cancelled) => {
                queue::complete(
                    &self.pool,
                    task.id,
                    worker_id,
                    queue::Outcome::Cancelled,
                    &self.cfg.queue,
                )
                .await
            }
            Err(e) => {
                queue::complete(
                    &self.pool,
                    task.id,
                    worker_id,
                    queue::Outcome::Failure(e),
                    &self.cfg.queue,
                )
                .await
            }
        };

        match disposition {
            Ok(queue::Disposition::Completed) => {
                tracing::info!(task = %task.id, kind = %task.kind, "task completed");
            }
            Ok(queue::Disposition::Cancelled) => {
                tracing::info!(task = %task.id, kind = %task.kind, "task cancelled");
            }
            Ok(queue::Disposition::Retried { available_at }) => {
                tracing::warn!(
                    task = %task.id,
                    kind = %task.kind,
                    attempt = task.attempt,
                    available_at,
                    error = %outcome.as_ref().err().map(|e| e.to_string()).unwrap_or_default(),
                    "task will be retried"
                );
            }
            Ok(queue::Disposition::Failed) => {
                let err = outcome.as_ref().err();
                tracing::error!(
                    task = %task.id,
                    kind = %task.kind,
                    error = %err.map(|e| e.to_string()).unwrap_or_default(),
                    "task failed terminally"
                );
                if let Err(e) = apply_failure_state(&ctx, &task).await {
                    tracing::error!(task = %task.id, error = %e, "failed to apply failure state");
                }
            }
            Err(e) => {
                // Lease was lost mid-flight; another worker owns the task.
                tracing::warn!(task = %task.id, error = %e, "completion fenced");
            }
        }
    }

    async fn reaper_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.reap_interval) => {}
            }
            match queue::reap_expired(&self.pool).await {
                Ok((_, failures)) => {
                    for failure in failures {
                        let task = Task {
                            id: failure.task_id,
                            workspace_id: failure.workspace_id,
                            kind: failure.kind,
                            ..placeholder_task()
                        };
                        let ctx = TaskCtx {
                            pool: self.pool.clone(),
                            gateway: self.gateway.clone(),
                            vault: self.vault.clone(),
                            cfg: self.cfg.clone(),
                            abort: shutdown.child_token(),
                        };
                        if let Err(e) = apply_failure_state(&ctx, &task).await {
                            tracing::error!(
                                task = %failure.task_id,
                                error = %e,
                                "failed to apply failure state after reap"
                            );
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "lease reap failed"),
            }
        }
    }
}

fn placeholder_task() -> Task {
    Task {
        id: Uuid::nil(),
        workspace_id: Uuid::nil(),
        kind: TaskKind::Create,
        status: crate::models::TaskStatus::Failed,
        payload: serde_json::json!({}),
        attempt: 0,
        max_attempts: 0,
        lease_owner: None,
        lease_expires_at: None,
        available_at: 0,
        cancel_requested: false,
        idempotency_key: None,
        requested_by: atoll_common::SYSTEM_USER.to_string(),
        error_kind: None,
        error_message: None,
        progress: None,
        created_at: 0,
        started_at: None,
        completed_at: None,
    }
}

/// Entrypoint for the `worker` subcommand.
pub async fn run_worker(args: crate::args::WorkerArgs) -> anyhow::Result<()> {
    use anyhow::Context as _;

    let pool = atoll_common::postgres::create_pool(args.postgres.clone()).await;
    crate::db::init_schema(&pool)
        .await
        .context("failed to initialize database schema")?;

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to build kube client")?;
    let gateway: Arc<dyn HostGateway> = Arc::new(crate::gateway::kube::KubeHostGateway::new(
        kube_client.clone(),
        args.engine.call_timeout()?,
    ));
    let vault: Arc<dyn SecretVault> = Arc::new(crate::vault::KubeSecretVault::new(
        kube_client,
        args.vault_namespace.clone(),
    ));

    atoll_common::metrics::maybe_spawn_metrics_server(args.metrics.metric_port);

    let shutdown = atoll_common::shutdown::cancel_on_signal();

    let engine = Arc::new(Engine {
        pool,
        gateway,
        vault,
        cfg: args.engine.engine_config()?,
    });
    atoll_common::signal_ready();
    engine.run(shutdown).await;
    Ok(())
}

/// Route a leased task to its handler.
pub async fn dispatch(ctx: &TaskCtx, task: &Task) -> Result<()> {
    match task.kind {
        TaskKind::Create => workspace::create(ctx, task).await,
        TaskKind::SetupHnc => workspace::setup_hnc(ctx, task).await,
        TaskKind::Start => workspace::start(ctx, task).await,
        TaskKind::Stop => workspace::stop(ctx, task).await,
        TaskKind::UpdatePlan => workspace::update_plan(ctx, task).await,
        TaskKind::UpdateNodes => workspace::update_nodes(ctx, task).await,
        TaskKind::Upgrade => workspace::upgrade(ctx, task).await,
        TaskKind::Backup => workspace::backup(ctx, task).await,
        TaskKind::Restore => workspace::restore(ctx, task).await,
        TaskKind::Delete => workspace::delete(ctx, task).await,
        TaskKind::ProjectCreate => project::create(ctx, task).await,
        TaskKind::ProjectDelete => project::delete(ctx, task).await,
        TaskKind::AppDeploy => application::deploy(ctx, task).await,
        TaskKind::AppDelete => application::delete(ctx, task).await,
        TaskKind::CronjobExecution => cronjob::execute(ctx, task).await,
        TaskKind::FunctionBuild => function::build(ctx, task).await,
    }
}

/// Drive the owning state machine to its failure state after a task
/// went terminally `failed`.
async fn apply_failure_state(ctx: &TaskCtx, task: &Task) -> Result<()> {
    match task.kind {
        TaskKind::Create
        | TaskKind::SetupHnc
        | TaskKind::Start
        | TaskKind::Stop
        | TaskKind::UpdatePlan
        | TaskKind::UpdateNodes
        | TaskKind::Upgrade
        | TaskKind::Backup
        | TaskKind::Restore
        | TaskKind::Delete => {
            let client = ctx.pool.get().await?;
            let Some(ws) = workspaces::get(&**client, task.workspace_id).await? else {
                return Ok(());
            };
            let target = fsm::on_failure(task.kind);
            workspaces::set_status(&**client, ws.id, target).await?;
            if target == crate::models::WorkspaceStatus::Error {
                workspaces::set_error_kind(&**client, ws.id, Some(task.kind)).await?;
            }
            Ok(())
        }
        TaskKind::ProjectCreate | TaskKind::ProjectDelete => {
            project::apply_failure_state(ctx, task).await
        }
        TaskKind::AppDeploy | TaskKind::AppDelete => {
            application::apply_failure_state(ctx, task).await
        }
        TaskKind::CronjobExecution => cronjob::apply_failure_state(ctx, task).await,
        TaskKind::FunctionBuild => function::apply_failure_state(ctx, task).await,
    }
}
