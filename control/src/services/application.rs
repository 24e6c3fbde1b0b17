use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::{
    db::{self, applications, cron, functions, projects, workspaces},
    error::{Error, Result},
    models::{
        AppType, Application, ConcurrencyPolicy, CreateApplicationRequest, CronJobExecution,
        FunctionVersion, ProjectStatus, TaskKind, WorkspaceStatus,
    },
    names, scheduler,
    tasks::{AppPayload, CronExecutionPayload, FunctionBuildPayload, QueueConfig, queue},
};

fn validate(req: &CreateApplicationRequest) -> Result<()> {
    if names::sanitize_dns1123(&req.name).is_empty() {
        return Err(Error::Validation(format!(
            "application name {:?} has no usable characters",
            req.name
        )));
    }
    match req.app_type {
        AppType::Stateless => {
            if req.config.get("image").and_then(|v| v.as_str()).is_none() {
                return Err(Error::Validation(
                    "stateless applications require config.image".into(),
                ));
            }
        }
        AppType::Cronjob => {
            let Some(schedule) = &req.cron_schedule else {
                return Err(Error::Validation(
                    "cronjob applications require cron_schedule".into(),
                ));
            };
            scheduler::validate_schedule(schedule)?;
            if req.config.get("image").and_then(|v| v.as_str()).is_none() {
                return Err(Error::Validation(
                    "cronjob applications require config.image".into(),
                ));
            }
        }
        AppType::Function => {
            let has_git = req.config.get("git_url").and_then(|v| v.as_str()).is_some();
            let has_image = req.config.get("image").and_then(|v| v.as_str()).is_some();
            if !has_git && !has_image {
                return Err(Error::Validation(
                    "function applications require config.git_url or config.image".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Create an application. Stateless apps immediately get a deploy task;
/// cronjobs are picked up by the scheduler; functions deploy versions
/// through [`deploy_function`].
pub async fn create(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    req: &CreateApplicationRequest,
    requested_by: &str,
) -> Result<(Application, Option<Uuid>)> {
    validate(req)?;

    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let ws = workspaces::require(&*tx, workspace_id).await?;
    if ws.status != WorkspaceStatus::Running {
        return Err(Error::PreconditionFailed(format!(
            "applications require a RUNNING workspace (currently {})",
            ws.status
        )));
    }
    let project = projects::require(&*tx, req.project_id).await?;
    if project.workspace_id != workspace_id {
        return Err(Error::Validation(
            "project belongs to a different workspace".into(),
        ));
    }
    if project.ns_status != ProjectStatus::Active {
        return Err(Error::PreconditionFailed(format!(
            "project is {} (must be ACTIVE)",
            project.ns_status
        )));
    }

    let next_execution_at = match (&req.app_type, &req.cron_schedule) {
        (AppType::Cronjob, Some(schedule)) => {
            scheduler::next_occurrence(schedule, db::now_ms())?
        }
        _ => None,
    };

    let app = applications::create(
        &*tx,
        Uuid::new_v4(),
        workspace_id,
        req.project_id,
        &req.name,
        req.app_type,
        req.source_type,
        &req.config,
        req.cron_schedule.as_deref(),
        req.concurrency_policy
            .or(match req.app_type {
                AppType::Cronjob => Some(ConcurrencyPolicy::Forbid),
                _ => None,
            }),
        next_execution_at,
    )
    .await?;

    let task_id = match req.app_type {
        AppType::Stateless => Some(
            queue::enqueue(
                &*tx,
                queue::EnqueueRequest {
                    workspace_id,
                    kind: TaskKind::AppDeploy,
                    payload: serde_json::to_value(AppPayload {
                        application_id: app.id,
                    })?,
                    idempotency_key: Some(format!("app-deploy-{}", app.id)),
                    requested_by,
                    max_attempts: qcfg.max_attempts,
                },
            )
            .await?,
        ),
        _ => None,
    };
    tx.commit().await.map_err(Error::from)?;

    Ok((app, task_id))
}

pub async fn delete(
    pool: &Pool,
    qcfg: &QueueConfig,
    application_id: Uuid,
    requested_by: &str,
) -> Result<Uuid> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;
    let app = applications::require(&*tx, application_id).await?;
    let task_id = queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id: app.workspace_id,
            kind: TaskKind::AppDelete,
            payload: serde_json::to_value(AppPayload {
                application_id: app.id,
            })?,
            idempotency_key: Some(format!("app-delete-{}", app.id)),
            requested_by,
            max_attempts: qcfg.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(task_id)
}

/// Replace a cronjob's schedule and recompute its next run.
pub async fn update_schedule(
    pool: &Pool,
    application_id: Uuid,
    schedule: &str,
) -> Result<Application> {
    scheduler::validate_schedule(schedule)?;
    let next = scheduler::next_occurrence(schedule, db::now_ms())?
        .ok_or_else(|| Error::Validation(format!("schedule {schedule:?} never fires")))?;

    let client = pool.get().await?;
    let app = applications::require(&**client, application_id).await?;
    if app.app_type != AppType::Cronjob {
        return Err(Error::Validation(format!(
            "application {application_id} is not a cronjob"
        )));
    }
    applications::update_schedule(&**client, application_id, schedule, next).await?;
    applications::require(&**client, application_id).await
}

/// Manual cron trigger. With `Forbid` concurrency a second trigger
/// while one execution runs is a `Conflict`; the check and the insert
/// share a transaction holding the application row lock.
pub async fn trigger_cronjob(
    pool: &Pool,
    qcfg: &QueueConfig,
    application_id: Uuid,
    requested_by: &str,
) -> Result<(CronJobExecution, Uuid)> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            "SELECT id FROM applications WHERE id = $1 AND app_type = 'cronjob' FOR UPDATE",
            &[&application_id],
        )
        .await?;
    if row.is_none() {
        return Err(Error::NotFound(format!(
            "cronjob application {application_id} not found"
        )));
    }
    let app = applications::require(&*tx, application_id).await?;

    let ws = workspaces::require(&*tx, app.workspace_id).await?;
    if ws.status != WorkspaceStatus::Running {
        return Err(Error::PreconditionFailed(format!(
            "workspace is {} (must be RUNNING)",
            ws.status
        )));
    }

    if app.concurrency_policy == Some(ConcurrencyPolicy::Forbid)
        && cron::count_running(&*tx, app.id).await? > 0
    {
        return Err(Error::Conflict(format!(
            "an execution of {} is already running (policy Forbid)",
            app.name
        )));
    }

    let execution_id = Uuid::new_v4();
    let execution = cron::create(
        &*tx,
        execution_id,
        app.id,
        &names::execution_job_name(execution_id),
    )
    .await?;
    let task_id = queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id: app.workspace_id,
            kind: TaskKind::CronjobExecution,
            payload: serde_json::to_value(CronExecutionPayload {
                application_id: app.id,
                execution_id: execution.id,
            })?,
            idempotency_key: Some(format!("cron-manual-{execution_id}")),
            requested_by,
            max_attempts: qcfg.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    Ok((execution, task_id))
}

/// Deploy a function: allocate the next version in `building` and queue
/// the build.
pub async fn deploy_function(
    pool: &Pool,
    qcfg: &QueueConfig,
    application_id: Uuid,
    requested_by: &str,
) -> Result<(FunctionVersion, Uuid)> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let app = applications::require(&*tx, application_id).await?;
    if app.app_type != AppType::Function {
        return Err(Error::Validation(format!(
            "application {application_id} is not a function"
        )));
    }
    let ws = workspaces::require(&*tx, app.workspace_id).await?;
    if ws.status != WorkspaceStatus::Running {
        return Err(Error::PreconditionFailed(format!(
            "workspace is {} (must be RUNNING)",
            ws.status
        )));
    }

    let version = functions::create_next(&*tx, Uuid::new_v4(), app.id).await?;
    let task_id = queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id: app.workspace_id,
            kind: TaskKind::FunctionBuild,
            payload: serde_json::to_value(FunctionBuildPayload {
                application_id: app.id,
                version_id: version.id,
            })?,
            idempotency_key: Some(format!("fn-build-{}", version.id)),
            requested_by,
            max_attempts: qcfg.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    Ok((version, task_id))
}

/// Activate (or roll back to) a specific built version. The flip is one
/// transaction; the rollout to the host happens through a deploy task.
pub async fn activate_version(
    pool: &Pool,
    qcfg: &QueueConfig,
    application_id: Uuid,
    version_number: i32,
    requested_by: &str,
) -> Result<(FunctionVersion, Uuid)> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let app = applications::require(&*tx, application_id).await?;
    if app.app_type != AppType::Function {
        return Err(Error::Validation(format!(
            "application {application_id} is not a function"
        )));
    }
    let version = functions::get_by_version(&*tx, app.id, version_number)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "version {version_number} of application {application_id} not found"
            ))
        })?;
    let activated = functions::activate(&*tx, app.id, version.id).await?;
    let task_id = queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id: app.workspace_id,
            kind: TaskKind::AppDeploy,
            payload: serde_json::to_value(AppPayload {
                application_id: app.id,
            })?,
            idempotency_key: Some(format!("fn-rollout-{}-{}", app.id, version_number)),
            requested_by,
            max_attempts: qcfg.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    Ok((activated, task_id))
}
