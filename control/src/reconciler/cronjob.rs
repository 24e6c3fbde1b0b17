//! Cron execution handler: drives one `CronJobExecution` row through a
//! one-shot host Job to its terminal state.

use std::collections::BTreeMap;

use super::TaskCtx;
use crate::{
    db::{applications, cron, projects},
    error::{Error, Result},
    gateway::{JobSpecReq, JobState},
    models::{ExecutionStatus, Task},
    scheduler,
    tasks::CronExecutionPayload,
};
use atoll_common::labels;

pub async fn execute(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: CronExecutionPayload = serde_json::from_value(task.payload.clone())?;

    let (app, execution) = {
        let client = ctx.pool.get().await?;
        let Some(app) = applications::get(&**client, payload.application_id).await? else {
            return Ok(());
        };
        let Some(execution) = cron::get(&**client, payload.execution_id).await? else {
            return Ok(());
        };
        if execution.status != ExecutionStatus::Running {
            // A prior attempt already finished this execution.
            return Ok(());
        }
        (app, execution)
    };

    ctx.checkpoint(task.id).await?;

    let namespace = {
        let client = ctx.pool.get().await?;
        let project = projects::require(&**client, app.project_id).await?;
        project
            .k8s_namespace
            .ok_or_else(|| Error::Internal(format!("project {} has no namespace", project.id)))?
    };

    let image = app
        .config
        .get("image")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Validation("cronjob config is missing 'image'".into()))?;
    let command: Vec<String> = app
        .config
        .get("command")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    // Job name comes from the execution row, so a retried task converges
    // on the same host object (create_job treats AlreadyExists as ok).
    let job = JobSpecReq {
        name: execution.job_name.clone(),
        namespace: namespace.clone(),
        image: image.to_string(),
        command,
        env: BTreeMap::new(),
        labels: BTreeMap::from([
            (labels::WORKSPACE_ID.into(), app.workspace_id.to_string()),
            (labels::APPLICATION_ID.into(), app.id.to_string()),
        ]),
        secret_refs: vec![],
        backoff_limit: 0,
    };
    ctx.gateway.create_job(&job).await?;
    ctx.progress(
        task.id,
        "job created",
        serde_json::json!({"job": execution.job_name, "namespace": namespace}),
    )
    .await;

    ctx.poll_until(task.id, "job completion", || {
        let namespace = namespace.clone();
        let name = execution.job_name.clone();
        async move {
            let observed = ctx.gateway.observe_job(&namespace, &name).await?;
            Ok(observed.state != JobState::Active)
        }
    })
    .await?;

    let observed = ctx
        .gateway
        .observe_job(&namespace, &execution.job_name)
        .await?;
    let observed_exit = observed.exit_code;
    let status = match observed.state {
        JobState::Succeeded => ExecutionStatus::Succeeded,
        _ => ExecutionStatus::Failed,
    };
    let logs_ref = format!("logs://{}/{}", namespace, execution.job_name);

    let mut client = ctx.pool.get().await?;
    let tx = client.transaction().await?;
    match cron::finish(&*tx, execution.id, status, observed_exit, Some(&logs_ref)).await {
        Ok(()) => {}
        // Another worker finished it after a lost lease; converge.
        Err(Error::Conflict(_)) => {
            tx.rollback().await.map_err(Error::from)?;
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    // Recompute the schedule from completion time so a long run does not
    // immediately re-fire.
    if let Some(schedule) = &app.cron_schedule {
        let next = scheduler::next_occurrence(schedule, crate::db::now_ms())?;
        applications::set_next_execution(&*tx, app.id, next).await?;
    }
    tx.commit().await.map_err(Error::from)?;

    ctx.progress(
        task.id,
        "execution finished",
        serde_json::json!({"status": status.as_str(), "exit_code": observed_exit}),
    )
    .await;
    Ok(())
}

pub async fn apply_failure_state(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Ok(payload) = serde_json::from_value::<CronExecutionPayload>(task.payload.clone()) else {
        return Ok(());
    };
    let client = ctx.pool.get().await?;
    let Some(execution) = cron::get(&**client, payload.execution_id).await? else {
        return Ok(());
    };
    if execution.status == ExecutionStatus::Running {
        cron::finish(&**client, execution.id, ExecutionStatus::Failed, None, None).await?;
    }
    Ok(())
}
