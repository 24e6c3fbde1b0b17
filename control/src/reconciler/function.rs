//! Function build handler: builds a new version image through a
//! one-shot Job, flips `is_active` atomically on success, and rolls the
//! serving deployment to the new image.

use std::collections::BTreeMap;

use super::TaskCtx;
use crate::{
    db::{applications, functions, projects},
    error::{Error, Result},
    gateway::{JobSpecReq, JobState, WorkloadSpecReq},
    models::{AppStatus, Application, BuildStatus, SourceType, Task},
    names,
    tasks::FunctionBuildPayload,
};
use atoll_common::labels;

/// Where built function images land. The registry host comes from the
/// application config so tenants can bring their own.
fn image_uri(app: &Application, version: i32) -> String {
    let registry = app
        .config
        .get("registry")
        .and_then(|v| v.as_str())
        .unwrap_or("registry.atoll.dev");
    format!(
        "{registry}/fn/{}:{}",
        names::deployment_name(app.id, &app.name),
        version
    )
}

pub async fn build(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: FunctionBuildPayload = serde_json::from_value(task.payload.clone())?;

    let (app, version) = {
        let client = ctx.pool.get().await?;
        let Some(app) = applications::get(&**client, payload.application_id).await? else {
            return Ok(());
        };
        let Some(version) = functions::get(&**client, payload.version_id).await? else {
            return Ok(());
        };
        if version.build_status != BuildStatus::Building {
            // Prior attempt already settled the build.
            return Ok(());
        }
        (app, version)
    };

    ctx.checkpoint(task.id).await?;

    let namespace = {
        let client = ctx.pool.get().await?;
        let project = projects::require(&**client, app.project_id).await?;
        project
            .k8s_namespace
            .ok_or_else(|| Error::Internal(format!("project {} has no namespace", project.id)))?
    };

    let target_image = image_uri(&app, version.version);
    match app.source_type {
        SourceType::Git => {
            let repo = app
                .config
                .get("git_url")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Validation("function config is missing 'git_url'".into()))?;
            let revision = app
                .config
                .get("git_revision")
                .and_then(|v| v.as_str())
                .unwrap_or("main");

            // Git builds may need a token from the vault.
            let mut secret_refs = Vec::new();
            if let Some(cred) = app.config.get("git_credential").and_then(|v| v.as_str())
                && let Some(secret_ref) = ctx
                    .vault
                    .get_credential_ref(app.workspace_id, cred)
                    .await?
                && let Some((_, secret_name)) = secret_ref.split_once('/')
            {
                secret_refs.push(secret_name.to_string());
            }

            let job = JobSpecReq {
                name: names::function_build_name(version.id),
                namespace: namespace.clone(),
                image: "gcr.io/kaniko-project/executor:latest".to_string(),
                command: vec![
                    "/kaniko/executor".to_string(),
                    format!("--context={repo}#refs/heads/{revision}"),
                    format!("--destination={target_image}"),
                ],
                env: BTreeMap::new(),
                labels: BTreeMap::from([
                    (labels::WORKSPACE_ID.into(), app.workspace_id.to_string()),
                    (labels::APPLICATION_ID.into(), app.id.to_string()),
                ]),
                secret_refs,
                backoff_limit: 0,
            };
            ctx.gateway.create_job(&job).await?;
            ctx.progress(
                task.id,
                "build job created",
                serde_json::json!({"job": job.name, "image": target_image}),
            )
            .await;

            let job_name = job.name.clone();
            ctx.poll_until(task.id, "image build", || {
                let namespace = namespace.clone();
                let name = job_name.clone();
                async move {
                    let observed = ctx.gateway.observe_job(&namespace, &name).await?;
                    Ok(observed.state != JobState::Active)
                }
            })
            .await?;

            let observed = ctx.gateway.observe_job(&namespace, &job_name).await?;
            if observed.state != JobState::Succeeded {
                let client = ctx.pool.get().await?;
                functions::set_build_result(&**client, version.id, BuildStatus::Failed, None)
                    .await?;
                return Err(Error::ExternalUnavailable(format!(
                    "build job {job_name} failed (exit {:?})",
                    observed.exit_code
                )));
            }
        }
        SourceType::Image => {
            // Pre-built image: nothing to build, the configured image is
            // the version artefact.
        }
    }

    let final_image = match app.source_type {
        SourceType::Git => target_image,
        SourceType::Image => app
            .config
            .get("image")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("function config is missing 'image'".into()))?
            .to_string(),
    };

    // Build result, activation flip, and app status advance in one
    // transaction so there is never a window with zero or two actives.
    let mut client = ctx.pool.get().await?;
    let tx = client.transaction().await?;
    functions::set_build_result(&*tx, version.id, BuildStatus::Succeeded, Some(&final_image))
        .await?;
    functions::activate(&*tx, app.id, version.id).await?;
    applications::set_status(&*tx, app.id, AppStatus::Deploying).await?;
    tx.commit().await.map_err(Error::from)?;

    ctx.progress(
        task.id,
        "version activated",
        serde_json::json!({"version": version.version, "image": final_image}),
    )
    .await;

    // Roll the serving workload to the now-active version.
    let workload = WorkloadSpecReq {
        name: names::deployment_name(app.id, &app.name),
        namespace: namespace.clone(),
        image: final_image,
        replicas: 1,
        container_port: app
            .config
            .get("port")
            .and_then(|v| v.as_i64())
            .unwrap_or(8080) as i32,
        env: BTreeMap::new(),
        labels: BTreeMap::from([
            (labels::WORKSPACE_ID.into(), app.workspace_id.to_string()),
            (labels::APPLICATION_ID.into(), app.id.to_string()),
        ]),
    };
    ctx.gateway.apply_workload(&workload).await?;

    let desired = workload.replicas;
    let name = workload.name.clone();
    ctx.poll_until(task.id, "function rollout", || {
        let namespace = namespace.clone();
        let name = name.clone();
        async move {
            let observed = ctx.gateway.observe_workload(&namespace, &name).await?;
            Ok(observed.ready_replicas >= desired)
        }
    })
    .await?;

    let client = ctx.pool.get().await?;
    applications::set_status(&**client, app.id, AppStatus::Running).await?;
    Ok(())
}

pub async fn apply_failure_state(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Ok(payload) = serde_json::from_value::<FunctionBuildPayload>(task.payload.clone()) else {
        return Ok(());
    };
    let client = ctx.pool.get().await?;
    let Some(version) = functions::get(&**client, payload.version_id).await? else {
        return Ok(());
    };
    if version.build_status == BuildStatus::Building {
        functions::set_build_result(&**client, version.id, BuildStatus::Failed, None).await?;
    }
    if applications::get(&**client, payload.application_id)
        .await?
        .is_some()
    {
        applications::set_status(&**client, payload.application_id, AppStatus::Error).await?;
    }
    Ok(())
}
