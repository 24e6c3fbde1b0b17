//! Project (HNC subnamespace) handlers.

use super::TaskCtx;
use crate::{
    db::{projects, workspaces},
    error::{Error, Result},
    models::{ProjectStatus, Task, WorkspaceStatus},
    names,
    tasks::ProjectPayload,
};

/// Parent namespace of a project: the parent project's namespace, or
/// the workspace root namespace for top-level projects.
async fn parent_namespace(ctx: &TaskCtx, project: &crate::models::Project) -> Result<String> {
    let client = ctx.pool.get().await?;
    if let Some(parent_id) = project.parent_project_id
        && let Some(parent) = projects::get(&**client, parent_id).await?
        && let Some(ns) = parent.k8s_namespace
    {
        return Ok(ns);
    }
    Ok(names::workspace_namespace(project.workspace_id))
}

pub async fn create(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: ProjectPayload = serde_json::from_value(task.payload.clone())?;

    let project = {
        let client = ctx.pool.get().await?;
        let Some(ws) = workspaces::get(&**client, task.workspace_id).await? else {
            return Ok(());
        };
        if ws.status != WorkspaceStatus::Running {
            tracing::warn!(
                task = %task.id,
                status = %ws.status,
                "workspace no longer running; completing project create as no-op"
            );
            return Ok(());
        }
        let Some(project) = projects::get(&**client, payload.project_id).await? else {
            return Ok(());
        };
        match project.ns_status {
            ProjectStatus::PendingCreation | ProjectStatus::Error => project,
            // Already converged or being torn down.
            _ => return Ok(()),
        }
    };

    ctx.checkpoint(task.id).await?;

    let namespace = project
        .k8s_namespace
        .clone()
        .ok_or_else(|| Error::Internal(format!("project {} has no namespace", project.id)))?;
    let parent = parent_namespace(ctx, &project).await?;

    ctx.gateway
        .apply_namespace_with_anchor(&parent, &namespace)
        .await?;
    ctx.progress(
        task.id,
        "anchor applied",
        serde_json::json!({"parent": parent, "namespace": namespace}),
    )
    .await;

    // HNC materializes the child namespace asynchronously.
    ctx.poll_until(task.id, "namespace propagation", || {
        let ns = namespace.clone();
        async move { ctx.gateway.namespace_active(&ns).await }
    })
    .await?;

    let client = ctx.pool.get().await?;
    projects::set_status(&**client, project.id, ProjectStatus::Active).await?;
    Ok(())
}

pub async fn delete(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: ProjectPayload = serde_json::from_value(task.payload.clone())?;

    let project = {
        let client = ctx.pool.get().await?;
        let Some(project) = projects::get(&**client, payload.project_id).await? else {
            return Ok(()); // already gone
        };
        // Guard re-checked here: applications may have appeared between
        // the service check and this task running.
        let apps = projects::count_applications(&**client, project.id).await?;
        if apps > 0 {
            return Err(Error::PreconditionFailed(format!(
                "project {} still has {apps} application(s)",
                project.id
            )));
        }
        projects::set_status(&**client, project.id, ProjectStatus::Deleting).await?;
        project
    };

    ctx.checkpoint(task.id).await?;

    if let Some(namespace) = project.k8s_namespace.clone() {
        let parent = parent_namespace(ctx, &project).await?;
        ctx.gateway
            .delete_namespace_anchor(&parent, &namespace)
            .await?;
        ctx.gateway.delete_namespace(&namespace).await?;

        ctx.poll_until(task.id, "namespace teardown", || {
            let ns = namespace.clone();
            async move { Ok(!ctx.gateway.namespace_active(&ns).await?) }
        })
        .await?;
    }

    let client = ctx.pool.get().await?;
    projects::remove(&**client, project.id).await?;
    Ok(())
}

pub async fn apply_failure_state(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Ok(payload) = serde_json::from_value::<ProjectPayload>(task.payload.clone()) else {
        return Ok(());
    };
    let client = ctx.pool.get().await?;
    if projects::get(&**client, payload.project_id).await?.is_some() {
        projects::set_status(&**client, payload.project_id, ProjectStatus::Error).await?;
    }
    Ok(())
}
