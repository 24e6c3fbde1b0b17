use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::{
    db::{projects, workspaces},
    error::{Error, Result},
    models::{CreateProjectRequest, Project, ProjectStatus, TaskKind, WorkspaceStatus},
    names,
    tasks::{ProjectPayload, QueueConfig, queue},
};

/// Create a project row (namespace chosen up front, immutable) and the
/// task that materializes it. Requires the workspace to be RUNNING.
pub async fn create(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    req: &CreateProjectRequest,
    requested_by: &str,
) -> Result<(Project, Uuid)> {
    if names::sanitize_dns1123(&req.name).is_empty() {
        return Err(Error::Validation(format!(
            "project name {:?} has no usable characters",
            req.name
        )));
    }

    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let ws = workspaces::get_for_update(&*tx, workspace_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("workspace {workspace_id} not found")))?;
    if ws.status != WorkspaceStatus::Running {
        return Err(Error::PreconditionFailed(format!(
            "projects require a RUNNING workspace (currently {})",
            ws.status
        )));
    }

    if let Some(parent_id) = req.parent_project_id {
        let parent = projects::require(&*tx, parent_id).await?;
        if parent.workspace_id != workspace_id {
            return Err(Error::Validation(
                "parent project belongs to a different workspace".into(),
            ));
        }
        if parent.ns_status != ProjectStatus::Active {
            return Err(Error::PreconditionFailed(format!(
                "parent project is {} (must be ACTIVE)",
                parent.ns_status
            )));
        }
    }

    let namespace = names::project_namespace(workspace_id, &req.name);
    let project = projects::create(
        &*tx,
        Uuid::new_v4(),
        workspace_id,
        &req.name,
        req.parent_project_id,
        &namespace,
        // The anchor is the claim in the parent that materializes the
        // child namespace; they share a name.
        &namespace,
    )
    .await?;

    let task_id = queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id,
            kind: TaskKind::ProjectCreate,
            payload: serde_json::to_value(ProjectPayload {
                project_id: project.id,
            })?,
            idempotency_key: Some(format!("project-create-{}", project.id)),
            requested_by,
            max_attempts: qcfg.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    Ok((project, task_id))
}

/// Queue project deletion; refused while applications reference it.
pub async fn delete(
    pool: &Pool,
    qcfg: &QueueConfig,
    project_id: Uuid,
    requested_by: &str,
) -> Result<Uuid> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let project = projects::require(&*tx, project_id).await?;
    let apps = projects::count_applications(&*tx, project.id).await?;
    if apps > 0 {
        return Err(Error::PreconditionFailed(format!(
            "project {} still has {apps} application(s)",
            project.id
        )));
    }
    let children = projects::list_children(&*tx, project.id).await?;
    if !children.is_empty() {
        return Err(Error::PreconditionFailed(format!(
            "project {} still has {} subproject(s)",
            project.id,
            children.len()
        )));
    }

    let task_id = queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id: project.workspace_id,
            kind: TaskKind::ProjectDelete,
            payload: serde_json::to_value(ProjectPayload {
                project_id: project.id,
            })?,
            idempotency_key: Some(format!("project-delete-{}", project.id)),
            requested_by,
            max_attempts: qcfg.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    Ok(task_id)
}
