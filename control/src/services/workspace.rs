use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::{
    db::{orgs, workspaces},
    error::{Error, Result},
    fsm,
    models::{
        CreateWorkspaceRequest, RestoreRequest, TaskAccepted, TaskKind, UpdateNodesRequest,
        UpdatePlanRequest, Workspace,
    },
    tasks::{
        QueueConfig, RestorePayload, UpdateNodesPayload, UpdatePlanPayload, UpgradePayload, queue,
    },
};

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("workspace name must not be empty".into()));
    }
    if name.len() > 63 {
        return Err(Error::Validation(
            "workspace name must be at most 63 characters".into(),
        ));
    }
    Ok(())
}

/// Insert the workspace and its CREATE task atomically.
pub async fn create(
    pool: &Pool,
    qcfg: &QueueConfig,
    req: &CreateWorkspaceRequest,
    requested_by: &str,
) -> Result<(Workspace, Uuid)> {
    validate_name(&req.name)?;

    let mut client = pool.get().await?;
    let tx = client.transaction().await?;
    orgs::require(&*tx, req.org_id).await?;
    let ws = workspaces::create(
        &*tx,
        Uuid::new_v4(),
        req.org_id,
        &req.name,
        &req.plan_id,
        req.config.as_ref(),
        req.dedicated_node_config.as_ref(),
    )
    .await?;
    let task_id = queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id: ws.id,
            kind: TaskKind::Create,
            payload: serde_json::json!({}),
            idempotency_key: None,
            requested_by,
            max_attempts: qcfg.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    Ok((ws, task_id))
}

/// Shared preamble for the lifecycle verbs: lock the row, check the
/// transition table (including the ERROR-recovery rule), enqueue.
async fn enqueue_lifecycle(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    kind: TaskKind,
    payload: serde_json::Value,
    requested_by: &str,
) -> Result<TaskAccepted> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;
    let ws = workspaces::get_for_update(&*tx, workspace_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("workspace {workspace_id} not found")))?;

    if !fsm::may_enqueue(ws.status, ws.error_task_kind, kind) {
        return Err(Error::PreconditionFailed(format!(
            "{kind} is not allowed while workspace is {}",
            ws.status
        )));
    }

    let task_id = queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id,
            kind,
            payload,
            idempotency_key: None,
            requested_by,
            max_attempts: qcfg.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    Ok(TaskAccepted {
        task_id,
        task_status: crate::models::TaskStatus::Pending,
        workspace_id,
        workspace_status: ws.status,
    })
}

pub async fn start(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    requested_by: &str,
) -> Result<TaskAccepted> {
    enqueue_lifecycle(
        pool,
        qcfg,
        workspace_id,
        TaskKind::Start,
        serde_json::json!({}),
        requested_by,
    )
    .await
}

pub async fn stop(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    requested_by: &str,
) -> Result<TaskAccepted> {
    enqueue_lifecycle(
        pool,
        qcfg,
        workspace_id,
        TaskKind::Stop,
        serde_json::json!({}),
        requested_by,
    )
    .await
}

pub async fn update_plan(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    req: &UpdatePlanRequest,
    requested_by: &str,
) -> Result<TaskAccepted> {
    if req.plan_id.trim().is_empty() {
        return Err(Error::Validation("plan_id must not be empty".into()));
    }
    enqueue_lifecycle(
        pool,
        qcfg,
        workspace_id,
        TaskKind::UpdatePlan,
        serde_json::to_value(UpdatePlanPayload {
            plan_id: req.plan_id.clone(),
        })?,
        requested_by,
    )
    .await
}

pub async fn update_nodes(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    req: &UpdateNodesRequest,
    requested_by: &str,
) -> Result<TaskAccepted> {
    enqueue_lifecycle(
        pool,
        qcfg,
        workspace_id,
        TaskKind::UpdateNodes,
        serde_json::to_value(UpdateNodesPayload {
            dedicated_node_config: req.dedicated_node_config.clone(),
        })?,
        requested_by,
    )
    .await
}

pub async fn upgrade(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    kubernetes_version: &str,
    requested_by: &str,
) -> Result<TaskAccepted> {
    if kubernetes_version.trim().is_empty() {
        return Err(Error::Validation(
            "kubernetes_version must not be empty".into(),
        ));
    }
    enqueue_lifecycle(
        pool,
        qcfg,
        workspace_id,
        TaskKind::Upgrade,
        serde_json::to_value(UpgradePayload {
            kubernetes_version: kubernetes_version.to_string(),
        })?,
        requested_by,
    )
    .await
}

pub async fn backup(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    requested_by: &str,
) -> Result<TaskAccepted> {
    enqueue_lifecycle(
        pool,
        qcfg,
        workspace_id,
        TaskKind::Backup,
        serde_json::json!({}),
        requested_by,
    )
    .await
}

pub async fn restore(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    req: &RestoreRequest,
    requested_by: &str,
) -> Result<TaskAccepted> {
    if req.backup_ref.trim().is_empty() {
        return Err(Error::Validation("backup_ref must not be empty".into()));
    }
    enqueue_lifecycle(
        pool,
        qcfg,
        workspace_id,
        TaskKind::Restore,
        serde_json::to_value(RestorePayload {
            backup_ref: req.backup_ref.clone(),
        })?,
        requested_by,
    )
    .await
}

pub async fn delete(
    pool: &Pool,
    qcfg: &QueueConfig,
    workspace_id: Uuid,
    requested_by: &str,
) -> Result<TaskAccepted> {
    enqueue_lifecycle(
        pool,
        qcfg,
        workspace_id,
        TaskKind::Delete,
        serde_json::json!({}),
        requested_by,
    )
    .await
}
