//! Workspace lifecycle handlers: one function per task kind, each
//! following the same recipe. Re-read and verify the From state under a
//! transaction, act on the host under deterministic names, poll the
//! readiness predicate, then advance the status transactionally.

use tokio_postgres::GenericClient;
use uuid::Uuid;

use super::TaskCtx;
use crate::{
    db::{credentials, projects, workspaces},
    error::{Error, Result},
    fsm,
    gateway::{SnapshotState, VClusterSpecReq},
    models::{Task, TaskKind, Workspace, WorkspaceStatus},
    names,
    tasks::{RestorePayload, UpdateNodesPayload, UpdatePlanPayload, UpgradePayload, queue},
};

const DEFAULT_KUBERNETES_VERSION: &str = "1.31";

/// Re-read the workspace under a row lock, verify the task is still
/// applicable, and move it into the kind's in-progress status. `None`
/// means the task is a no-op (state already advanced or row gone).
async fn begin(ctx: &TaskCtx, task: &Task) -> Result<Option<Workspace>> {
    let mut client = ctx.pool.get().await?;
    let tx = client.transaction().await?;

    let Some(ws) = workspaces::get_for_update(&*tx, task.workspace_id).await? else {
        tracing::info!(task = %task.id, "workspace row gone; completing as no-op");
        return Ok(None);
    };

    let in_progress = fsm::in_progress(task.kind);
    let acceptable = fsm::valid_from(task.kind).contains(&ws.status)
        || Some(ws.status) == in_progress
        || (ws.status == WorkspaceStatus::Error && ws.error_task_kind == Some(task.kind));
    if !acceptable {
        tracing::warn!(
            task = %task.id,
            kind = %task.kind,
            status = %ws.status,
            "invalid From state; completing as no-op"
        );
        return Ok(None);
    }

    if let Some(target) = in_progress
        && ws.status != target
    {
        workspaces::set_status(&*tx, ws.id, target).await?;
    }
    tx.commit().await.map_err(Error::from)?;
    Ok(Some(ws))
}

/// CAS the final status; tolerate a concurrent identical advancement
/// (a crashed prior attempt that already committed this step).
async fn finish_transition<C: GenericClient>(
    client: &C,
    ws_id: Uuid,
    from: WorkspaceStatus,
    to: WorkspaceStatus,
) -> Result<()> {
    match workspaces::transition_status(client, ws_id, from, to).await {
        Ok(()) => {}
        Err(Error::Conflict(_)) => {
            let current = workspaces::get(client, ws_id)
                .await?
                .map(|w| w.status)
                .ok_or_else(|| Error::NotFound(format!("workspace {ws_id} disappeared")))?;
            if current != to {
                return Err(Error::Conflict(format!(
                    "workspace {ws_id} moved to {current} behind our back"
                )));
            }
        }
        Err(e) => return Err(e),
    }
    workspaces::set_error_kind(client, ws_id, None).await?;
    Ok(())
}

/// Once the host has been mutated, an observed cancellation can no
/// longer roll back cleanly: park the workspace in ERROR.
async fn error_on_cancel<T>(ctx: &TaskCtx, task: &Task, result: Result<T>) -> Result<T> {
    if matches!(result, Err(Error::Cancelled)) {
        let client = ctx.pool.get().await?;
        workspaces::set_status(&**client, task.workspace_id, WorkspaceStatus::Error).await?;
        workspaces::set_error_kind(&**client, task.workspace_id, Some(task.kind)).await?;
    }
    result
}

/// Before the first external mutation a cancellation is side-effect
/// free: restore the prior stable status and surface `Cancelled`.
async fn rollback_on_cancel<T>(ctx: &TaskCtx, task: &Task, result: Result<T>) -> Result<T> {
    if matches!(result, Err(Error::Cancelled))
        && let Some(stable) = fsm::stable_rollback(task.kind)
    {
        let client = ctx.pool.get().await?;
        workspaces::set_status(&**client, task.workspace_id, stable).await?;
    }
    result
}

fn config_str(ws: &Workspace, key: &str) -> Option<String> {
    ws.config
        .as_ref()
        .and_then(|c| c.get(key))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Desired vCluster state derived purely from the stored row, so every
/// handler re-applies the same spec and converges.
fn vcluster_spec(ws: &Workspace, paused: bool) -> VClusterSpecReq {
    VClusterSpecReq {
        workspace_id: ws.id,
        instance_name: ws
            .instance_name
            .clone()
            .unwrap_or_else(|| names::instance_name(ws.id)),
        namespace: names::workspace_namespace(ws.id),
        plan: ws.plan_id.clone(),
        kubernetes_version: config_str(ws, "kubernetes_version")
            .unwrap_or_else(|| DEFAULT_KUBERNETES_VERSION.to_string()),
        paused,
        resources: ws.config.as_ref().and_then(|c| c.get("resources").cloned()),
        dedicated_node_config: ws.dedicated_node_config.clone(),
    }
}

async fn await_phase(
    ctx: &TaskCtx,
    task: &Task,
    namespace: &str,
    instance: &str,
    what: &str,
    pred: impl Fn(&crate::gateway::VClusterObserved) -> bool + Copy,
) -> Result<()> {
    ctx.poll_until(task.id, what, || {
        let namespace = namespace.to_string();
        let instance = instance.to_string();
        async move {
            let observed = ctx.gateway.get_vcluster_status(&namespace, &instance).await?;
            Ok(pred(&observed))
        }
    })
    .await
}

pub async fn create(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Some(ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    let spec = vcluster_spec(&ws, false);
    let handle = ctx.gateway.apply_vcluster(&spec).await?;
    ctx.progress(
        task.id,
        "vcluster manifest applied",
        serde_json::json!({"instance": handle.instance_name}),
    )
    .await;

    let wait = await_phase(
        ctx,
        task,
        &spec.namespace,
        &spec.instance_name,
        "vcluster instance",
        |o| o.is_running(),
    )
    .await;
    error_on_cancel(ctx, task, wait).await?;

    let mut client = ctx.pool.get().await?;
    let tx = client.transaction().await?;
    workspaces::set_instance(&*tx, ws.id, &handle.instance_name, &handle.kubeconfig_ref).await?;
    finish_transition(
        &*tx,
        ws.id,
        WorkspaceStatus::PendingCreation,
        WorkspaceStatus::ConfiguringHnc,
    )
    .await?;
    // The HNC step runs as its own task so a crash between the two
    // phases resumes from durable state.
    queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id: ws.id,
            kind: TaskKind::SetupHnc,
            payload: serde_json::json!({}),
            idempotency_key: Some(format!("setup-hnc-{}", ws.id)),
            requested_by: &task.requested_by,
            max_attempts: task.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    ctx.progress(task.id, "workspace configured; hierarchy setup queued", serde_json::json!({}))
        .await;
    Ok(())
}

pub async fn setup_hnc(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Some(ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    let ws_namespace = names::workspace_namespace(ws.id);
    let system_child = format!("{ws_namespace}-system");
    // Anchoring the per-tenant system namespace proves the HNC
    // machinery propagates for this workspace before we declare it
    // serviceable.
    ctx.gateway
        .apply_namespace_with_anchor(&ws_namespace, &system_child)
        .await?;

    let wait = ctx
        .poll_until(task.id, "hierarchy propagation", || {
            let child = system_child.clone();
            async move { ctx.gateway.namespace_active(&child).await }
        })
        .await;
    error_on_cancel(ctx, task, wait).await?;

    let client = ctx.pool.get().await?;
    finish_transition(
        &**client,
        ws.id,
        WorkspaceStatus::ConfiguringHnc,
        WorkspaceStatus::Running,
    )
    .await?;
    ctx.progress(task.id, "workspace running", serde_json::json!({}))
        .await;
    Ok(())
}

pub async fn start(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Some(ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    let spec = vcluster_spec(&ws, false);
    ctx.gateway.apply_vcluster(&spec).await?;
    let wait = await_phase(
        ctx,
        task,
        &spec.namespace,
        &spec.instance_name,
        "vcluster resume",
        |o| o.is_running(),
    )
    .await;
    error_on_cancel(ctx, task, wait).await?;

    let client = ctx.pool.get().await?;
    finish_transition(
        &**client,
        ws.id,
        WorkspaceStatus::Starting,
        WorkspaceStatus::Running,
    )
    .await
}

pub async fn stop(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Some(ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    let spec = vcluster_spec(&ws, true);
    ctx.gateway.apply_vcluster(&spec).await?;
    let wait = await_phase(
        ctx,
        task,
        &spec.namespace,
        &spec.instance_name,
        "vcluster pause",
        |o| o.is_paused(),
    )
    .await;
    error_on_cancel(ctx, task, wait).await?;

    let client = ctx.pool.get().await?;
    finish_transition(
        &**client,
        ws.id,
        WorkspaceStatus::Stopping,
        WorkspaceStatus::Stopped,
    )
    .await
}

pub async fn update_plan(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: UpdatePlanPayload = serde_json::from_value(task.payload.clone())?;
    let Some(mut ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    ws.plan_id = payload.plan_id.clone();
    let spec = vcluster_spec(&ws, false);
    ctx.gateway.apply_vcluster(&spec).await?;
    let wait = await_phase(
        ctx,
        task,
        &spec.namespace,
        &spec.instance_name,
        "plan rollout",
        |o| o.is_running(),
    )
    .await;
    error_on_cancel(ctx, task, wait).await?;

    let mut client = ctx.pool.get().await?;
    let tx = client.transaction().await?;
    workspaces::update_plan(&*tx, ws.id, &payload.plan_id).await?;
    finish_transition(
        &*tx,
        ws.id,
        WorkspaceStatus::UpdatingPlan,
        WorkspaceStatus::Running,
    )
    .await?;
    tx.commit().await.map_err(Error::from)
}

pub async fn update_nodes(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: UpdateNodesPayload = serde_json::from_value(task.payload.clone())?;
    let Some(mut ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    ws.dedicated_node_config = Some(payload.dedicated_node_config.clone());
    let spec = vcluster_spec(&ws, false);
    ctx.gateway.apply_vcluster(&spec).await?;
    let wait = await_phase(
        ctx,
        task,
        &spec.namespace,
        &spec.instance_name,
        "node rollout",
        |o| o.is_running(),
    )
    .await;
    error_on_cancel(ctx, task, wait).await?;

    let mut client = ctx.pool.get().await?;
    let tx = client.transaction().await?;
    workspaces::update_node_config(&*tx, ws.id, &payload.dedicated_node_config).await?;
    finish_transition(
        &*tx,
        ws.id,
        WorkspaceStatus::UpdatingNodes,
        WorkspaceStatus::Running,
    )
    .await?;
    tx.commit().await.map_err(Error::from)
}

pub async fn upgrade(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: UpgradePayload = serde_json::from_value(task.payload.clone())?;
    let Some(ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    let mut spec = vcluster_spec(&ws, false);
    spec.kubernetes_version = payload.kubernetes_version.clone();
    ctx.gateway.apply_vcluster(&spec).await?;
    ctx.progress(
        task.id,
        "upgrade applied",
        serde_json::json!({"kubernetes_version": payload.kubernetes_version}),
    )
    .await;
    let wait = await_phase(
        ctx,
        task,
        &spec.namespace,
        &spec.instance_name,
        "upgrade rollout",
        |o| o.is_running(),
    )
    .await;
    error_on_cancel(ctx, task, wait).await?;

    let mut client = ctx.pool.get().await?;
    let tx = client.transaction().await?;
    let mut config = ws.config.clone().unwrap_or_else(|| serde_json::json!({}));
    if let Some(obj) = config.as_object_mut() {
        obj.insert(
            "kubernetes_version".to_string(),
            serde_json::json!(payload.kubernetes_version),
        );
    }
    workspaces::update_config(&*tx, ws.id, &config).await?;
    finish_transition(
        &*tx,
        ws.id,
        WorkspaceStatus::Upgrading,
        WorkspaceStatus::Running,
    )
    .await?;
    tx.commit().await.map_err(Error::from)
}

pub async fn backup(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Some(ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    let namespace = names::workspace_namespace(ws.id);
    let snapshot_name = names::backup_name(ws.id, task.id);
    let snapshot_ref = ctx.gateway.create_snapshot(&namespace, &snapshot_name).await?;
    ctx.progress(
        task.id,
        "snapshot requested",
        serde_json::json!({"snapshot_ref": snapshot_ref}),
    )
    .await;

    let snapshot_ref_for_poll = snapshot_ref.clone();
    let wait = ctx
        .poll_until(task.id, "snapshot", || {
            let snapshot_ref = snapshot_ref_for_poll.clone();
            async move {
                match ctx.gateway.get_snapshot_state(&snapshot_ref).await? {
                    SnapshotState::Completed => Ok(true),
                    SnapshotState::InProgress => Ok(false),
                    SnapshotState::Failed => Err(Error::ExternalUnavailable(format!(
                        "snapshot {snapshot_ref} failed on the host"
                    ))),
                }
            }
        })
        .await;
    error_on_cancel(ctx, task, wait).await?;

    let client = ctx.pool.get().await?;
    finish_transition(
        &**client,
        ws.id,
        WorkspaceStatus::BackingUp,
        WorkspaceStatus::Running,
    )
    .await?;
    ctx.progress(
        task.id,
        "backup complete",
        serde_json::json!({"snapshot_ref": snapshot_ref}),
    )
    .await;
    Ok(())
}

pub async fn restore(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: RestorePayload = serde_json::from_value(task.payload.clone())?;
    let Some(ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    let namespace = names::workspace_namespace(ws.id);
    let restore_ref = ctx
        .gateway
        .restore_snapshot(&namespace, &payload.backup_ref)
        .await?;
    ctx.progress(
        task.id,
        "restore requested",
        serde_json::json!({"restore_ref": restore_ref}),
    )
    .await;

    let wait = ctx
        .poll_until(task.id, "restore", || {
            let restore_ref = restore_ref.clone();
            async move {
                match ctx.gateway.get_restore_state(&restore_ref).await? {
                    SnapshotState::Completed => Ok(true),
                    SnapshotState::InProgress => Ok(false),
                    SnapshotState::Failed => Err(Error::ExternalUnavailable(format!(
                        "restore {restore_ref} failed on the host"
                    ))),
                }
            }
        })
        .await;
    error_on_cancel(ctx, task, wait).await?;

    let client = ctx.pool.get().await?;
    finish_transition(
        &**client,
        ws.id,
        WorkspaceStatus::Restoring,
        WorkspaceStatus::Running,
    )
    .await
}

pub async fn delete(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Some(ws) = begin(ctx, task).await? else {
        return Ok(());
    };
    rollback_on_cancel(ctx, task, ctx.checkpoint(task.id).await).await?;

    let namespace = names::workspace_namespace(ws.id);
    let instance = ws
        .instance_name
        .clone()
        .unwrap_or_else(|| names::instance_name(ws.id));

    ctx.gateway.delete_vcluster(&namespace, &instance).await?;

    // Tear down project namespaces and stored secrets before the
    // workspace namespace itself.
    {
        let client = ctx.pool.get().await?;
        let project_page = projects::list(&**client, ws.id, 0, i64::MAX).await?;
        for project in &project_page.items {
            if let Some(ns) = &project.k8s_namespace {
                let parent = match project.parent_project_id {
                    Some(parent_id) => projects::get(&**client, parent_id)
                        .await?
                        .and_then(|p| p.k8s_namespace)
                        .unwrap_or_else(|| namespace.clone()),
                    None => namespace.clone(),
                };
                ctx.gateway.delete_namespace_anchor(&parent, ns).await?;
                ctx.gateway.delete_namespace(ns).await?;
            }
        }
        for credential in credentials::list(&**client, ws.id).await? {
            ctx.vault
                .delete_kubernetes_secret(ws.id, &credential.name)
                .await?;
        }
    }

    ctx.gateway.delete_namespace(&namespace).await?;
    let wait = ctx
        .poll_until(task.id, "namespace teardown", || {
            let ns = namespace.clone();
            async move { Ok(!ctx.gateway.namespace_active(&ns).await?) }
        })
        .await;
    error_on_cancel(ctx, task, wait).await?;

    let client = ctx.pool.get().await?;
    workspaces::remove(&**client, ws.id).await?;
    ctx.progress(task.id, "workspace deleted", serde_json::json!({}))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_ms;

    fn workspace(config: Option<serde_json::Value>) -> Workspace {
        Workspace {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: "prod".into(),
            plan_id: "starter".into(),
            status: WorkspaceStatus::Running,
            instance_name: None,
            kubeconfig_ref: None,
            config,
            dedicated_node_config: None,
            error_task_kind: None,
            created_at: now_ms(),
            updated_at: now_ms(),
        }
    }

    #[test]
    fn vcluster_spec_is_deterministic_per_workspace() {
        let ws = workspace(None);
        let a = vcluster_spec(&ws, false);
        let b = vcluster_spec(&ws, false);
        assert_eq!(a, b);
        assert_eq!(a.instance_name, names::instance_name(ws.id));
        assert_eq!(a.namespace, names::workspace_namespace(ws.id));

        let other = workspace(None);
        assert_ne!(a.instance_name, vcluster_spec(&other, false).instance_name);
    }

    #[test]
    fn vcluster_spec_reads_version_from_config() {
        let ws = workspace(Some(serde_json::json!({"kubernetes_version": "1.29"})));
        assert_eq!(vcluster_spec(&ws, false).kubernetes_version, "1.29");

        let ws = workspace(None);
        assert_eq!(
            vcluster_spec(&ws, false).kubernetes_version,
            DEFAULT_KUBERNETES_VERSION
        );
    }

    #[test]
    fn stored_instance_name_wins_over_derived() {
        let mut ws = workspace(None);
        ws.instance_name = Some("vc-existing".into());
        assert_eq!(vcluster_spec(&ws, true).instance_name, "vc-existing");
        assert!(vcluster_spec(&ws, true).paused);
    }
}
