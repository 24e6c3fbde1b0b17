use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::{
    db::{now_ms, parse_enum},
    error::{Error, Result},
    models::{Page, TaskKind, Workspace, WorkspaceStatus},
};

fn map_row(row: &Row) -> Result<Workspace> {
    let status: String = row.get("status");
    let error_task_kind: Option<String> = row.get("error_task_kind");
    Ok(Workspace {
        id: row.get("id"),
        org_id: row.get("org_id"),
        name: row.get("name"),
        plan_id: row.get("plan_id"),
        status: parse_enum(&status, "workspace status")?,
        instance_name: row.get("instance_name"),
        kubeconfig_ref: row.get("kubeconfig_ref"),
        config: row.get("config"),
        dedicated_node_config: row.get("dedicated_node_config"),
        error_task_kind: error_task_kind
            .as_deref()
            .map(|k| parse_enum::<TaskKind>(k, "task kind"))
            .transpose()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const COLUMNS: &str = "id, org_id, name, plan_id, status, instance_name, kubeconfig_ref, \
                       config, dedicated_node_config, error_task_kind, created_at, updated_at";

/// Insert a new workspace in PENDING_CREATION.
pub async fn create<C: GenericClient>(
    client: &C,
    id: Uuid,
    org_id: Uuid,
    name: &str,
    plan_id: &str,
    config: Option<&serde_json::Value>,
    dedicated_node_config: Option<&serde_json::Value>,
) -> Result<Workspace> {
    let now = now_ms();
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO workspaces
                    (id, org_id, name, plan_id, status, config, dedicated_node_config,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                RETURNING {COLUMNS}
                "#
            ),
            &[
                &id,
                &org_id,
                &name,
                &plan_id,
                &WorkspaceStatus::PendingCreation.as_str(),
                &config,
                &dedicated_node_config,
                &now,
            ],
        )
        .await?;
    map_row(&row)
}

pub async fn get<C: GenericClient>(client: &C, id: Uuid) -> Result<Option<Workspace>> {
    let row = client
        .query_opt(
            &format!("SELECT {COLUMNS} FROM workspaces WHERE id = $1"),
            &[&id],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

/// Like `get` but takes a row lock; use inside state transitions so the
/// From-state check and the status write are atomic.
pub async fn get_for_update<C: GenericClient>(client: &C, id: Uuid) -> Result<Option<Workspace>> {
    let row = client
        .query_opt(
            &format!("SELECT {COLUMNS} FROM workspaces WHERE id = $1 FOR UPDATE"),
            &[&id],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn require<C: GenericClient>(client: &C, id: Uuid) -> Result<Workspace> {
    get(client, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("workspace {id} not found")))
}

/// List workspaces, optionally scoped to one organization.
/// Uses a window function for efficient full count retrieval.
pub async fn list<C: GenericClient>(
    client: &C,
    org_id: Option<Uuid>,
    offset: i64,
    limit: i64,
) -> Result<Page<Workspace>> {
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {COLUMNS}, COUNT(*) OVER() AS full_count
                FROM workspaces
                WHERE ($1::uuid IS NULL OR org_id = $1)
                ORDER BY created_at ASC, id ASC
                LIMIT $2
                OFFSET $3
                "#
            ),
            &[&org_id, &limit, &offset],
        )
        .await?;

    let full_count: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
    let items = rows.iter().map(map_row).collect::<Result<Vec<_>>>()?;
    let truncated = offset + (items.len() as i64) < full_count;

    Ok(Page {
        offset,
        limit,
        full_count,
        truncated,
        items,
    })
}

/// Compare-and-set the workspace status. Returns `Conflict` when the row
/// is no longer in `from`, so stale transitions fail fast.
pub async fn transition_status<C: GenericClient>(
    client: &C,
    id: Uuid,
    from: WorkspaceStatus,
    to: WorkspaceStatus,
) -> Result<()> {
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
            &[&id, &from.as_str(), &to.as_str(), &now_ms()],
        )
        .await?;
    if updated == 0 {
        return Err(Error::Conflict(format!(
            "workspace {id} is no longer in {from}"
        )));
    }
    Ok(())
}

/// Unconditional status write, used when the prior state was already
/// verified under the same transaction's row lock.
pub async fn set_status<C: GenericClient>(
    client: &C,
    id: Uuid,
    to: WorkspaceStatus,
) -> Result<()> {
    client
        .execute(
            "UPDATE workspaces SET status = $2, updated_at = $3 WHERE id = $1",
            &[&id, &to.as_str(), &now_ms()],
        )
        .await?;
    Ok(())
}

/// Record the kind that drove the workspace into ERROR (cleared on the
/// next successful transition out of ERROR).
pub async fn set_error_kind<C: GenericClient>(
    client: &C,
    id: Uuid,
    kind: Option<TaskKind>,
) -> Result<()> {
    client
        .execute(
            "UPDATE workspaces SET error_task_kind = $2, updated_at = $3 WHERE id = $1",
            &[&id, &kind.map(|k| k.as_str()), &now_ms()],
        )
        .await?;
    Ok(())
}

/// Persist the artefacts derived during CREATE. The instance name is
/// write-once: a second write with a different value is refused.
pub async fn set_instance<C: GenericClient>(
    client: &C,
    id: Uuid,
    instance_name: &str,
    kubeconfig_ref: &str,
) -> Result<()> {
    let updated = client
        .execute(
            r#"
            UPDATE workspaces
            SET instance_name = $2, kubeconfig_ref = $3, updated_at = $4
            WHERE id = $1 AND (instance_name IS NULL OR instance_name = $2)
            "#,
            &[&id, &instance_name, &kubeconfig_ref, &now_ms()],
        )
        .await?;
    if updated == 0 {
        return Err(Error::Conflict(format!(
            "workspace {id} already has a different instance name"
        )));
    }
    Ok(())
}

pub async fn update_plan<C: GenericClient>(client: &C, id: Uuid, plan_id: &str) -> Result<()> {
    client
        .execute(
            "UPDATE workspaces SET plan_id = $2, updated_at = $3 WHERE id = $1",
            &[&id, &plan_id, &now_ms()],
        )
        .await?;
    Ok(())
}

pub async fn update_config<C: GenericClient>(
    client: &C,
    id: Uuid,
    config: &serde_json::Value,
) -> Result<()> {
    client
        .execute(
            "UPDATE workspaces SET config = $2, updated_at = $3 WHERE id = $1",
            &[&id, &config, &now_ms()],
        )
        .await?;
    Ok(())
}

pub async fn update_node_config<C: GenericClient>(
    client: &C,
    id: Uuid,
    dedicated_node_config: &serde_json::Value,
) -> Result<()> {
    client
        .execute(
            "UPDATE workspaces SET dedicated_node_config = $2, updated_at = $3 WHERE id = $1",
            &[&id, &dedicated_node_config, &now_ms()],
        )
        .await?;
    Ok(())
}

/// Remove the row after a successful DELETE task. Dependent rows cascade.
pub async fn remove<C: GenericClient>(client: &C, id: Uuid) -> Result<bool> {
    let deleted = client
        .execute("DELETE FROM workspaces WHERE id = $1", &[&id])
        .await?;
    Ok(deleted > 0)
}

/// Count workspaces still attached to an organization.
pub async fn count_for_org<C: GenericClient>(client: &C, org_id: Uuid) -> Result<i64> {
    let row = client
        .query_one(
            "SELECT COUNT(*) AS n FROM workspaces WHERE org_id = $1",
            &[&org_id],
        )
        .await?;
    Ok(row.get("n"))
}
