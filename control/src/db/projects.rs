use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::{
    db::{now_ms, parse_enum},
    error::{Error, Result},
    models::{Page, Project, ProjectStatus},
};

const COLUMNS: &str = "id, workspace_id, name, parent_project_id, ns_status, k8s_namespace, \
                       hnc_anchor_name, created_at, updated_at";

fn map_row(row: &Row) -> Result<Project> {
    let status: String = row.get("ns_status");
    Ok(Project {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        name: row.get("name"),
        parent_project_id: row.get("parent_project_id"),
        ns_status: parse_enum(&status, "project status")?,
        k8s_namespace: row.get("k8s_namespace"),
        hnc_anchor_name: row.get("hnc_anchor_name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Insert a project in PENDING_CREATION with its namespace already
/// chosen; the namespace is immutable from here on.
pub async fn create<C: GenericClient>(
    client: &C,
    id: Uuid,
    workspace_id: Uuid,
    name: &str,
    parent_project_id: Option<Uuid>,
    k8s_namespace: &str,
    hnc_anchor_name: &str,
) -> Result<Project> {
    let now = now_ms();
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO projects
                    (id, workspace_id, name, parent_project_id, ns_status,
                     k8s_namespace, hnc_anchor_name, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                RETURNING {COLUMNS}
                "#
            ),
            &[
                &id,
                &workspace_id,
                &name,
                &parent_project_id,
                &ProjectStatus::PendingCreation.as_str(),
                &k8s_namespace,
                &hnc_anchor_name,
                &now,
            ],
        )
        .await?;
    map_row(&row)
}

pub async fn get<C: GenericClient>(client: &C, id: Uuid) -> Result<Option<Project>> {
    let row = client
        .query_opt(
            &format!("SELECT {COLUMNS} FROM projects WHERE id = $1"),
            &[&id],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn require<C: GenericClient>(client: &C, id: Uuid) -> Result<Project> {
    get(client, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {id} not found")))
}

pub async fn list<C: GenericClient>(
    client: &C,
    workspace_id: Uuid,
    offset: i64,
    limit: i64,
) -> Result<Page<Project>> {
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {COLUMNS}, COUNT(*) OVER() AS full_count
                FROM projects
                WHERE workspace_id = $1
                ORDER BY name ASC, id ASC
                LIMIT $2
                OFFSET $3
                "#
            ),
            &[&workspace_id, &limit, &offset],
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

/// Direct children of a project. Descendants are computed by walking
/// this query, never stored on the parent.
pub async fn list_children<C: GenericClient>(
    client: &C,
    parent_project_id: Uuid,
) -> Result<Vec<Project>> {
    let rows = client
        .query(
            &format!(
                "SELECT {COLUMNS} FROM projects WHERE parent_project_id = $1 ORDER BY name ASC"
            ),
            &[&parent_project_id],
        )
        .await?;
    rows.iter().map(map_row).collect()
}

pub async fn set_status<C: GenericClient>(client: &C, id: Uuid, to: ProjectStatus) -> Result<()> {
    client
        .execute(
            "UPDATE projects SET ns_status = $2, updated_at = $3 WHERE id = $1",
            &[&id, &to.as_str(), &now_ms()],
        )
        .await?;
    Ok(())
}

pub async fn remove<C: GenericClient>(client: &C, id: Uuid) -> Result<bool> {
    let deleted = client
        .execute("DELETE FROM projects WHERE id = $1", &[&id])
        .await?;
    Ok(deleted > 0)
}

/// Applications still referencing the project; guards deletion.
pub async fn count_applications<C: GenericClient>(client: &C, project_id: Uuid) -> Result<i64> {
    let row = client
        .query_one(
            "SELECT COUNT(*) AS n FROM applications WHERE project_id = $1",
            &[&project_id],
        )
        .await?;
    Ok(row.get("n"))
}
