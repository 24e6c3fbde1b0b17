use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::{
    db::now_ms,
    error::{Error, Result},
    models::{Page, Pipeline, PipelineRun, WorkspaceProviderConfig},
};

fn map_pipeline(row: &Row) -> Pipeline {
    Pipeline {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        name: row.get("name"),
        provider_type: row.get("provider_type"),
        config: row.get("config"),
        created_at: row.get("created_at"),
    }
}

fn map_run(row: &Row) -> PipelineRun {
    PipelineRun {
        id: row.get("id"),
        pipeline_id: row.get("pipeline_id"),
        provider_run_id: row.get("provider_run_id"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn create<C: GenericClient>(
    client: &C,
    id: Uuid,
    workspace_id: Uuid,
    name: &str,
    provider_type: &str,
    config: &serde_json::Value,
) -> Result<Pipeline> {
    let row = client
        .query_one(
            r#"
            INSERT INTO pipelines (id, workspace_id, name, provider_type, config, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, workspace_id, name, provider_type, config, created_at
            "#,
            &[&id, &workspace_id, &name, &provider_type, &config, &now_ms()],
        )
        .await?;
    Ok(map_pipeline(&row))
}

pub async fn get<C: GenericClient>(client: &C, id: Uuid) -> Result<Option<Pipeline>> {
    let row = client
        .query_opt(
            "SELECT id, workspace_id, name, provider_type, config, created_at \
             FROM pipelines WHERE id = $1",
            &[&id],
        )
        .await?;
    Ok(row.as_ref().map(map_pipeline))
}

pub async fn require<C: GenericClient>(client: &C, id: Uuid) -> Result<Pipeline> {
    get(client, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("pipeline {id} not found")))
}

pub async fn list<C: GenericClient>(
    client: &C,
    workspace_id: Uuid,
    offset: i64,
    limit: i64,
) -> Result<Page<Pipeline>> {
    let rows = client
        .query(
            r#"
            SELECT id, workspace_id, name, provider_type, config, created_at,
                   COUNT(*) OVER() AS full_count
            FROM pipelines
            WHERE workspace_id = $1
            ORDER BY name ASC, id ASC
            LIMIT $2
            OFFSET $3
            "#,
            &[&workspace_id, &limit, &offset],
        )
        .await?;

    let full_count: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
    let items: Vec<Pipeline> = rows.iter().map(map_pipeline).collect();
    let truncated = offset + (items.len() as i64) < full_count;

    Ok(Page {
        offset,
        limit,
        full_count,
        truncated,
        items,
    })
}

pub async fn remove<C: GenericClient>(client: &C, id: Uuid) -> Result<bool> {
    let deleted = client
        .execute("DELETE FROM pipelines WHERE id = $1", &[&id])
        .await?;
    Ok(deleted > 0)
}

/// Record a run handed to the provider; both our id and the provider's.
pub async fn create_run<C: GenericClient>(
    client: &C,
    id: Uuid,
    pipeline_id: Uuid,
    provider_run_id: &str,
    status: &str,
) -> Result<PipelineRun> {
    let now = now_ms();
    let row = client
        .query_one(
            r#"
            INSERT INTO pipeline_runs
                (id, pipeline_id, provider_run_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING id, pipeline_id, provider_run_id, status, created_at, updated_at
            "#,
            &[&id, &pipeline_id, &provider_run_id, &status, &now],
        )
        .await?;
    Ok(map_run(&row))
}

pub async fn get_run<C: GenericClient>(client: &C, id: Uuid) -> Result<Option<PipelineRun>> {
    let row = client
        .query_opt(
            "SELECT id, pipeline_id, provider_run_id, status, created_at, updated_at \
             FROM pipeline_runs WHERE id = $1",
            &[&id],
        )
        .await?;
    Ok(row.as_ref().map(map_run))
}

pub async fn list_runs<C: GenericClient>(
    client: &C,
    pipeline_id: Uuid,
) -> Result<Vec<PipelineRun>> {
    let rows = client
        .query(
            "SELECT id, pipeline_id, provider_run_id, status, created_at, updated_at \
             FROM pipeline_runs WHERE pipeline_id = $1 ORDER BY created_at DESC",
            &[&pipeline_id],
        )
        .await?;
    Ok(rows.iter().map(map_run).collect())
}

/// Refresh the last observed provider status.
pub async fn update_run_status<C: GenericClient>(client: &C, id: Uuid, status: &str) -> Result<()> {
    client
        .execute(
            "UPDATE pipeline_runs SET status = $2, updated_at = $3 WHERE id = $1",
            &[&id, &status, &now_ms()],
        )
        .await?;
    Ok(())
}

// ---- per-workspace provider selection ----

pub async fn get_provider_config<C: GenericClient>(
    client: &C,
    workspace_id: Uuid,
) -> Result<Option<WorkspaceProviderConfig>> {
    let row = client
        .query_opt(
            "SELECT workspace_id, provider_type, config, updated_at \
             FROM workspace_provider_configs WHERE workspace_id = $1",
            &[&workspace_id],
        )
        .await?;
    Ok(row.map(|r| WorkspaceProviderConfig {
        workspace_id: r.get("workspace_id"),
        provider_type: r.get("provider_type"),
        config: r.get("config"),
        updated_at: r.get("updated_at"),
    }))
}

pub async fn set_provider_config<C: GenericClient>(
    client: &C,
    workspace_id: Uuid,
    provider_type: &str,
    config: &serde_json::Value,
) -> Result<()> {
    client
        .execute(
            r#"
            INSERT INTO workspace_provider_configs (workspace_id, provider_type, config, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workspace_id) DO UPDATE
            SET provider_type = EXCLUDED.provider_type,
                config = EXCLUDED.config,
                updated_at = EXCLUDED.updated_at
            "#,
            &[&workspace_id, &provider_type, &config, &now_ms()],
        )
        .await?;
    Ok(())
}
