use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::{
    db::{now_ms, parse_enum},
    error::{Error, Result},
    models::{
        AppStatus, AppType, Application, ConcurrencyPolicy, Page, SourceType,
    },
};

const COLUMNS: &str = "id, workspace_id, project_id, name, app_type, source_type, status, \
                       config, cron_schedule, concurrency_policy, next_execution_at, \
                       created_at, updated_at";

fn map_row(row: &Row) -> Result<Application> {
    let app_type: String = row.get("app_type");
    let source_type: String = row.get("source_type");
    let status: String = row.get("status");
    let concurrency_policy: Option<String> = row.get("concurrency_policy");
    Ok(Application {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        app_type: parse_enum(&app_type, "application type")?,
        source_type: parse_enum(&source_type, "source type")?,
        status: parse_enum(&status, "application status")?,
        config: row.get("config"),
        cron_schedule: row.get("cron_schedule"),
        concurrency_policy: concurrency_policy
            .as_deref()
            .map(|p| parse_enum::<ConcurrencyPolicy>(p, "concurrency policy"))
            .transpose()?,
        next_execution_at: row.get("next_execution_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn create<C: GenericClient>(
    client: &C,
    id: Uuid,
    workspace_id: Uuid,
    project_id: Uuid,
    name: &str,
    app_type: AppType,
    source_type: SourceType,
    config: &serde_json::Value,
    cron_schedule: Option<&str>,
    concurrency_policy: Option<ConcurrencyPolicy>,
    next_execution_at: Option<i64>,
) -> Result<Application> {
    let now = now_ms();
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO applications
                    (id, workspace_id, project_id, name, app_type, source_type, status,
                     config, cron_schedule, concurrency_policy, next_execution_at,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
                RETURNING {COLUMNS}
                "#
            ),
            &[
                &id,
                &workspace_id,
                &project_id,
                &name,
                &app_type.as_str(),
                &source_type.as_str(),
                &AppStatus::Pending.as_str(),
                &config,
                &cron_schedule,
                &concurrency_policy.map(|p| p.as_str()),
                &next_execution_at,
                &now,
            ],
        )
        .await?;
    map_row(&row)
}

pub async fn get<C: GenericClient>(client: &C, id: Uuid) -> Result<Option<Application>> {
    let row = client
        .query_opt(
            &format!("SELECT {COLUMNS} FROM applications WHERE id = $1"),
            &[&id],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn require<C: GenericClient>(client: &C, id: Uuid) -> Result<Application> {
    get(client, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("application {id} not found")))
}

pub async fn list<C: GenericClient>(
    client: &C,
    workspace_id: Uuid,
    project_id: Option<Uuid>,
    offset: i64,
    limit: i64,
) -> Result<Page<Application>> {
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {COLUMNS}, COUNT(*) OVER() AS full_count
                FROM applications
                WHERE workspace_id = $1
                  AND ($2::uuid IS NULL OR project_id = $2)
                ORDER BY name ASC, id ASC
                LIMIT $3
                OFFSET $4
                "#
            ),
            &[&workspace_id, &project_id, &limit, &offset],
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

pub async fn set_status<C: GenericClient>(client: &C, id: Uuid, to: AppStatus) -> Result<()> {
    client
        .execute(
            "UPDATE applications SET status = $2, updated_at = $3 WHERE id = $1",
            &[&id, &to.as_str(), &now_ms()],
        )
        .await?;
    Ok(())
}

/// Store a new cron schedule together with its recomputed next run.
pub async fn update_schedule<C: GenericClient>(
    client: &C,
    id: Uuid,
    cron_schedule: &str,
    next_execution_at: i64,
) -> Result<()> {
    client
        .execute(
            r#"
            UPDATE applications
            SET cron_schedule = $2, next_execution_at = $3, updated_at = $4
            WHERE id = $1 AND app_type = 'cronjob'
            "#,
            &[&id, &cron_schedule, &next_execution_at, &now_ms()],
        )
        .await?;
    Ok(())
}

pub async fn set_next_execution<C: GenericClient>(
    client: &C,
    id: Uuid,
    next_execution_at: Option<i64>,
) -> Result<()> {
    client
        .execute(
            "UPDATE applications SET next_execution_at = $2, updated_at = $3 WHERE id = $1",
            &[&id, &next_execution_at, &now_ms()],
        )
        .await?;
    Ok(())
}

/// Cron applications whose next run is due. The scheduler advances
/// `next_execution_at` before enqueueing, so a crashed tick re-reads the
/// same rows and converges through task idempotency keys.
pub async fn list_due_cronjobs<C: GenericClient>(
    client: &C,
    now: i64,
    limit: i64,
) -> Result<Vec<Application>> {
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {COLUMNS}
                FROM applications
                WHERE app_type = 'cronjob'
                  AND next_execution_at IS NOT NULL
                  AND next_execution_at <= $1
                ORDER BY next_execution_at ASC
                LIMIT $2
                "#
            ),
            &[&now, &limit],
        )
        .await?;
    rows.iter().map(map_row).collect()
}

pub async fn remove<C: GenericClient>(client: &C, id: Uuid) -> Result<bool> {
    let deleted = client
        .execute("DELETE FROM applications WHERE id = $1", &[&id])
        .await?;
    Ok(deleted > 0)
}
