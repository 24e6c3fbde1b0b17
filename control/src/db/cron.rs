use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::{
    db::{now_ms, parse_enum},
    error::{Error, Result},
    models::{CronJobExecution, ExecutionStatus, Page},
};

const COLUMNS: &str =
    "id, application_id, job_name, status, started_at, completed_at, exit_code, logs_ref";

fn map_row(row: &Row) -> Result<CronJobExecution> {
    let status: String = row.get("status");
    Ok(CronJobExecution {
        id: row.get("id"),
        application_id: row.get("application_id"),
        job_name: row.get("job_name"),
        status: parse_enum(&status, "execution status")?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        exit_code: row.get("exit_code"),
        logs_ref: row.get("logs_ref"),
    })
}

/// Insert a new execution in `running`. With `Forbid` concurrency the
/// caller must hold the application row lock and have checked
/// `count_running` in the same transaction.
pub async fn create<C: GenericClient>(
    client: &C,
    id: Uuid,
    application_id: Uuid,
    job_name: &str,
) -> Result<CronJobExecution> {
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO cronjob_executions (id, application_id, job_name, status, started_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {COLUMNS}
                "#
            ),
            &[
                &id,
                &application_id,
                &job_name,
                &ExecutionStatus::Running.as_str(),
                &now_ms(),
            ],
        )
        .await?;
    map_row(&row)
}

pub async fn get<C: GenericClient>(client: &C, id: Uuid) -> Result<Option<CronJobExecution>> {
    let row = client
        .query_opt(
            &format!("SELECT {COLUMNS} FROM cronjob_executions WHERE id = $1"),
            &[&id],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn list<C: GenericClient>(
    client: &C,
    application_id: Uuid,
    offset: i64,
    limit: i64,
) -> Result<Page<CronJobExecution>> {
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {COLUMNS}, COUNT(*) OVER() AS full_count
                FROM cronjob_executions
                WHERE application_id = $1
                ORDER BY started_at DESC, id DESC
                LIMIT $2
                OFFSET $3
                "#
            ),
            &[&application_id, &limit, &offset],
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

/// Executions currently `running` for an application.
pub async fn count_running<C: GenericClient>(client: &C, application_id: Uuid) -> Result<i64> {
    let row = client
        .query_one(
            r#"
            SELECT COUNT(*) AS n
            FROM cronjob_executions
            WHERE application_id = $1 AND status = 'running'
            "#,
            &[&application_id],
        )
        .await?;
    Ok(row.get("n"))
}

/// Terminal write for an execution. `completed_at` is clamped so it never
/// precedes `started_at` even across clock skew between workers.
pub async fn finish<C: GenericClient>(
    client: &C,
    id: Uuid,
    status: ExecutionStatus,
    exit_code: Option<i32>,
    logs_ref: Option<&str>,
) -> Result<()> {
    let updated = client
        .execute(
            r#"
            UPDATE cronjob_executions
            SET status = $2,
                completed_at = GREATEST($3, started_at),
                exit_code = $4,
                logs_ref = $5
            WHERE id = $1 AND status = 'running'
            "#,
            &[&id, &status.as_str(), &now_ms(), &exit_code, &logs_ref],
        )
        .await?;
    if updated == 0 {
        return Err(Error::Conflict(format!(
            "execution {id} is not running anymore"
        )));
    }
    Ok(())
}
