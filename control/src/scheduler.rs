//! Cron scheduler: scans `(workspace_id, next_execution_at)` for due
//! cron applications, fires executions with deterministic idempotency
//! keys, and advances the schedule. Schedules are interpreted in UTC.

use chrono::{TimeZone, Utc};
use deadpool_postgres::Pool;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    db::{self, applications, cron as cron_db, workspaces},
    error::{Error, Result},
    models::{Application, ConcurrencyPolicy, TaskKind, WorkspaceStatus},
    names,
    reconciler::EngineConfig,
    tasks::{CronExecutionPayload, queue},
};

/// How many due rows one tick picks up.
const SCAN_LIMIT: i64 = 100;

/// The `cron` crate wants a seconds field; operators write classic
/// five-field expressions. Normalize by prepending `0`.
fn normalize(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn validate_schedule(expr: &str) -> Result<()> {
    cron::Schedule::from_str(&normalize(expr))
        .map(|_| ())
        .map_err(|e| Error::Validation(format!("invalid cron expression {expr:?}: {e}")))
}

/// Next occurrence strictly after `after_ms`, as epoch millis (UTC).
/// `None` for schedules with no future occurrence.
pub fn next_occurrence(expr: &str, after_ms: i64) -> Result<Option<i64>> {
    let schedule = cron::Schedule::from_str(&normalize(expr))
        .map_err(|e| Error::Validation(format!("invalid cron expression {expr:?}: {e}")))?;
    let after = Utc
        .timestamp_millis_opt(after_ms)
        .single()
        .ok_or_else(|| Error::Validation(format!("timestamp {after_ms} out of range")))?;
    Ok(schedule
        .after(&after)
        .next()
        .map(|dt| dt.timestamp_millis()))
}

pub async fn run(pool: &Pool, cfg: &EngineConfig, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(cfg.cron_tick_interval) => {}
        }
        if let Err(e) = tick(pool, cfg).await {
            tracing::warn!(error = %e, "cron tick failed");
        }
    }
}

/// One scheduler pass. Safe to run concurrently with other replicas:
/// the application row lock plus task idempotency keys make a double
/// fire converge on one execution.
pub async fn tick(pool: &Pool, cfg: &EngineConfig) -> Result<()> {
    let now = db::now_ms();
    let due = {
        let client = pool.get().await?;
        applications::list_due_cronjobs(&**client, now, SCAN_LIMIT).await?
    };

    for app in due {
        if let Err(e) = fire(pool, cfg, &app, now).await {
            tracing::warn!(application = %app.id, error = %e, "cron fire failed");
        }
    }
    Ok(())
}

async fn fire(pool: &Pool, cfg: &EngineConfig, app: &Application, now: i64) -> Result<()> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    // Re-read under lock; another replica may have advanced the row.
    let row = tx
        .query_opt(
            "SELECT next_execution_at, cron_schedule FROM applications WHERE id = $1 FOR UPDATE",
            &[&app.id],
        )
        .await?;
    let Some(row) = row else {
        return Ok(());
    };
    let due_at: Option<i64> = row.get("next_execution_at");
    let schedule: Option<String> = row.get("cron_schedule");
    let (Some(due_at), Some(schedule)) = (due_at, schedule) else {
        return Ok(());
    };
    if due_at > now {
        return Ok(()); // already advanced
    }

    let next = next_occurrence(&schedule, now)?;
    applications::set_next_execution(&*tx, app.id, next).await?;

    // Skip the run (but keep the schedule moving) when the workspace is
    // not serviceable or Forbid concurrency blocks it.
    let workspace = workspaces::get(&*tx, app.workspace_id).await?;
    let running_ws = workspace
        .map(|w| w.status == WorkspaceStatus::Running)
        .unwrap_or(false);
    if !running_ws {
        tracing::debug!(application = %app.id, "workspace not running; skipping cron fire");
        tx.commit().await.map_err(Error::from)?;
        return Ok(());
    }
    if app.concurrency_policy == Some(ConcurrencyPolicy::Forbid)
        && cron_db::count_running(&*tx, app.id).await? > 0
    {
        tracing::debug!(application = %app.id, "previous execution still running; skipping");
        tx.commit().await.map_err(Error::from)?;
        return Ok(());
    }

    let execution_id = Uuid::new_v4();
    let execution = cron_db::create(
        &*tx,
        execution_id,
        app.id,
        &names::execution_job_name(execution_id),
    )
    .await?;
    queue::enqueue(
        &*tx,
        queue::EnqueueRequest {
            workspace_id: app.workspace_id,
            kind: TaskKind::CronjobExecution,
            payload: serde_json::to_value(CronExecutionPayload {
                application_id: app.id,
                execution_id: execution.id,
            })?,
            // Keyed by the scheduled instant: a crashed tick that
            // already enqueued will not double-fire.
            idempotency_key: Some(format!("cron-{}-{}", app.id, due_at)),
            requested_by: atoll_common::SYSTEM_USER,
            max_attempts: cfg.queue.max_attempts,
        },
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    tracing::info!(
        application = %app.id,
        execution = %execution.id,
        "cron execution fired"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    #[test]
    fn five_field_expressions_are_accepted() {
        validate_schedule("*/5 * * * *").unwrap();
        validate_schedule("0 3 * * 1").unwrap();
    }

    #[test]
    fn bad_expressions_are_validation_errors() {
        assert!(matches!(
            validate_schedule("not a cron"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate_schedule("61 * * * *"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn next_occurrence_is_strictly_future_and_utc() {
        let after = ms(2025, 3, 1, 12, 2, 30);
        let next = next_occurrence("*/5 * * * *", after).unwrap().unwrap();
        assert_eq!(next, ms(2025, 3, 1, 12, 5, 0));
        assert!(next > after);
    }

    #[test]
    fn next_occurrence_advances_past_exact_hits() {
        // If we are exactly on a boundary, the next run is the next
        // boundary, not the current instant.
        let after = ms(2025, 3, 1, 12, 5, 0);
        let next = next_occurrence("*/5 * * * *", after).unwrap().unwrap();
        assert_eq!(next, ms(2025, 3, 1, 12, 10, 0));
    }

    #[test]
    fn daily_schedule_rolls_to_next_day() {
        let after = ms(2025, 3, 1, 23, 59, 59);
        let next = next_occurrence("30 6 * * *", after).unwrap().unwrap();
        assert_eq!(next, ms(2025, 3, 2, 6, 30, 0));
    }
}
