//! Durable FIFO-per-workspace task queue over Postgres.
//!
//! Delivery is at-least-once: handlers are written around deterministic
//! external names and transactional status transitions, so a re-run of
//! any step converges. Lease acquisition uses row locks with skip-locked
//! so workers never contend on the same head-of-queue row, and a stale
//! worker is fenced by the `lease_owner` check on every write.

use deadpool_postgres::Pool;
use std::collections::HashMap;
use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::{
    db::{now_ms, parse_enum},
    error::{Error, Result},
    models::{Page, Task, TaskKind, TaskStatus},
    tasks::QueueConfig,
};

const COLUMNS: &str = "id, workspace_id, kind, status, payload, attempt, max_attempts, \
                       lease_owner, lease_expires_at, available_at, cancel_requested, \
                       idempotency_key, requested_by, error_kind, error_message, progress, \
                       created_at, started_at, completed_at";

fn map_row(row: &Row) -> Result<Task> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Ok(Task {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        kind: parse_enum(&kind, "task kind")?,
        status: parse_enum(&status, "task status")?,
        payload: row.get("payload"),
        attempt: row.get("attempt"),
        max_attempts: row.get("max_attempts"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get("lease_expires_at"),
        available_at: row.get("available_at"),
        cancel_requested: row.get("cancel_requested"),
        idempotency_key: row.get("idempotency_key"),
        requested_by: row.get("requested_by"),
        error_kind: row.get("error_kind"),
        error_message: row.get("error_message"),
        progress: row.get("progress"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

pub struct EnqueueRequest<'a> {
    pub workspace_id: Uuid,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub requested_by: &'a str,
    pub max_attempts: i32,
}

/// Enqueue inside the caller's transaction.
///
/// An idempotency key matching an existing non-terminal task returns
/// that task's id without inserting. An exclusive kind with any
/// non-terminal sibling of the same kind is a `Conflict`; the partial
/// unique index catches the race this check cannot see.
pub async fn enqueue<C: GenericClient>(client: &C, req: EnqueueRequest<'_>) -> Result<Uuid> {
    if let Some(ref key) = req.idempotency_key {
        let existing = client
            .query_opt(
                r#"
                SELECT id FROM tasks
                WHERE workspace_id = $1
                  AND idempotency_key = $2
                  AND status IN ('pending', 'running')
                "#,
                &[&req.workspace_id, key],
            )
            .await?;
        if let Some(row) = existing {
            return Ok(row.get("id"));
        }
    }

    if req.kind.is_exclusive() {
        let conflicting = client
            .query_opt(
                r#"
                SELECT id FROM tasks
                WHERE workspace_id = $1
                  AND kind = $2
                  AND status IN ('pending', 'running')
                LIMIT 1
                "#,
                &[&req.workspace_id, &req.kind.as_str()],
            )
            .await?;
        if conflicting.is_some() {
            return Err(Error::Conflict(format!(
                "a {} task is already in flight for workspace {}",
                req.kind, req.workspace_id
            )));
        }
    }

    let id = Uuid::new_v4();
    let now = now_ms();
    client
        .execute(
            r#"
            INSERT INTO tasks
                (id, workspace_id, kind, status, payload, max_attempts,
                 available_at, idempotency_key, requested_by, created_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $6)
            "#,
            &[
                &id,
                &req.workspace_id,
                &req.kind.as_str(),
                &req.payload,
                &req.max_attempts,
                &now,
                &req.idempotency_key,
                &req.requested_by,
            ],
        )
        .await?;

    metrics::counter!("atoll_tasks_enqueued_total", "kind" => req.kind.as_str()).increment(1);
    Ok(id)
}

/// Lease the next runnable task for this worker.
///
/// A task is runnable when it is the head of its workspace queue (no
/// older pending sibling), its workspace has no running task, its
/// backoff delay has elapsed, and its kind is below the configured
/// concurrency ceiling. Candidates are locked with skip-locked so
/// parallel workers fan out across workspaces instead of queueing on
/// one row.
pub async fn lease(
    pool: &Pool,
    worker_id: &str,
    kinds: &[TaskKind],
    cfg: &QueueConfig,
    kind_limits: &HashMap<TaskKind, usize>,
) -> Result<Option<Task>> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;
    let now = now_ms();

    let running_by_kind: HashMap<TaskKind, i64> = {
        let rows = tx
            .query(
                "SELECT kind, COUNT(*) AS n FROM tasks WHERE status = 'running' GROUP BY kind",
                &[],
            )
            .await?;
        rows.iter()
            .filter_map(|r| {
                let kind: String = r.get("kind");
                kind.parse::<TaskKind>().ok().map(|k| (k, r.get("n")))
            })
            .collect()
    };

    let kind_strs: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
    let candidates = tx
        .query(
            &format!(
                r#"
                SELECT {COLUMNS}
                FROM tasks t
                WHERE t.status = 'pending'
                  AND t.kind = ANY($1)
                  AND t.available_at <= $2
                  AND NOT EXISTS (
                      SELECT 1 FROM tasks r
                      WHERE r.workspace_id = t.workspace_id AND r.status = 'running'
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM tasks p
                      WHERE p.workspace_id = t.workspace_id
                        AND p.status = 'pending'
                        AND (p.created_at, p.id) < (t.created_at, t.id)
                  )
                ORDER BY t.created_at ASC, t.id ASC
                LIMIT 16
                FOR UPDATE OF t SKIP LOCKED
                "#
            ),
            &[&kind_strs, &now],
        )
        .await?;

    let mut chosen = None;
    for row in &candidates {
        let task = map_row(row)?;
        if let Some(limit) = kind_limits.get(&task.kind) {
            let running = running_by_kind.get(&task.kind).copied().unwrap_or(0);
            if running >= *limit as i64 {
                continue;
            }
        }
        chosen = Some(task);
        break;
    }

    let Some(task) = chosen else {
        tx.rollback().await.map_err(Error::from)?;
        return Ok(None);
    };

    let expires = now + cfg.lease_duration.as_millis() as i64;
    let row = tx
        .query_one(
            &format!(
                r#"
                UPDATE tasks
                SET status = 'running',
                    lease_owner = $2,
                    lease_expires_at = $3,
                    attempt = attempt + 1,
                    started_at = COALESCE(started_at, $4)
                WHERE id = $1
                RETURNING {COLUMNS}
                "#
            ),
            &[&task.id, &worker_id, &expires, &now],
        )
        .await?;
    let leased = map_row(&row)?;
    tx.commit().await.map_err(Error::from)?;

    metrics::counter!("atoll_tasks_leased_total", "kind" => leased.kind.as_str()).increment(1);
    Ok(Some(leased))
}

/// Extend the lease. `Conflict` means the lease was lost (reaped and
/// possibly re-leased elsewhere); the caller must abandon the task.
pub async fn heartbeat(
    pool: &Pool,
    task_id: Uuid,
    worker_id: &str,
    cfg: &QueueConfig,
) -> Result<()> {
    let client = pool.get().await?;
    let expires = now_ms() + cfg.lease_duration.as_millis() as i64;
    let updated = client
        .execute(
            r#"
            UPDATE tasks
            SET lease_expires_at = $3
            WHERE id = $1 AND lease_owner = $2 AND status = 'running'
            "#,
            &[&task_id, &worker_id, &expires],
        )
        .await?;
    if updated == 0 {
        return Err(Error::Conflict(format!("lease on task {task_id} was lost")));
    }
    Ok(())
}

pub enum Outcome<'a> {
    Success,
    Failure(&'a Error),
    Cancelled,
}

/// What `complete` decided; drives the caller's FSM failure handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Reverted to pending; will be retried no earlier than this instant.
    Retried { available_at: i64 },
    Failed,
    Cancelled,
}

/// Terminal (or retrying) transition for a leased task. All writes are
/// fenced on `lease_owner`, so a worker whose lease expired mid-step
/// gets `Conflict` here instead of corrupting another worker's run.
pub async fn complete(
    pool: &Pool,
    task_id: Uuid,
    worker_id: &str,
    outcome: Outcome<'_>,
    cfg: &QueueConfig,
) -> Result<Disposition> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            r#"
            SELECT attempt, max_attempts FROM tasks
            WHERE id = $1 AND lease_owner = $2 AND status = 'running'
            FOR UPDATE
            "#,
            &[&task_id, &worker_id],
        )
        .await?;
    let Some(row) = row else {
        return Err(Error::Conflict(format!("lease on task {task_id} was lost")));
    };
    let attempt: i32 = row.get("attempt");
    let max_attempts: i32 = row.get("max_attempts");
    let now = now_ms();

    let disposition = match outcome {
        Outcome::Success => {
            tx.execute(
                r#"
                UPDATE tasks
                SET status = 'completed', completed_at = $2,
                    lease_owner = NULL, lease_expires_at = NULL,
                    error_kind = NULL, error_message = NULL
                WHERE id = $1
                "#,
                &[&task_id, &now],
            )
            .await?;
            Disposition::Completed
        }
        Outcome::Cancelled => {
            tx.execute(
                r#"
                UPDATE tasks
                SET status = 'cancelled', completed_at = $2,
                    lease_owner = NULL, lease_expires_at = NULL,
                    error_kind = 'Cancelled', error_message = NULL
                WHERE id = $1
                "#,
                &[&task_id, &now],
            )
            .await?;
            Disposition::Cancelled
        }
        Outcome::Failure(err) => {
            let retriable = err.is_retriable() && attempt < max_attempts;
            if retriable {
                let delay =
                    atoll_common::backoff::full_jitter(cfg.base_backoff, cfg.max_backoff, attempt as u32);
                let available_at = now + delay.as_millis() as i64;
                tx.execute(
                    r#"
                    UPDATE tasks
                    SET status = 'pending', available_at = $2,
                        lease_owner = NULL, lease_expires_at = NULL,
                        error_kind = $3, error_message = $4
                    WHERE id = $1
                    "#,
                    &[&task_id, &available_at, &err.kind_str(), &err.to_string()],
                )
                .await?;
                Disposition::Retried { available_at }
            } else {
                tx.execute(
                    r#"
                    UPDATE tasks
                    SET status = 'failed', completed_at = $2,
                        lease_owner = NULL, lease_expires_at = NULL,
                        error_kind = $3, error_message = $4
                    WHERE id = $1
                    "#,
                    &[&task_id, &now, &err.kind_str(), &err.to_string()],
                )
                .await?;
                Disposition::Failed
            }
        }
    };

    tx.commit().await.map_err(Error::from)?;
    let label = match &disposition {
        Disposition::Completed => "completed",
        Disposition::Retried { .. } => "retried",
        Disposition::Failed => "failed",
        Disposition::Cancelled => "cancelled",
    };
    metrics::counter!("atoll_tasks_completed_total", "disposition" => label).increment(1);
    Ok(disposition)
}

/// Cooperative cancellation. A still-pending task is cancelled outright
/// (it has had no side effects); a running task only gets the flag,
/// observed by its handler at the next checkpoint.
pub async fn request_cancel(pool: &Pool, task_id: Uuid) -> Result<TaskStatus> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            "SELECT status FROM tasks WHERE id = $1 FOR UPDATE",
            &[&task_id],
        )
        .await?;
    let Some(row) = row else {
        return Err(Error::NotFound(format!("task {task_id} not found")));
    };
    let status: String = row.get("status");
    let status: TaskStatus = parse_enum(&status, "task status")?;

    let result = match status {
        TaskStatus::Pending => {
            tx.execute(
                r#"
                UPDATE tasks
                SET status = 'cancelled', cancel_requested = TRUE,
                    completed_at = $2, error_kind = 'Cancelled'
                WHERE id = $1
                "#,
                &[&task_id, &now_ms()],
            )
            .await?;
            TaskStatus::Cancelled
        }
        TaskStatus::Running => {
            tx.execute(
                "UPDATE tasks SET cancel_requested = TRUE WHERE id = $1",
                &[&task_id],
            )
            .await?;
            TaskStatus::Running
        }
        terminal => terminal,
    };

    tx.commit().await.map_err(Error::from)?;
    Ok(result)
}

/// Poll the cancellation flag; handlers call this at phase boundaries.
pub async fn cancel_requested<C: GenericClient>(client: &C, task_id: Uuid) -> Result<bool> {
    let row = client
        .query_opt(
            "SELECT cancel_requested FROM tasks WHERE id = $1",
            &[&task_id],
        )
        .await?;
    Ok(row.map(|r| r.get("cancel_requested")).unwrap_or(false))
}

/// A task the reaper terminally failed; the caller applies the FSM
/// failure transition for it.
#[derive(Debug, Clone)]
pub struct ReapedFailure {
    pub task_id: Uuid,
    pub workspace_id: Uuid,
    pub kind: TaskKind,
}

/// Revert expired leases to pending so another worker picks them up.
/// Tasks already at the attempt ceiling are failed instead, otherwise a
/// crash-looping handler would exceed `max_attempts` via the reaper.
pub async fn reap_expired(pool: &Pool) -> Result<(u64, Vec<ReapedFailure>)> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;
    let now = now_ms();

    let failed_rows = tx
        .query(
            r#"
            UPDATE tasks
            SET status = 'failed', completed_at = $1,
                lease_owner = NULL, lease_expires_at = NULL,
                error_kind = 'Timeout',
                error_message = 'lease expired after final attempt'
            WHERE status = 'running'
              AND lease_expires_at < $1
              AND attempt >= max_attempts
            RETURNING id, workspace_id, kind
            "#,
            &[&now],
        )
        .await?;

    let reverted = tx
        .execute(
            r#"
            UPDATE tasks
            SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL
            WHERE status = 'running' AND lease_expires_at < $1
            "#,
            &[&now],
        )
        .await?;

    tx.commit().await.map_err(Error::from)?;

    let failures = failed_rows
        .iter()
        .map(|r| {
            let kind: String = r.get("kind");
            Ok(ReapedFailure {
                task_id: r.get("id"),
                workspace_id: r.get("workspace_id"),
                kind: parse_enum(&kind, "task kind")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if reverted > 0 || !failures.is_empty() {
        metrics::counter!("atoll_tasks_reaped_total").increment(reverted + failures.len() as u64);
        tracing::warn!(
            reverted,
            failed = failures.len(),
            "reaped expired task leases"
        );
    }
    Ok((reverted, failures))
}

/// Append an opaque progress event to the task row.
pub async fn record_progress<C: GenericClient>(
    client: &C,
    task_id: Uuid,
    message: &str,
    fields: serde_json::Value,
) -> Result<()> {
    let event = serde_json::json!({
        "ts": now_ms(),
        "message": message,
        "fields": fields,
    });
    client
        .execute(
            r#"
            UPDATE tasks
            SET progress = COALESCE(progress, '[]'::jsonb) || jsonb_build_array($2::jsonb)
            WHERE id = $1
            "#,
            &[&task_id, &event],
        )
        .await?;
    Ok(())
}

pub async fn get<C: GenericClient>(client: &C, task_id: Uuid) -> Result<Option<Task>> {
    let row = client
        .query_opt(&format!("SELECT {COLUMNS} FROM tasks WHERE id = $1"), &[&task_id])
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn require<C: GenericClient>(client: &C, task_id: Uuid) -> Result<Task> {
    get(client, task_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("task {task_id} not found")))
}

pub async fn list<C: GenericClient>(
    client: &C,
    workspace_id: Uuid,
    offset: i64,
    limit: i64,
) -> Result<Page<Task>> {
    let rows = client
        .query(
            &format!(
                r#"
                SELECT {COLUMNS}, COUNT(*) OVER() AS full_count
                FROM tasks
                WHERE workspace_id = $1
                ORDER BY created_at DESC, id DESC
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
