use deadpool_postgres::Pool;
use std::str::FromStr;

use crate::error::{Error, Result};

pub mod applications;
pub mod credentials;
pub mod cron;
pub mod functions;
pub mod orgs;
pub mod pipelines;
pub mod projects;
pub mod workspaces;

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Parse a persisted status string into its enum. The store only ever
/// writes `as_str()` values, so a miss here means schema corruption.
pub(crate) fn parse_enum<T: FromStr>(s: &str, what: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::Internal(format!("unmapped {what} value in store: {s:?}")))
}

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await?;

    client
        .batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                billing_ref TEXT,
                created_at BIGINT NOT NULL,
                deleted_at BIGINT
            );

            CREATE TABLE IF NOT EXISTS workspaces (
                id UUID PRIMARY KEY,
                org_id UUID NOT NULL REFERENCES organizations(id),
                name TEXT NOT NULL,
                plan_id TEXT NOT NULL,
                status TEXT NOT NULL,
                instance_name TEXT,
                kubeconfig_ref TEXT,
                config JSONB,
                dedicated_node_config JSONB,
                error_task_kind TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS uq_workspaces_instance_name
                ON workspaces (instance_name);

            CREATE TABLE IF NOT EXISTS projects (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                parent_project_id UUID REFERENCES projects(id),
                ns_status TEXT NOT NULL,
                k8s_namespace TEXT,
                hnc_anchor_name TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                UNIQUE (workspace_id, name)
            );

            -- No FK on workspace_id: task history (and GetTask polling)
            -- must survive the removal of a successfully deleted workspace.
            CREATE TABLE IF NOT EXISTS tasks (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
                payload JSONB NOT NULL DEFAULT '{}'::jsonb,
                attempt INT NOT NULL DEFAULT 0,
                max_attempts INT NOT NULL,
                lease_owner TEXT,
                lease_expires_at BIGINT,
                available_at BIGINT NOT NULL,
                cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
                idempotency_key TEXT,
                requested_by TEXT NOT NULL DEFAULT 'system',
                error_kind TEXT,
                error_message TEXT,
                progress JSONB,
                created_at BIGINT NOT NULL,
                started_at BIGINT,
                completed_at BIGINT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_workspace_status
                ON tasks (workspace_id, status);

            CREATE INDEX IF NOT EXISTS idx_tasks_status_available
                ON tasks (status, available_at);

            -- At most one non-terminal task per (workspace, kind) for the
            -- exclusive workspace mutations; races that slip past the
            -- service-level check surface as unique violations.
            CREATE UNIQUE INDEX IF NOT EXISTS uq_tasks_exclusive_kind
                ON tasks (workspace_id, kind)
                WHERE status IN ('pending', 'running')
                  AND kind IN ('CREATE', 'DELETE', 'UPDATE_PLAN', 'UPGRADE',
                               'BACKUP', 'RESTORE', 'START', 'STOP');

            CREATE UNIQUE INDEX IF NOT EXISTS uq_tasks_idempotency
                ON tasks (workspace_id, idempotency_key)
                WHERE status IN ('pending', 'running')
                  AND idempotency_key IS NOT NULL;

            CREATE TABLE IF NOT EXISTS applications (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                project_id UUID NOT NULL REFERENCES projects(id),
                name TEXT NOT NULL,
                app_type TEXT NOT NULL
                    CHECK (app_type IN ('stateless', 'cronjob', 'function')),
                source_type TEXT NOT NULL
                    CHECK (source_type IN ('image', 'git')),
                status TEXT NOT NULL,
                config JSONB NOT NULL DEFAULT '{}'::jsonb,
                cron_schedule TEXT,
                concurrency_policy TEXT,
                next_execution_at BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                UNIQUE (project_id, name)
            );

            CREATE INDEX IF NOT EXISTS idx_applications_next_execution
                ON applications (workspace_id, next_execution_at)
                WHERE next_execution_at IS NOT NULL;

            CREATE TABLE IF NOT EXISTS cronjob_executions (
                id UUID PRIMARY KEY,
                application_id UUID NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                job_name TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('running', 'succeeded', 'failed')),
                started_at BIGINT NOT NULL,
                completed_at BIGINT,
                exit_code INT,
                logs_ref TEXT,
                CHECK (completed_at IS NULL OR completed_at >= started_at)
            );

            CREATE INDEX IF NOT EXISTS idx_cronjob_executions_app_status
                ON cronjob_executions (application_id, status);

            CREATE TABLE IF NOT EXISTS function_versions (
                id UUID PRIMARY KEY,
                application_id UUID NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                version INT NOT NULL,
                build_status TEXT NOT NULL
                    CHECK (build_status IN ('building', 'succeeded', 'failed')),
                image_uri TEXT,
                is_active BOOLEAN NOT NULL DEFAULT FALSE,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                UNIQUE (application_id, version)
            );

            -- Exactly one active version per function, enforced even under
            -- concurrent activation attempts.
            CREATE UNIQUE INDEX IF NOT EXISTS uq_function_versions_active
                ON function_versions (application_id)
                WHERE is_active;

            CREATE TABLE IF NOT EXISTS pipelines (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                provider_type TEXT NOT NULL,
                config JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at BIGINT NOT NULL,
                UNIQUE (workspace_id, name)
            );

            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id UUID PRIMARY KEY,
                pipeline_id UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
                provider_run_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workspace_provider_configs (
                workspace_id UUID PRIMARY KEY REFERENCES workspaces(id) ON DELETE CASCADE,
                provider_type TEXT NOT NULL,
                config JSONB NOT NULL DEFAULT '{}'::jsonb,
                updated_at BIGINT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                credential_type TEXT NOT NULL,
                secret_ref TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                UNIQUE (workspace_id, name)
            );
            "#,
        )
        .await?;

    tracing::info!("database schema initialized");
    Ok(())
}
