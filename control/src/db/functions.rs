use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::{
    db::{now_ms, parse_enum},
    error::{Error, Result},
    models::{BuildStatus, FunctionVersion},
};

const COLUMNS: &str =
    "id, application_id, version, build_status, image_uri, is_active, created_at, updated_at";

fn map_row(row: &Row) -> Result<FunctionVersion> {
    let build_status: String = row.get("build_status");
    Ok(FunctionVersion {
        id: row.get("id"),
        application_id: row.get("application_id"),
        version: row.get("version"),
        build_status: parse_enum(&build_status, "build status")?,
        image_uri: row.get("image_uri"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Allocate the next version number and insert it in `building`.
/// Callers run this inside a transaction; the unique index on
/// (application_id, version) turns a racing allocation into `Conflict`.
pub async fn create_next<C: GenericClient>(
    client: &C,
    id: Uuid,
    application_id: Uuid,
) -> Result<FunctionVersion> {
    let now = now_ms();
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO function_versions
                    (id, application_id, version, build_status, created_at, updated_at)
                SELECT $1, $2,
                       COALESCE(MAX(version), 0) + 1,
                       $3, $4, $4
                FROM function_versions
                WHERE application_id = $2
                RETURNING {COLUMNS}
                "#
            ),
            &[&id, &application_id, &BuildStatus::Building.as_str(), &now],
        )
        .await?;
    map_row(&row)
}

pub async fn get<C: GenericClient>(client: &C, id: Uuid) -> Result<Option<FunctionVersion>> {
    let row = client
        .query_opt(
            &format!("SELECT {COLUMNS} FROM function_versions WHERE id = $1"),
            &[&id],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn get_by_version<C: GenericClient>(
    client: &C,
    application_id: Uuid,
    version: i32,
) -> Result<Option<FunctionVersion>> {
    let row = client
        .query_opt(
            &format!(
                "SELECT {COLUMNS} FROM function_versions \
                 WHERE application_id = $1 AND version = $2"
            ),
            &[&application_id, &version],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}

pub async fn list<C: GenericClient>(
    client: &C,
    application_id: Uuid,
) -> Result<Vec<FunctionVersion>> {
    let rows = client
        .query(
            &format!(
                "SELECT {COLUMNS} FROM function_versions \
                 WHERE application_id = $1 ORDER BY version DESC"
            ),
            &[&application_id],
        )
        .await?;
    rows.iter().map(map_row).collect()
}

pub async fn set_build_result<C: GenericClient>(
    client: &C,
    id: Uuid,
    build_status: BuildStatus,
    image_uri: Option<&str>,
) -> Result<()> {
    client
        .execute(
            r#"
            UPDATE function_versions
            SET build_status = $2, image_uri = $3, updated_at = $4
            WHERE id = $1
            "#,
            &[&id, &build_status.as_str(), &image_uri, &now_ms()],
        )
        .await?;
    Ok(())
}

/// Atomically make `version_id` the single active version of the
/// function. Must run inside a transaction: the previous active row is
/// deactivated first so the partial unique index never sees two actives.
/// Activating the already-active version is a no-op.
pub async fn activate<C: GenericClient>(
    client: &C,
    application_id: Uuid,
    version_id: Uuid,
) -> Result<FunctionVersion> {
    let target = get(client, version_id)
        .await?
        .filter(|v| v.application_id == application_id)
        .ok_or_else(|| Error::NotFound(format!("function version {version_id} not found")))?;

    if target.build_status != BuildStatus::Succeeded {
        return Err(Error::PreconditionFailed(format!(
            "version {} has not completed its build (status: {})",
            target.version,
            target.build_status.as_str()
        )));
    }

    let now = now_ms();
    client
        .execute(
            r#"
            UPDATE function_versions
            SET is_active = FALSE, updated_at = $2
            WHERE application_id = $1 AND is_active AND id <> $3
            "#,
            &[&application_id, &now, &version_id],
        )
        .await?;

    let row = client
        .query_one(
            &format!(
                r#"
                UPDATE function_versions
                SET is_active = TRUE, updated_at = $2
                WHERE id = $1
                RETURNING {COLUMNS}
                "#
            ),
            &[&version_id, &now],
        )
        .await?;
    map_row(&row)
}

pub async fn get_active<C: GenericClient>(
    client: &C,
    application_id: Uuid,
) -> Result<Option<FunctionVersion>> {
    let row = client
        .query_opt(
            &format!(
                "SELECT {COLUMNS} FROM function_versions \
                 WHERE application_id = $1 AND is_active"
            ),
            &[&application_id],
        )
        .await?;
    row.as_ref().map(map_row).transpose()
}
