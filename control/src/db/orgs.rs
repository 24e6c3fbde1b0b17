use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::{
    db::now_ms,
    error::{Error, Result},
    models::Organization,
};

fn map_row(row: &Row) -> Organization {
    Organization {
        id: row.get("id"),
        name: row.get("name"),
        owner_id: row.get("owner_id"),
        billing_ref: row.get("billing_ref"),
        created_at: row.get("created_at"),
        deleted_at: row.get("deleted_at"),
    }
}

pub async fn create<C: GenericClient>(
    client: &C,
    id: Uuid,
    name: &str,
    owner_id: &str,
    billing_ref: Option<&str>,
) -> Result<Organization> {
    let row = client
        .query_one(
            r#"
            INSERT INTO organizations (id, name, owner_id, billing_ref, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, owner_id, billing_ref, created_at, deleted_at
            "#,
            &[&id, &name, &owner_id, &billing_ref, &now_ms()],
        )
        .await?;
    Ok(map_row(&row))
}

/// Get an organization by ID if it is not soft-deleted.
pub async fn get<C: GenericClient>(client: &C, id: Uuid) -> Result<Option<Organization>> {
    let row = client
        .query_opt(
            r#"
            SELECT id, name, owner_id, billing_ref, created_at, deleted_at
            FROM organizations
            WHERE id = $1 AND deleted_at IS NULL
            "#,
            &[&id],
        )
        .await?;
    Ok(row.as_ref().map(map_row))
}

pub async fn require<C: GenericClient>(client: &C, id: Uuid) -> Result<Organization> {
    get(client, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("organization {id} not found")))
}

/// Soft-delete; refused while workspaces remain attached.
pub async fn soft_delete<C: GenericClient>(client: &C, id: Uuid) -> Result<bool> {
    let remaining = super::workspaces::count_for_org(client, id).await?;
    if remaining > 0 {
        return Err(Error::PreconditionFailed(format!(
            "organization {id} still owns {remaining} workspace(s)"
        )));
    }
    let updated = client
        .execute(
            "UPDATE organizations SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL",
            &[&id, &now_ms()],
        )
        .await?;
    Ok(updated > 0)
}
