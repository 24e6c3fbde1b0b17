use tokio_postgres::{GenericClient, Row};
use uuid::Uuid;

use crate::{
    db::now_ms,
    error::{Error, Result},
    models::Credential,
};

fn map_row(row: &Row) -> Credential {
    Credential {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        name: row.get("name"),
        credential_type: row.get("credential_type"),
        secret_ref: row.get("secret_ref"),
        created_at: row.get("created_at"),
    }
}

/// Insert the credential row. Runs in the same transaction that awaits
/// the vault write, so the row never exists without its secret.
pub async fn create<C: GenericClient>(
    client: &C,
    id: Uuid,
    workspace_id: Uuid,
    name: &str,
    credential_type: &str,
    secret_ref: &str,
) -> Result<Credential> {
    let row = client
        .query_one(
            r#"
            INSERT INTO credentials
                (id, workspace_id, name, credential_type, secret_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, workspace_id, name, credential_type, secret_ref, created_at
            "#,
            &[
                &id,
                &workspace_id,
                &name,
                &credential_type,
                &secret_ref,
                &now_ms(),
            ],
        )
        .await?;
    Ok(map_row(&row))
}

pub async fn list<C: GenericClient>(client: &C, workspace_id: Uuid) -> Result<Vec<Credential>> {
    let rows = client
        .query(
            "SELECT id, workspace_id, name, credential_type, secret_ref, created_at \
             FROM credentials WHERE workspace_id = $1 ORDER BY name ASC",
            &[&workspace_id],
        )
        .await?;
    Ok(rows.iter().map(map_row).collect())
}

pub async fn remove<C: GenericClient>(
    client: &C,
    workspace_id: Uuid,
    name: &str,
) -> Result<bool> {
    let deleted = client
        .execute(
            "DELETE FROM credentials WHERE workspace_id = $1 AND name = $2",
            &[&workspace_id, &name],
        )
        .await?;
    Ok(deleted > 0)
}
