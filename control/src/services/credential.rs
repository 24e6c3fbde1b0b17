use deadpool_postgres::Pool;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    db::{credentials, workspaces},
    error::{Error, Result},
    models::{CreateCredentialRequest, Credential},
    vault::SecretVault,
};

/// Store the secret material first, then the record; the record only
/// exists once the vault write is durable. A crash in between leaves an
/// orphan secret that the next create with the same name overwrites.
pub async fn create(
    pool: &Pool,
    vault: &Arc<dyn SecretVault>,
    workspace_id: Uuid,
    req: &CreateCredentialRequest,
) -> Result<Credential> {
    if req.name.trim().is_empty() {
        return Err(Error::Validation("credential name must not be empty".into()));
    }

    let secret_ref = match req.credential_type.as_str() {
        "git" => {
            let username = req.data.get("username").map(|s| s.as_str()).unwrap_or("git");
            let token = req
                .data
                .get("token")
                .ok_or_else(|| Error::Validation("git credentials require data.token".into()))?;
            vault
                .store_git_credential(workspace_id, &req.name, username, token)
                .await?
        }
        "registry" => {
            let server = req.data.get("server").ok_or_else(|| {
                Error::Validation("registry credentials require data.server".into())
            })?;
            let username = req.data.get("username").ok_or_else(|| {
                Error::Validation("registry credentials require data.username".into())
            })?;
            let password = req.data.get("password").ok_or_else(|| {
                Error::Validation("registry credentials require data.password".into())
            })?;
            vault
                .store_registry_credential(workspace_id, &req.name, server, username, password)
                .await?
        }
        "opaque" => {
            vault
                .create_kubernetes_secret(workspace_id, &req.name, &req.data)
                .await?
        }
        other => {
            return Err(Error::Validation(format!(
                "unknown credential type {other:?} (expected git, registry, or opaque)"
            )));
        }
    };

    let client = pool.get().await?;
    workspaces::require(&**client, workspace_id).await?;
    credentials::create(
        &**client,
        Uuid::new_v4(),
        workspace_id,
        &req.name,
        &req.credential_type,
        &secret_ref,
    )
    .await
}

/// Remove record and secret together; both sides are idempotent.
pub async fn delete(
    pool: &Pool,
    vault: &Arc<dyn SecretVault>,
    workspace_id: Uuid,
    name: &str,
) -> Result<bool> {
    let client = pool.get().await?;
    let removed = credentials::remove(&**client, workspace_id, name).await?;
    vault.delete_kubernetes_secret(workspace_id, name).await?;
    Ok(removed)
}

pub async fn list(pool: &Pool, workspace_id: Uuid) -> Result<Vec<Credential>> {
    let client = pool.get().await?;
    credentials::list(&**client, workspace_id).await
}
