//! Secret vault capability: opaque bytes in, opaque reference strings
//! out. The backend is interchangeable; the default writes Kubernetes
//! Secrets into a dedicated host namespace. Writes are awaited before
//! any domain operation reports success, and deletes are idempotent.

use async_trait::async_trait;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams},
};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    names,
};
use atoll_common::labels;

#[derive(Debug, Clone)]
pub struct CredentialRef {
    pub name: String,
    pub secret_ref: String,
}

#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Store a git token; returns the opaque secret reference.
    async fn store_git_credential(
        &self,
        workspace_id: Uuid,
        name: &str,
        username: &str,
        token: &str,
    ) -> Result<String>;

    /// Store registry credentials as a dockerconfigjson secret.
    async fn store_registry_credential(
        &self,
        workspace_id: Uuid,
        name: &str,
        server: &str,
        username: &str,
        password: &str,
    ) -> Result<String>;

    /// Store arbitrary opaque key/value material.
    async fn create_kubernetes_secret(
        &self,
        workspace_id: Uuid,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Idempotent: deleting an absent secret succeeds.
    async fn delete_kubernetes_secret(&self, workspace_id: Uuid, name: &str) -> Result<()>;

    async fn get_credential_ref(&self, workspace_id: Uuid, name: &str) -> Result<Option<String>>;

    async fn list_credentials(&self, workspace_id: Uuid) -> Result<Vec<CredentialRef>>;
}

/// Field manager for vault writes.
const MANAGER_NAME: &str = "atoll-vault";

pub struct KubeSecretVault {
    client: Client,
    namespace: String,
}

impl KubeSecretVault {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secret_ref(&self, secret_name: &str) -> String {
        format!("{}/{}", self.namespace, secret_name)
    }

    async fn apply(
        &self,
        workspace_id: Uuid,
        secret_name: &str,
        type_: &str,
        string_data: BTreeMap<String, String>,
    ) -> Result<String> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (labels::MANAGED_BY.into(), labels::MANAGED_BY_VALUE.into()),
                    (labels::WORKSPACE_ID.into(), workspace_id.to_string()),
                ])),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            string_data: Some(string_data),
            ..Default::default()
        };
        self.api()
            .patch(
                secret_name,
                &PatchParams::apply(MANAGER_NAME).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        Ok(self.secret_ref(secret_name))
    }
}

#[async_trait]
impl SecretVault for KubeSecretVault {
    async fn store_git_credential(
        &self,
        workspace_id: Uuid,
        name: &str,
        username: &str,
        token: &str,
    ) -> Result<String> {
        let secret_name = names::credential_secret_name(workspace_id, name);
        self.apply(
            workspace_id,
            &secret_name,
            "Opaque",
            BTreeMap::from([
                ("username".to_string(), username.to_string()),
                ("token".to_string(), token.to_string()),
            ]),
        )
        .await
    }

    async fn store_registry_credential(
        &self,
        workspace_id: Uuid,
        name: &str,
        server: &str,
        username: &str,
        password: &str,
    ) -> Result<String> {
        let secret_name = names::credential_secret_name(workspace_id, name);
        let auth = base64::engine::general_purpose::STANDARD
            .encode(format!("{username}:{password}"));
        let dockerconfig = serde_json::json!({
            "auths": {
                server: {
                    "username": username,
                    "password": password,
                    "auth": auth,
                }
            }
        });
        self.apply(
            workspace_id,
            &secret_name,
            "kubernetes.io/dockerconfigjson",
            BTreeMap::from([(".dockerconfigjson".to_string(), dockerconfig.to_string())]),
        )
        .await
    }

    async fn create_kubernetes_secret(
        &self,
        workspace_id: Uuid,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<String> {
        let secret_name = names::credential_secret_name(workspace_id, name);
        self.apply(workspace_id, &secret_name, "Opaque", data.clone())
            .await
    }

    async fn delete_kubernetes_secret(&self, workspace_id: Uuid, name: &str) -> Result<()> {
        let secret_name = names::credential_secret_name(workspace_id, name);
        match self
            .api()
            .delete(&secret_name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn get_credential_ref(&self, workspace_id: Uuid, name: &str) -> Result<Option<String>> {
        let secret_name = names::credential_secret_name(workspace_id, name);
        Ok(self
            .api()
            .get_opt(&secret_name)
            .await?
            .map(|_| self.secret_ref(&secret_name)))
    }

    async fn list_credentials(&self, workspace_id: Uuid) -> Result<Vec<CredentialRef>> {
        let selector = format!("{}={}", labels::WORKSPACE_ID, workspace_id);
        let list = self
            .api()
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .map(|name| CredentialRef {
                secret_ref: self.secret_ref(&name),
                name,
            })
            .collect())
    }
}
