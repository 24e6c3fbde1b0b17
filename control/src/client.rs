use anyhow::{Context, Result, bail};
use reqwest::Client;
use uuid::Uuid;

use crate::models::{
    CreateProjectRequest, CreateWorkspaceRequest, Page, Project, Task, TaskAccepted, TaskStatus,
    Workspace,
};

/// Client for the control plane HTTP API; backs the operator CLI.
#[derive(Clone)]
pub struct ControlClient {
    client: Client,
    base_url: String,
    user: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
pub struct WorkspaceAccepted {
    pub workspace: Workspace,
    pub task_id: Uuid,
}

#[derive(Debug, serde::Deserialize)]
pub struct ProjectAccepted {
    pub project: Project,
    pub task_id: Uuid,
}

impl ControlClient {
    pub fn new(base_url: &str, user: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(user) = &self.user {
            builder = builder.header("x-atoll-user", user);
        }
        builder
    }

    async fn expect_ok(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("request failed with {status}: {body}")
    }

    pub async fn health(&self) -> Result<()> {
        let resp = self
            .request(reqwest::Method::GET, "/healthz")
            .send()
            .await
            .context("failed to send health request")?;
        Self::expect_ok(resp).await.map(|_| ())
    }

    pub async fn create_workspace(
        &self,
        req: &CreateWorkspaceRequest,
    ) -> Result<WorkspaceAccepted> {
        let resp = self
            .request(reqwest::Method::POST, "/workspaces")
            .json(req)
            .send()
            .await
            .context("failed to send create workspace request")?;
        Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse create workspace response")
    }

    pub async fn get_workspace(&self, id: Uuid) -> Result<Workspace> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/workspaces/{id}"))
            .send()
            .await
            .context("failed to send get workspace request")?;
        Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse workspace")
    }

    pub async fn list_workspaces(&self, offset: i64, limit: i64) -> Result<Page<Workspace>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/workspaces?offset={offset}&limit={limit}"),
            )
            .send()
            .await
            .context("failed to send list workspaces request")?;
        Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse workspace list")
    }

    pub async fn lifecycle(&self, id: Uuid, verb: &str) -> Result<TaskAccepted> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/workspaces/{id}/{verb}"))
            .send()
            .await
            .with_context(|| format!("failed to send {verb} request"))?;
        Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse task acceptance")
    }

    pub async fn delete_workspace(&self, id: Uuid) -> Result<TaskAccepted> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/workspaces/{id}"))
            .send()
            .await
            .context("failed to send delete workspace request")?;
        Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse task acceptance")
    }

    pub async fn create_project(
        &self,
        workspace_id: Uuid,
        req: &CreateProjectRequest,
    ) -> Result<ProjectAccepted> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/workspaces/{workspace_id}/projects"),
            )
            .json(req)
            .send()
            .await
            .context("failed to send create project request")?;
        Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse create project response")
    }

    pub async fn list_projects(
        &self,
        workspace_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Page<Project>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/workspaces/{workspace_id}/projects?offset={offset}&limit={limit}"),
            )
            .send()
            .await
            .context("failed to send list projects request")?;
        Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse project list")
    }

    pub async fn delete_project(&self, id: Uuid) -> Result<Uuid> {
        #[derive(serde::Deserialize)]
        struct Accepted {
            task_id: Uuid,
        }
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/projects/{id}"))
            .send()
            .await
            .context("failed to send delete project request")?;
        let accepted: Accepted = Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse task acceptance")?;
        Ok(accepted.task_id)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/tasks/{id}"))
            .send()
            .await
            .context("failed to send get task request")?;
        Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse task")
    }

    pub async fn cancel_task(&self, id: Uuid) -> Result<TaskStatus> {
        #[derive(serde::Deserialize)]
        struct CancelResponse {
            status: TaskStatus,
        }
        let resp = self
            .request(reqwest::Method::POST, &format!("/tasks/{id}/cancel"))
            .send()
            .await
            .context("failed to send cancel request")?;
        let body: CancelResponse = Self::expect_ok(resp)
            .await?
            .json()
            .await
            .context("failed to parse cancel response")?;
        Ok(body.status)
    }
}
