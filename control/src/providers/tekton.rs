//! Built-in Tekton provider, speaking to the Tekton CRDs on the host
//! cluster through the dynamic API.

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt, stream::BoxStream};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client,
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams},
    core::GroupVersionKind,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{CiProvider, PipelineTemplate, ProviderFactory, ProviderInfo, RunHandle, RunStatus};
use crate::{
    error::{Error, Result},
    models::Pipeline,
    names,
};

const MANAGER_NAME: &str = "atoll-ci";
const TEKTON_NAMESPACE: &str = "tekton-pipelines";

fn pipeline_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("tekton.dev", "v1", "Pipeline"),
        "pipelines",
    )
}

fn pipeline_run_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("tekton.dev", "v1", "PipelineRun"),
        "pipelineruns",
    )
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TektonConfig {
    /// Namespace override; defaults to the workspace's host namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

pub struct TektonProvider {
    client: Client,
    config: TektonConfig,
}

impl TektonProvider {
    fn namespace_for(&self, workspace_id: Uuid) -> String {
        self.config
            .namespace
            .clone()
            .unwrap_or_else(|| names::workspace_namespace(workspace_id))
    }

    fn runs(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &pipeline_run_resource())
    }

    fn pipelines(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &pipeline_resource())
    }

    /// Run ids are `namespace/name` so status reads need no extra lookup.
    fn split_run_id(provider_run_id: &str) -> Result<(&str, &str)> {
        provider_run_id
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("bad run id {provider_run_id:?}")))
    }
}

/// Tekton signals completion through the `Succeeded` condition.
fn run_status_from(obj: &DynamicObject) -> RunStatus {
    let conditions = obj
        .data
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();
    let succeeded = conditions
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Succeeded"));

    let (status, finished, success) = match succeeded {
        Some(cond) => {
            let reason = cond
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("Unknown")
                .to_string();
            match cond.get("status").and_then(|s| s.as_str()) {
                Some("True") => (reason, true, Some(true)),
                Some("False") => (reason, true, Some(false)),
                _ => (reason, false, None),
            }
        }
        None => ("Pending".to_string(), false, None),
    };

    RunStatus {
        provider_run_id: format!(
            "{}/{}",
            obj.metadata.namespace.as_deref().unwrap_or_default(),
            obj.metadata.name.as_deref().unwrap_or_default()
        ),
        status,
        finished,
        success,
    }
}

#[async_trait]
impl CiProvider for TektonProvider {
    fn name(&self) -> &str {
        super::DEFAULT_PROVIDER
    }

    async fn validate_config(&self, config: &serde_json::Value) -> Result<()> {
        serde_json::from_value::<TektonConfig>(config.clone())
            .map_err(|e| Error::Validation(format!("bad tekton config: {e}")))?;
        Ok(())
    }

    async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        params: &BTreeMap<String, String>,
    ) -> Result<RunHandle> {
        let namespace = self.namespace_for(pipeline.workspace_id);
        let pipeline_name = names::deployment_name(pipeline.id, &pipeline.name);

        // Apply the Pipeline definition first so runs always reference
        // the stored revision of the definition.
        let mut tekton_pipeline = DynamicObject::new(&pipeline_name, &pipeline_resource());
        tekton_pipeline.metadata.namespace = Some(namespace.clone());
        tekton_pipeline.data = serde_json::json!({ "spec": pipeline.config });
        self.pipelines(&namespace)
            .patch(
                &pipeline_name,
                &PatchParams::apply(MANAGER_NAME).force(),
                &Patch::Apply(&tekton_pipeline),
            )
            .await?;

        let run_name = format!("{}-r{}", pipeline_name, names::short_id(Uuid::new_v4()));
        let tekton_params: Vec<serde_json::Value> = params
            .iter()
            .map(|(k, v)| serde_json::json!({"name": k, "value": v}))
            .collect();
        let mut run = DynamicObject::new(&run_name, &pipeline_run_resource());
        run.metadata.namespace = Some(namespace.clone());
        run.data = serde_json::json!({
            "spec": {
                "pipelineRef": { "name": pipeline_name },
                "params": tekton_params,
            }
        });
        self.runs(&namespace)
            .create(&Default::default(), &run)
            .await?;

        Ok(RunHandle {
            provider_run_id: format!("{namespace}/{run_name}"),
            status: "Pending".to_string(),
        })
    }

    async fn get_status(&self, provider_run_id: &str) -> Result<RunStatus> {
        let (namespace, name) = Self::split_run_id(provider_run_id)?;
        let obj = self
            .runs(namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pipeline run {provider_run_id}")))?;
        Ok(run_status_from(&obj))
    }

    async fn cancel_pipeline(&self, provider_run_id: &str) -> Result<()> {
        let (namespace, name) = Self::split_run_id(provider_run_id)?;
        let patch = serde_json::json!({"spec": {"status": "Cancelled"}});
        self.runs(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let namespace = self.namespace_for(pipeline.workspace_id);
        let pipeline_name = names::deployment_name(pipeline.id, &pipeline.name);
        match self
            .pipelines(&namespace)
            .delete(&pipeline_name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn get_logs(&self, provider_run_id: &str) -> Result<String> {
        let (namespace, name) = Self::split_run_id(provider_run_id)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("tekton.dev/pipelineRun={name}")))
            .await?;
        let mut out = String::new();
        for pod in list {
            let Some(pod_name) = pod.metadata.name else {
                continue;
            };
            let logs = pods
                .logs(&pod_name, &LogParams::default())
                .await
                .unwrap_or_default();
            out.push_str(&logs);
            out.push('\n');
        }
        Ok(out)
    }

    async fn stream_logs(
        &self,
        provider_run_id: &str,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let (namespace, name) = Self::split_run_id(provider_run_id)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("tekton.dev/pipelineRun={name}")))
            .await?;
        let Some(pod_name) = list.items.into_iter().find_map(|p| p.metadata.name) else {
            return Ok(Box::pin(futures::stream::empty()));
        };
        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        let stream = pods.log_stream(&pod_name, &params).await?;
        Ok(Box::pin(stream.lines().map(|line| {
            line.map_err(|e| Error::ExternalUnavailable(format!("log stream: {e}")))
        })))
    }

    async fn list_pipelines(&self, workspace_id: Uuid) -> Result<Vec<String>> {
        let namespace = self.namespace_for(workspace_id);
        let list = self.pipelines(&namespace).list(&ListParams::default()).await?;
        Ok(list.items.into_iter().filter_map(|p| p.metadata.name).collect())
    }

    async fn get_templates(&self) -> Result<Vec<PipelineTemplate>> {
        Ok(builtin_templates())
    }

    async fn create_from_template(
        &self,
        template_name: &str,
        pipeline_name: &str,
    ) -> Result<serde_json::Value> {
        let template = builtin_templates()
            .into_iter()
            .find(|t| t.name == template_name)
            .ok_or_else(|| Error::NotFound(format!("template {template_name:?}")))?;
        let mut definition = template.definition;
        if let Some(obj) = definition.as_object_mut() {
            obj.insert(
                "description".to_string(),
                serde_json::json!(format!("{pipeline_name} (from template {template_name})")),
            );
        }
        Ok(definition)
    }

    async fn is_healthy(&self) -> Result<bool> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), TEKTON_NAMESPACE);
        let Some(dep) = api.get_opt("tekton-pipelines-controller").await? else {
            return Ok(false);
        };
        Ok(dep
            .status
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0)
            > 0)
    }

    async fn get_version(&self) -> Result<String> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), TEKTON_NAMESPACE);
        let dep = api
            .get_opt("tekton-pipelines-controller")
            .await?
            .ok_or_else(|| Error::ExternalUnavailable("tekton controller not found".into()))?;
        let version = dep
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("app.kubernetes.io/version").cloned())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(version)
    }
}

fn builtin_templates() -> Vec<PipelineTemplate> {
    vec![
        PipelineTemplate {
            name: "build-and-push".to_string(),
            description: "Clone a git repository, build an image, push it".to_string(),
            definition: serde_json::json!({
                "params": [
                    {"name": "repo-url", "type": "string"},
                    {"name": "image", "type": "string"},
                ],
                "tasks": [
                    {
                        "name": "clone",
                        "taskRef": {"name": "git-clone"},
                        "params": [{"name": "url", "value": "$(params.repo-url)"}],
                    },
                    {
                        "name": "build",
                        "runAfter": ["clone"],
                        "taskRef": {"name": "kaniko"},
                        "params": [{"name": "IMAGE", "value": "$(params.image)"}],
                    },
                ],
            }),
        },
        PipelineTemplate {
            name: "deploy-manifests".to_string(),
            description: "Apply rendered manifests to the workspace cluster".to_string(),
            definition: serde_json::json!({
                "params": [{"name": "manifest-dir", "type": "string"}],
                "tasks": [
                    {
                        "name": "apply",
                        "taskRef": {"name": "kubernetes-actions"},
                        "params": [{"name": "script", "value": "kubectl apply -f $(params.manifest-dir)"}],
                    },
                ],
            }),
        },
    ]
}

pub struct TektonFactory {
    client: Client,
}

impl TektonFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ProviderFactory for TektonFactory {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            provider_type: super::DEFAULT_PROVIDER.to_string(),
            status: "available".to_string(),
            features: vec![
                "run".into(),
                "cancel".into(),
                "logs".into(),
                "templates".into(),
            ],
        }
    }

    fn create(&self, config: &serde_json::Value) -> Result<Arc<dyn CiProvider>> {
        let config: TektonConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Validation(format!("bad tekton config: {e}")))?;
        Ok(Arc::new(TektonProvider {
            client: self.client.clone(),
            config,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with_condition(status: &str, reason: &str) -> DynamicObject {
        let mut obj = DynamicObject::new("demo-r1", &pipeline_run_resource());
        obj.metadata.namespace = Some("ws-abc".into());
        obj.data = serde_json::json!({
            "status": {
                "conditions": [
                    {"type": "Succeeded", "status": status, "reason": reason},
                ],
            }
        });
        obj
    }

    #[test]
    fn succeeded_condition_maps_to_finished_success() {
        let status = run_status_from(&run_with_condition("True", "Succeeded"));
        assert!(status.finished);
        assert_eq!(status.success, Some(true));
        assert_eq!(status.provider_run_id, "ws-abc/demo-r1");
    }

    #[test]
    fn failed_condition_maps_to_finished_failure() {
        let status = run_status_from(&run_with_condition("False", "PipelineRunTimeout"));
        assert!(status.finished);
        assert_eq!(status.success, Some(false));
        assert_eq!(status.status, "PipelineRunTimeout");
    }

    #[test]
    fn unknown_condition_is_still_in_flight() {
        let status = run_status_from(&run_with_condition("Unknown", "Running"));
        assert!(!status.finished);
        assert_eq!(status.success, None);

        let mut bare = DynamicObject::new("r", &pipeline_run_resource());
        bare.metadata.namespace = Some("ns".into());
        let status = run_status_from(&bare);
        assert!(!status.finished);
        assert_eq!(status.status, "Pending");
    }
}
