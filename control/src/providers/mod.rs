//! Pluggable CI/CD providers.
//!
//! A provider is a fixed capability set behind [`CiProvider`]; the
//! registry maps a provider type string to a factory and caches one
//! instance per workspace to amortize connection setup. Which provider
//! a workspace uses comes from its stored provider config; the built-in
//! default is `tekton`.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use futures::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    db::pipelines,
    error::{Error, Result},
    models::Pipeline,
};

pub mod tekton;

pub const DEFAULT_PROVIDER: &str = "tekton";

#[derive(Debug, Clone)]
pub struct RunHandle {
    pub provider_run_id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct RunStatus {
    pub provider_run_id: String,
    pub status: String,
    pub finished: bool,
    pub success: Option<bool>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineTemplate {
    pub name: String,
    pub description: String,
    pub definition: serde_json::Value,
}

/// Registry metadata for a provider type. Status and features are
/// configuration, not code.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderInfo {
    pub provider_type: String,
    pub status: String,
    pub features: Vec<String>,
}

#[async_trait]
pub trait CiProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn validate_config(&self, config: &serde_json::Value) -> Result<()>;

    async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        params: &BTreeMap<String, String>,
    ) -> Result<RunHandle>;

    async fn get_status(&self, provider_run_id: &str) -> Result<RunStatus>;

    async fn cancel_pipeline(&self, provider_run_id: &str) -> Result<()>;

    async fn delete_pipeline(&self, pipeline: &Pipeline) -> Result<()>;

    async fn get_logs(&self, provider_run_id: &str) -> Result<String>;

    async fn stream_logs(&self, provider_run_id: &str)
    -> Result<BoxStream<'static, Result<String>>>;

    async fn list_pipelines(&self, workspace_id: Uuid) -> Result<Vec<String>>;

    async fn get_templates(&self) -> Result<Vec<PipelineTemplate>>;

    async fn create_from_template(
        &self,
        template_name: &str,
        pipeline_name: &str,
    ) -> Result<serde_json::Value>;

    async fn is_healthy(&self) -> Result<bool>;

    async fn get_version(&self) -> Result<String>;
}

pub trait ProviderFactory: Send + Sync {
    fn info(&self) -> ProviderInfo;
    fn create(&self, config: &serde_json::Value) -> Result<Arc<dyn CiProvider>>;
}

/// Maps provider type strings to factories and caches instances per
/// workspace.
pub struct ProviderRegistry {
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
    cache: Mutex<HashMap<Uuid, (String, Arc<dyn CiProvider>)>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The production registry: every built-in provider registered.
    pub fn with_builtins(client: kube::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(tekton::TektonFactory::new(client)));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(factory.info().provider_type, factory);
    }

    pub fn list_provider_info(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<_> = self.factories.values().map(|f| f.info()).collect();
        infos.sort_by(|a, b| a.provider_type.cmp(&b.provider_type));
        infos
    }

    /// Instantiate a provider directly from a type + config.
    pub fn create(
        &self,
        provider_type: &str,
        config: &serde_json::Value,
    ) -> Result<Arc<dyn CiProvider>> {
        let factory = self.factories.get(provider_type).ok_or_else(|| {
            Error::Validation(format!("unknown provider type {provider_type:?}"))
        })?;
        factory.create(config)
    }

    /// Provider for a workspace, honoring its stored configuration and
    /// reusing the cached instance while the type is unchanged.
    pub async fn get_for_workspace(
        &self,
        pool: &Pool,
        workspace_id: Uuid,
    ) -> Result<Arc<dyn CiProvider>> {
        let client = pool.get().await?;
        let stored = pipelines::get_provider_config(&**client, workspace_id).await?;
        let (provider_type, config) = match stored {
            Some(cfg) => (cfg.provider_type, cfg.config),
            None => (DEFAULT_PROVIDER.to_string(), serde_json::json!({})),
        };

        let mut cache = self.cache.lock().await;
        if let Some((cached_type, provider)) = cache.get(&workspace_id)
            && *cached_type == provider_type
        {
            return Ok(provider.clone());
        }

        let provider = self.create(&provider_type, &config)?;
        cache.insert(workspace_id, (provider_type, provider.clone()));
        Ok(provider)
    }

    /// Drop the cached instance (e.g. after the admin changes the
    /// workspace's provider config).
    pub async fn invalidate(&self, workspace_id: Uuid) {
        self.cache.lock().await.remove(&workspace_id);
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        name: String,
    }

    #[async_trait]
    impl CiProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn validate_config(&self, _config: &serde_json::Value) -> Result<()> {
            Ok(())
        }

        async fn run_pipeline(
            &self,
            _pipeline: &Pipeline,
            _params: &BTreeMap<String, String>,
        ) -> Result<RunHandle> {
            Ok(RunHandle {
                provider_run_id: "run-1".into(),
                status: "Running".into(),
            })
        }

        async fn get_status(&self, provider_run_id: &str) -> Result<RunStatus> {
            Ok(RunStatus {
                provider_run_id: provider_run_id.into(),
                status: "Succeeded".into(),
                finished: true,
                success: Some(true),
            })
        }

        async fn cancel_pipeline(&self, _provider_run_id: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_pipeline(&self, _pipeline: &Pipeline) -> Result<()> {
            Ok(())
        }

        async fn get_logs(&self, _provider_run_id: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn stream_logs(
            &self,
            _provider_run_id: &str,
        ) -> Result<BoxStream<'static, Result<String>>> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn list_pipelines(&self, _workspace_id: Uuid) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn get_templates(&self) -> Result<Vec<PipelineTemplate>> {
            Ok(vec![])
        }

        async fn create_from_template(
            &self,
            _template_name: &str,
            _pipeline_name: &str,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }

        async fn is_healthy(&self) -> Result<bool> {
            Ok(true)
        }

        async fn get_version(&self) -> Result<String> {
            Ok("fake".into())
        }
    }

    struct FakeFactory;

    impl ProviderFactory for FakeFactory {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                provider_type: "fake".into(),
                status: "available".into(),
                features: vec!["run".into()],
            }
        }

        fn create(&self, _config: &serde_json::Value) -> Result<Arc<dyn CiProvider>> {
            Ok(Arc::new(FakeProvider {
                name: "fake".into(),
            }))
        }
    }

    #[test]
    fn unknown_provider_type_is_a_validation_error() {
        let registry = ProviderRegistry::new();
        let err = registry
            .create("nope", &serde_json::json!({}))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn registered_factory_is_listed_and_creatable() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeFactory));
        let infos = registry.list_provider_info();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].provider_type, "fake");
        let provider = registry.create("fake", &serde_json::json!({})).unwrap();
        assert_eq!(provider.name(), "fake");
    }
}
