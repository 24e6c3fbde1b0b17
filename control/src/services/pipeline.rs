use deadpool_postgres::Pool;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{
    db::{pipelines, workspaces},
    error::{Error, Result},
    models::{CreatePipelineRequest, Pipeline, PipelineRun, SetProviderConfigRequest},
    providers::{DEFAULT_PROVIDER, ProviderRegistry, RunStatus},
};

/// Create a pipeline after the selected provider accepts its config.
pub async fn create(
    pool: &Pool,
    registry: &ProviderRegistry,
    workspace_id: Uuid,
    req: &CreatePipelineRequest,
) -> Result<Pipeline> {
    let provider_type = req
        .provider_type
        .clone()
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
    let provider = registry.create(&provider_type, &serde_json::json!({}))?;
    provider.validate_config(&req.config).await?;

    let client = pool.get().await?;
    workspaces::require(&**client, workspace_id).await?;
    pipelines::create(
        &**client,
        Uuid::new_v4(),
        workspace_id,
        &req.name,
        &provider_type,
        &req.config,
    )
    .await
}

/// Hand a run to the provider and persist both ids.
pub async fn run(
    pool: &Pool,
    registry: &ProviderRegistry,
    pipeline_id: Uuid,
    params: &BTreeMap<String, String>,
) -> Result<PipelineRun> {
    let client = pool.get().await?;
    let pipeline = pipelines::require(&**client, pipeline_id).await?;
    let provider = registry
        .get_for_workspace(pool, pipeline.workspace_id)
        .await?;
    let handle = provider.run_pipeline(&pipeline, params).await?;
    pipelines::create_run(
        &**client,
        Uuid::new_v4(),
        pipeline.id,
        &handle.provider_run_id,
        &handle.status,
    )
    .await
}

/// Run status is read through to the provider; the stored row only
/// caches the last observation for listings.
pub async fn run_status(
    pool: &Pool,
    registry: &ProviderRegistry,
    run_id: Uuid,
) -> Result<RunStatus> {
    let client = pool.get().await?;
    let run = pipelines::get_run(&**client, run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("pipeline run {run_id} not found")))?;
    let pipeline = pipelines::require(&**client, run.pipeline_id).await?;
    let provider = registry
        .get_for_workspace(pool, pipeline.workspace_id)
        .await?;
    let status = provider.get_status(&run.provider_run_id).await?;
    if status.status != run.status {
        pipelines::update_run_status(&**client, run.id, &status.status).await?;
    }
    Ok(status)
}

pub async fn cancel_run(pool: &Pool, registry: &ProviderRegistry, run_id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    let run = pipelines::get_run(&**client, run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("pipeline run {run_id} not found")))?;
    let pipeline = pipelines::require(&**client, run.pipeline_id).await?;
    let provider = registry
        .get_for_workspace(pool, pipeline.workspace_id)
        .await?;
    provider.cancel_pipeline(&run.provider_run_id).await
}

pub async fn run_logs(pool: &Pool, registry: &ProviderRegistry, run_id: Uuid) -> Result<String> {
    let client = pool.get().await?;
    let run = pipelines::get_run(&**client, run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("pipeline run {run_id} not found")))?;
    let pipeline = pipelines::require(&**client, run.pipeline_id).await?;
    let provider = registry
        .get_for_workspace(pool, pipeline.workspace_id)
        .await?;
    provider.get_logs(&run.provider_run_id).await
}

/// Delete the pipeline on the provider side first, then the record.
pub async fn delete(pool: &Pool, registry: &ProviderRegistry, pipeline_id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    let pipeline = pipelines::require(&**client, pipeline_id).await?;
    let provider = registry
        .get_for_workspace(pool, pipeline.workspace_id)
        .await?;
    provider.delete_pipeline(&pipeline).await?;
    pipelines::remove(&**client, pipeline.id).await?;
    Ok(())
}

/// Admin: select a provider for the workspace. The cached instance is
/// dropped so the next call constructs against the new config.
pub async fn set_provider_config(
    pool: &Pool,
    registry: &ProviderRegistry,
    workspace_id: Uuid,
    req: &SetProviderConfigRequest,
) -> Result<()> {
    let provider = registry.create(&req.provider_type, &req.config)?;
    provider.validate_config(&req.config).await?;

    let client = pool.get().await?;
    workspaces::require(&**client, workspace_id).await?;
    pipelines::set_provider_config(&**client, workspace_id, &req.provider_type, &req.config)
        .await?;
    registry.invalidate(workspace_id).await;
    Ok(())
}
