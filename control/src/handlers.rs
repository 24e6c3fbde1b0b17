use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use atoll_common::{Pagination, RequestContextExtractor};

use crate::{
    db::{applications, cron, functions, orgs, pipelines, projects, workspaces},
    error::{Error, Result},
    models::*,
    server::AppState,
    services,
    tasks::queue,
};

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

pub async fn component_health(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let health = state.gateway.check_component_health().await?;
    let body: serde_json::Map<String, serde_json::Value> = health
        .into_iter()
        .map(|(name, h)| {
            (
                name,
                serde_json::json!({"healthy": h.healthy, "message": h.message}),
            )
        })
        .collect();
    Ok(Json(serde_json::Value::Object(body)))
}

// ---- organizations ----

pub async fn create_org(
    State(state): State<AppState>,
    Json(req): Json<CreateOrganizationRequest>,
) -> Result<impl IntoResponse> {
    if req.name.trim().is_empty() {
        return Err(Error::Validation("organization name must not be empty".into()));
    }
    let client = state.pool.get().await?;
    let org = orgs::create(
        &**client,
        Uuid::new_v4(),
        &req.name,
        &req.owner_id,
        req.billing_ref.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(org)))
}

pub async fn get_org(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(orgs::require(&**client, id).await?))
}

pub async fn delete_org(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    if orgs::soft_delete(&**client, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("organization {id} not found")))
    }
}

// ---- workspaces ----

pub async fn create_workspace(
    State(state): State<AppState>,
    RequestContextExtractor(rctx): RequestContextExtractor,
    Json(req): Json<CreateWorkspaceRequest>,
) -> Result<impl IntoResponse> {
    let (ws, task_id) =
        services::workspace::create(&state.pool, &state.qcfg, &req, rctx.requested_by()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"workspace": ws, "task_id": task_id})),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListWorkspacesQuery {
    pub org_id: Option<Uuid>,
    #[serde(flatten)]
    pub page: Pagination,
}

pub async fn list_workspaces(
    State(state): State<AppState>,
    Query(q): Query<ListWorkspacesQuery>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    let page = workspaces::list(&**client, q.org_id, q.page.offset, q.page.limit()).await?;
    Ok(Json(page))
}

pub async fn get_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(workspaces::require(&**client, id).await?))
}

pub async fn delete_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
) -> Result<impl IntoResponse> {
    let accepted =
        services::workspace::delete(&state.pool, &state.qcfg, id, rctx.requested_by()).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn start_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
) -> Result<impl IntoResponse> {
    let accepted =
        services::workspace::start(&state.pool, &state.qcfg, id, rctx.requested_by()).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn stop_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
) -> Result<impl IntoResponse> {
    let accepted =
        services::workspace::stop(&state.pool, &state.qcfg, id, rctx.requested_by()).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn upgrade_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
    Json(req): Json<UpgradeRequest>,
) -> Result<impl IntoResponse> {
    let accepted = services::workspace::upgrade(
        &state.pool,
        &state.qcfg,
        id,
        &req.kubernetes_version,
        rctx.requested_by(),
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn backup_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
) -> Result<impl IntoResponse> {
    let accepted =
        services::workspace::backup(&state.pool, &state.qcfg, id, rctx.requested_by()).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn restore_workspace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
    Json(req): Json<RestoreRequest>,
) -> Result<impl IntoResponse> {
    let accepted =
        services::workspace::restore(&state.pool, &state.qcfg, id, &req, rctx.requested_by())
            .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn update_workspace_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
    Json(req): Json<UpdatePlanRequest>,
) -> Result<impl IntoResponse> {
    let accepted =
        services::workspace::update_plan(&state.pool, &state.qcfg, id, &req, rctx.requested_by())
            .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn update_workspace_nodes(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
    Json(req): Json<UpdateNodesRequest>,
) -> Result<impl IntoResponse> {
    let accepted =
        services::workspace::update_nodes(&state.pool, &state.qcfg, id, &req, rctx.requested_by())
            .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn export_kubeconfig(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    let ws = workspaces::require(&**client, id).await?;
    let instance = ws
        .instance_name
        .ok_or_else(|| Error::PreconditionFailed("workspace has no instance yet".into()))?;
    let namespace = crate::names::workspace_namespace(ws.id);
    let bytes = state.gateway.export_kubeconfig(&namespace, &instance).await?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/yaml")],
        bytes,
    ))
}

// ---- projects ----

pub async fn create_project(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse> {
    let (project, task_id) = services::project::create(
        &state.pool,
        &state.qcfg,
        workspace_id,
        &req,
        rctx.requested_by(),
    )
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"project": project, "task_id": task_id})),
    ))
}

pub async fn list_projects(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(
        projects::list(&**client, workspace_id, page.offset, page.limit()).await?,
    ))
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(projects::require(&**client, id).await?))
}

pub async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
) -> Result<impl IntoResponse> {
    let task_id =
        services::project::delete(&state.pool, &state.qcfg, id, rctx.requested_by()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"task_id": task_id})),
    ))
}

pub async fn project_quota(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    let project = projects::require(&**client, id).await?;
    let namespace = project
        .k8s_namespace
        .ok_or_else(|| Error::PreconditionFailed("project has no namespace yet".into()))?;
    let quota = state.gateway.get_namespace_resource_quota(&namespace).await?;
    Ok(Json(
        serde_json::json!({"hard": quota.hard, "used": quota.used}),
    ))
}

pub async fn project_metrics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    let project = projects::require(&**client, id).await?;
    let namespace = project
        .k8s_namespace
        .ok_or_else(|| Error::PreconditionFailed("project has no namespace yet".into()))?;
    let metrics = state.gateway.get_pod_metrics(&namespace).await?;
    let body: Vec<serde_json::Value> = metrics
        .into_iter()
        .map(|m| {
            serde_json::json!({
                "pod": m.pod,
                "containers": m.containers.iter().map(|c| serde_json::json!({
                    "name": c.name, "cpu": c.cpu, "memory": c.memory,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    Ok(Json(body))
}

// ---- applications ----

pub async fn create_application(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
    Json(req): Json<CreateApplicationRequest>,
) -> Result<impl IntoResponse> {
    let (app, task_id) = services::application::create(
        &state.pool,
        &state.qcfg,
        workspace_id,
        &req,
        rctx.requested_by(),
    )
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"application": app, "task_id": task_id})),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListApplicationsQuery {
    pub project_id: Option<Uuid>,
    #[serde(flatten)]
    pub page: Pagination,
}

pub async fn list_applications(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Query(q): Query<ListApplicationsQuery>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(
        applications::list(
            &**client,
            workspace_id,
            q.project_id,
            q.page.offset,
            q.page.limit(),
        )
        .await?,
    ))
}

pub async fn get_application(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(applications::require(&**client, id).await?))
}

pub async fn delete_application(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
) -> Result<impl IntoResponse> {
    let task_id =
        services::application::delete(&state.pool, &state.qcfg, id, rctx.requested_by()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"task_id": task_id})),
    ))
}

pub async fn trigger_cronjob(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
) -> Result<impl IntoResponse> {
    let (execution, task_id) =
        services::application::trigger_cronjob(&state.pool, &state.qcfg, id, rctx.requested_by())
            .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"execution": execution, "task_id": task_id})),
    ))
}

pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(
        cron::list(&**client, id, page.offset, page.limit()).await?,
    ))
}

pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateScheduleRequest>,
) -> Result<impl IntoResponse> {
    let app =
        services::application::update_schedule(&state.pool, id, &req.cron_schedule).await?;
    Ok(Json(app))
}

pub async fn deploy_function(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
) -> Result<impl IntoResponse> {
    let (version, task_id) =
        services::application::deploy_function(&state.pool, &state.qcfg, id, rctx.requested_by())
            .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"version": version, "task_id": task_id})),
    ))
}

pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(functions::list(&**client, id).await?))
}

pub async fn activate_version(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RequestContextExtractor(rctx): RequestContextExtractor,
    Json(req): Json<ActivateVersionRequest>,
) -> Result<impl IntoResponse> {
    let (version, task_id) = services::application::activate_version(
        &state.pool,
        &state.qcfg,
        id,
        req.version,
        rctx.requested_by(),
    )
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"version": version, "task_id": task_id})),
    ))
}

// ---- pipelines & providers ----

pub async fn list_providers(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.registry.list_provider_info()))
}

pub async fn set_provider_config(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Json(req): Json<SetProviderConfigRequest>,
) -> Result<impl IntoResponse> {
    services::pipeline::set_provider_config(&state.pool, &state.registry, workspace_id, &req)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_pipeline(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<impl IntoResponse> {
    let pipeline =
        services::pipeline::create(&state.pool, &state.registry, workspace_id, &req).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

pub async fn list_pipelines(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(
        pipelines::list(&**client, workspace_id, page.offset, page.limit()).await?,
    ))
}

pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(pipelines::require(&**client, id).await?))
}

pub async fn delete_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    services::pipeline::delete(&state.pool, &state.registry, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn run_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RunPipelineRequest>,
) -> Result<impl IntoResponse> {
    let run = services::pipeline::run(&state.pool, &state.registry, id, &req.params).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

pub async fn list_pipeline_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(pipelines::list_runs(&**client, id).await?))
}

pub async fn pipeline_run_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let status = services::pipeline::run_status(&state.pool, &state.registry, id).await?;
    Ok(Json(serde_json::json!({
        "provider_run_id": status.provider_run_id,
        "status": status.status,
        "finished": status.finished,
        "success": status.success,
    })))
}

pub async fn cancel_pipeline_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    services::pipeline::cancel_run(&state.pool, &state.registry, id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn pipeline_run_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let logs = services::pipeline::run_logs(&state.pool, &state.registry, id).await?;
    Ok(logs)
}

// ---- credentials ----

pub async fn create_credential(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Json(req): Json<CreateCredentialRequest>,
) -> Result<impl IntoResponse> {
    let credential =
        services::credential::create(&state.pool, &state.vault, workspace_id, &req).await?;
    Ok((StatusCode::CREATED, Json(credential)))
}

pub async fn list_credentials(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        services::credential::list(&state.pool, workspace_id).await?,
    ))
}

pub async fn delete_credential(
    State(state): State<AppState>,
    Path((workspace_id, name)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse> {
    if services::credential::delete(&state.pool, &state.vault, workspace_id, &name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("credential {name:?} not found")))
    }
}

// ---- tasks ----

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    Ok(Json(
        queue::list(&**client, workspace_id, page.offset, page.limit()).await?,
    ))
}

/// Poll one task: status, attempt, error, progress.
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let client = state.pool.get().await?;
    let task = queue::require(&**client, id).await?;
    Ok(Json(task))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let status = queue::request_cancel(&state.pool, id).await?;
    Ok(Json(serde_json::json!({"status": status})))
}
