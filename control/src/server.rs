use anyhow::{Context, Result};
use axum::{
    Router,
    http::Method,
    middleware,
    routing::{get, patch, post, put},
};
use deadpool_postgres::Pool;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::{
    args::ServerArgs,
    db,
    gateway::{HostGateway, kube::KubeHostGateway},
    handlers,
    providers::ProviderRegistry,
    tasks::QueueConfig,
    vault::{KubeSecretVault, SecretVault},
};

/// Every verb the router below registers. The CORS layer allows
/// exactly this set, so adding a route with a new method means
/// extending this list alongside it.
const ROUTE_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PATCH,
    Method::PUT,
    Method::DELETE,
];

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub gateway: Arc<dyn HostGateway>,
    pub vault: Arc<dyn SecretVault>,
    pub registry: Arc<ProviderRegistry>,
    pub qcfg: QueueConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/readyz", get(handlers::health))
        .route("/health/components", get(handlers::component_health))
        // organizations
        .route("/orgs", post(handlers::create_org))
        .route(
            "/orgs/{id}",
            get(handlers::get_org).delete(handlers::delete_org),
        )
        // workspaces
        .route(
            "/workspaces",
            get(handlers::list_workspaces).post(handlers::create_workspace),
        )
        .route(
            "/workspaces/{id}",
            get(handlers::get_workspace).delete(handlers::delete_workspace),
        )
        .route("/workspaces/{id}/start", post(handlers::start_workspace))
        .route("/workspaces/{id}/stop", post(handlers::stop_workspace))
        .route("/workspaces/{id}/upgrade", post(handlers::upgrade_workspace))
        .route("/workspaces/{id}/backup", post(handlers::backup_workspace))
        .route("/workspaces/{id}/restore", post(handlers::restore_workspace))
        .route("/workspaces/{id}/plan", patch(handlers::update_workspace_plan))
        .route("/workspaces/{id}/nodes", patch(handlers::update_workspace_nodes))
        .route("/workspaces/{id}/kubeconfig", get(handlers::export_kubeconfig))
        // projects
        .route(
            "/workspaces/{id}/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        .route(
            "/projects/{id}",
            get(handlers::get_project).delete(handlers::delete_project),
        )
        .route("/projects/{id}/quota", get(handlers::project_quota))
        .route("/projects/{id}/metrics", get(handlers::project_metrics))
        // applications
        .route(
            "/workspaces/{id}/applications",
            get(handlers::list_applications).post(handlers::create_application),
        )
        .route(
            "/applications/{id}",
            get(handlers::get_application).delete(handlers::delete_application),
        )
        .route("/applications/{id}/trigger", post(handlers::trigger_cronjob))
        .route("/applications/{id}/executions", get(handlers::list_executions))
        .route(
            "/applications/{id}/schedule",
            patch(handlers::update_schedule),
        )
        .route("/applications/{id}/deploy", post(handlers::deploy_function))
        .route("/applications/{id}/versions", get(handlers::list_versions))
        .route("/applications/{id}/activate", post(handlers::activate_version))
        // pipelines
        .route("/providers", get(handlers::list_providers))
        .route("/workspaces/{id}/provider", put(handlers::set_provider_config))
        .route("/workspaces/{id}/pipelines", get(handlers::list_pipelines).post(handlers::create_pipeline))
        .route(
            "/pipelines/{id}",
            get(handlers::get_pipeline).delete(handlers::delete_pipeline),
        )
        .route(
            "/pipelines/{id}/runs",
            get(handlers::list_pipeline_runs).post(handlers::run_pipeline),
        )
        .route("/pipeline-runs/{id}", get(handlers::pipeline_run_status))
        .route("/pipeline-runs/{id}/cancel", post(handlers::cancel_pipeline_run))
        .route("/pipeline-runs/{id}/logs", get(handlers::pipeline_run_logs))
        // credentials
        .route(
            "/workspaces/{id}/credentials",
            get(handlers::list_credentials).post(handlers::create_credential),
        )
        .route(
            "/workspaces/{id}/credentials/{name}",
            axum::routing::delete(handlers::delete_credential),
        )
        // tasks
        .route("/workspaces/{id}/tasks", get(handlers::list_tasks))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        .layer(middleware::from_fn(
            atoll_common::middleware::extract_context,
        ))
        .layer(middleware::from_fn(atoll_common::access_log::public))
        .layer(atoll_common::cors::dev(&ROUTE_METHODS))
        .with_state(state)
}

/// Run the control plane HTTP server.
pub async fn run_server(args: ServerArgs) -> Result<()> {
    let pool = atoll_common::postgres::create_pool(args.postgres).await;
    db::init_schema(&pool)
        .await
        .context("failed to initialize database schema")?;

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to build kube client")?;
    let gateway: Arc<dyn HostGateway> = Arc::new(KubeHostGateway::new(
        kube_client.clone(),
        args.engine.call_timeout()?,
    ));
    let vault: Arc<dyn SecretVault> = Arc::new(KubeSecretVault::new(
        kube_client.clone(),
        args.vault_namespace.clone(),
    ));
    let registry = Arc::new(ProviderRegistry::with_builtins(kube_client));

    let state = AppState {
        pool,
        gateway,
        vault,
        registry,
        qcfg: args.engine.queue_config()?,
    };

    atoll_common::metrics::maybe_spawn_metrics_server(args.metrics.metric_port);

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    tracing::info!(%addr, "starting control plane HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    atoll_common::signal_ready();
    let shutdown = atoll_common::shutdown::cancel_on_signal();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("server stopped gracefully");
    Ok(())
}
