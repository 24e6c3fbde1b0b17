//! Stateless application handlers: a Deployment + Service pair under
//! deterministic names, status derived from observed ready replicas.

use std::collections::BTreeMap;

use super::TaskCtx;
use crate::{
    db::{applications, functions, projects},
    error::{Error, Result},
    models::{AppStatus, AppType, Application, Task},
    names,
    tasks::AppPayload,
};
use atoll_common::labels;

/// Pull the workload shape out of the opaque application config.
/// `image` is resolved by the caller: config for stateless apps, the
/// active version's artefact for functions.
fn workload_spec(
    app: &Application,
    namespace: &str,
    image: &str,
) -> Result<crate::gateway::WorkloadSpecReq> {
    let replicas = app
        .config
        .get("replicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(1) as i32;
    let container_port = app
        .config
        .get("port")
        .and_then(|v| v.as_i64())
        .unwrap_or(8080) as i32;
    let env: BTreeMap<String, String> = app
        .config
        .get("env")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(crate::gateway::WorkloadSpecReq {
        name: names::deployment_name(app.id, &app.name),
        namespace: namespace.to_string(),
        image: image.to_string(),
        replicas,
        container_port,
        env,
        labels: BTreeMap::from([
            (labels::WORKSPACE_ID.into(), app.workspace_id.to_string()),
            (labels::APPLICATION_ID.into(), app.id.to_string()),
        ]),
    })
}

async fn project_namespace(ctx: &TaskCtx, app: &Application) -> Result<String> {
    let client = ctx.pool.get().await?;
    let project = projects::require(&**client, app.project_id).await?;
    project
        .k8s_namespace
        .ok_or_else(|| Error::Internal(format!("project {} has no namespace", project.id)))
}

pub async fn deploy(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: AppPayload = serde_json::from_value(task.payload.clone())?;

    let app = {
        let client = ctx.pool.get().await?;
        let Some(app) = applications::get(&**client, payload.application_id).await? else {
            return Ok(());
        };
        applications::set_status(&**client, app.id, AppStatus::Deploying).await?;
        app
    };

    ctx.checkpoint(task.id).await?;

    let image = match app.app_type {
        AppType::Function => {
            let client = ctx.pool.get().await?;
            let active = functions::get_active(&**client, app.id)
                .await?
                .ok_or_else(|| {
                    Error::PreconditionFailed(format!(
                        "function {} has no active version",
                        app.id
                    ))
                })?;
            active.image_uri.ok_or_else(|| {
                Error::Internal(format!("active version of {} has no image", app.id))
            })?
        }
        _ => app
            .config
            .get("image")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("application config is missing 'image'".into()))?
            .to_string(),
    };

    let namespace = project_namespace(ctx, &app).await?;
    let spec = workload_spec(&app, &namespace, &image)?;
    ctx.gateway.apply_workload(&spec).await?;
    ctx.progress(
        task.id,
        "workload applied",
        serde_json::json!({"deployment": spec.name, "namespace": namespace}),
    )
    .await;

    let desired = spec.replicas;
    ctx.poll_until(task.id, "workload rollout", || {
        let namespace = namespace.clone();
        let name = spec.name.clone();
        async move {
            let observed = ctx.gateway.observe_workload(&namespace, &name).await?;
            Ok(observed.ready_replicas >= desired)
        }
    })
    .await?;

    let client = ctx.pool.get().await?;
    applications::set_status(&**client, app.id, AppStatus::Running).await?;
    Ok(())
}

pub async fn delete(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let payload: AppPayload = serde_json::from_value(task.payload.clone())?;

    let app = {
        let client = ctx.pool.get().await?;
        let Some(app) = applications::get(&**client, payload.application_id).await? else {
            return Ok(());
        };
        applications::set_status(&**client, app.id, AppStatus::Deleting).await?;
        app
    };

    ctx.checkpoint(task.id).await?;

    let namespace = project_namespace(ctx, &app).await?;
    let name = names::deployment_name(app.id, &app.name);
    ctx.gateway.delete_workload(&namespace, &name).await?;

    let client = ctx.pool.get().await?;
    applications::remove(&**client, app.id).await?;
    Ok(())
}

pub async fn apply_failure_state(ctx: &TaskCtx, task: &Task) -> Result<()> {
    let Ok(payload) = serde_json::from_value::<AppPayload>(task.payload.clone()) else {
        return Ok(());
    };
    let client = ctx.pool.get().await?;
    if applications::get(&**client, payload.application_id)
        .await?
        .is_some()
    {
        applications::set_status(&**client, payload.application_id, AppStatus::Error).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_ms;
    use crate::models::{AppStatus, SourceType};
    use uuid::Uuid;

    fn app(config: serde_json::Value) -> Application {
        Application {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "web frontend".into(),
            app_type: AppType::Stateless,
            source_type: SourceType::Image,
            status: AppStatus::Pending,
            config,
            cron_schedule: None,
            concurrency_policy: None,
            next_execution_at: None,
            created_at: now_ms(),
            updated_at: now_ms(),
        }
    }

    #[test]
    fn workload_spec_defaults_and_overrides() {
        let spec = workload_spec(&app(serde_json::json!({})), "ns", "img:1").unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.container_port, 8080);
        assert!(spec.env.is_empty());

        let spec = workload_spec(
            &app(serde_json::json!({
                "replicas": 3,
                "port": 9000,
                "env": {"MODE": "prod"},
            })),
            "ns",
            "img:2",
        )
        .unwrap();
        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.container_port, 9000);
        assert_eq!(spec.env.get("MODE").map(|s| s.as_str()), Some("prod"));
    }

    #[test]
    fn workload_name_is_deterministic_and_dns_safe() {
        let a = app(serde_json::json!({}));
        let spec1 = workload_spec(&a, "ns", "img").unwrap();
        let spec2 = workload_spec(&a, "ns", "img").unwrap();
        assert_eq!(spec1.name, spec2.name);
        assert!(spec1.name.len() <= 63);
        assert!(!spec1.name.contains(' '));
    }
}
