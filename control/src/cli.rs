use anyhow::Result;
use uuid::Uuid;

use crate::args::{
    CreateProjectArgs, CreateWorkspaceArgs, EndpointArgs, IdArgs, ListArgs, ListProjectsArgs,
};
use crate::client::ControlClient;
use crate::models::{CreateProjectRequest, CreateWorkspaceRequest};

fn default_endpoint() -> String {
    "http://localhost:8080".to_string()
}

fn client(args: &EndpointArgs) -> ControlClient {
    let endpoint = args.endpoint.clone().unwrap_or_else(default_endpoint);
    ControlClient::new(&endpoint, args.user.clone())
}

pub async fn run_create_workspace(args: CreateWorkspaceArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let org_id: Uuid = args.org_id.parse()?;
    let accepted = client
        .create_workspace(&CreateWorkspaceRequest {
            org_id,
            name: args.name,
            plan_id: args.plan,
            config: None,
            dedicated_node_config: None,
        })
        .await?;

    println!("Workspace accepted:");
    println!("  ID:      {}", accepted.workspace.id);
    println!("  Name:    {}", accepted.workspace.name);
    println!("  Status:  {}", accepted.workspace.status);
    println!("  Task:    {}", accepted.task_id);
    Ok(())
}

pub async fn run_get_workspace(args: IdArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let ws = client.get_workspace(args.id.parse()?).await?;
    println!("{}", serde_json::to_string_pretty(&ws)?);
    Ok(())
}

pub async fn run_list_workspaces(args: ListArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let page = client.list_workspaces(args.offset, args.limit).await?;
    println!(
        "Workspaces ({} of {}):",
        page.items.len(),
        page.full_count
    );
    for ws in &page.items {
        println!(
            "  {}  {:<20} {:<18} instance={}",
            ws.id,
            ws.name,
            ws.status,
            ws.instance_name.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn run_start_workspace(args: IdArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let accepted = client.lifecycle(args.id.parse()?, "start").await?;
    println!("Start accepted; task {}", accepted.task_id);
    Ok(())
}

pub async fn run_stop_workspace(args: IdArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let accepted = client.lifecycle(args.id.parse()?, "stop").await?;
    println!("Stop accepted; task {}", accepted.task_id);
    Ok(())
}

pub async fn run_delete_workspace(args: IdArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let accepted = client.delete_workspace(args.id.parse()?).await?;
    println!("Delete accepted; task {}", accepted.task_id);
    Ok(())
}

pub async fn run_create_project(args: CreateProjectArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let workspace_id: Uuid = args.workspace_id.parse()?;
    let parent = args.parent.map(|p| p.parse()).transpose()?;
    let accepted = client
        .create_project(
            workspace_id,
            &CreateProjectRequest {
                name: args.name,
                parent_project_id: parent,
            },
        )
        .await?;

    println!("Project accepted:");
    println!("  ID:         {}", accepted.project.id);
    println!(
        "  Namespace:  {}",
        accepted.project.k8s_namespace.as_deref().unwrap_or("-")
    );
    println!("  Task:       {}", accepted.task_id);
    Ok(())
}

pub async fn run_list_projects(args: ListProjectsArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let page = client
        .list_projects(args.workspace_id.parse()?, args.offset, args.limit)
        .await?;
    println!("Projects ({} of {}):", page.items.len(), page.full_count);
    for project in &page.items {
        println!(
            "  {}  {:<20} {:<18} ns={}",
            project.id,
            project.name,
            project.ns_status,
            project.k8s_namespace.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn run_delete_project(args: IdArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let task_id = client.delete_project(args.id.parse()?).await?;
    println!("Delete accepted; task {task_id}");
    Ok(())
}

pub async fn run_get_task(args: IdArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let task = client.get_task(args.id.parse()?).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

pub async fn run_cancel_task(args: IdArgs) -> Result<()> {
    let client = client(&args.endpoint);
    let status = client.cancel_task(args.id.parse()?).await?;
    println!("Cancellation requested; task is now {status}");
    Ok(())
}

pub async fn run_health(args: EndpointArgs) -> Result<()> {
    let client = client(&args);
    client.health().await?;
    println!("OK");
    Ok(())
}
