use anyhow::Result;
use clap::Parser;

mod args;
mod cli;
mod client;
mod db;
mod error;
mod fsm;
mod gateway;
mod handlers;
mod models;
mod names;
mod providers;
mod reconciler;
mod scheduler;
mod server;
mod services;
mod tasks;
mod vault;

use args::{Cli, Commands, ProjectCommands, TaskCommands, WorkspaceCommands};
use server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    atoll_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Worker(args) => reconciler::run_worker(args).await,
        Commands::Workspace(args) => match args.command {
            WorkspaceCommands::Create(args) => cli::run_create_workspace(args).await,
            WorkspaceCommands::Get(args) => cli::run_get_workspace(args).await,
            WorkspaceCommands::List(args) => cli::run_list_workspaces(args).await,
            WorkspaceCommands::Start(args) => cli::run_start_workspace(args).await,
            WorkspaceCommands::Stop(args) => cli::run_stop_workspace(args).await,
            WorkspaceCommands::Delete(args) => cli::run_delete_workspace(args).await,
        },
        Commands::Project(args) => match args.command {
            ProjectCommands::Create(args) => cli::run_create_project(args).await,
            ProjectCommands::List(args) => cli::run_list_projects(args).await,
            ProjectCommands::Delete(args) => cli::run_delete_project(args).await,
        },
        Commands::Task(args) => match args.command {
            TaskCommands::Get(args) => cli::run_get_task(args).await,
            TaskCommands::Cancel(args) => cli::run_cancel_task(args).await,
        },
        Commands::Health(args) => cli::run_health(args.endpoint).await,
    }
}
