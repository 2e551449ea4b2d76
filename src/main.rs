use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;

use atelier::config::Config;
use atelier::orchestrator::Orchestrator;
use atelier::store::{Project, SessionStatus, StoreHandle, TaskStore};

#[derive(Parser)]
#[command(name = "atelier")]
#[command(version, about = "Session orchestrator for autonomous coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project from a spec file or directory
    Create {
        name: String,

        /// Spec file or directory; copied/concatenated into the workspace
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Replace an existing project with the same name
        #[arg(long)]
        force: bool,
    },
    /// Run the initializer session (session 0) for a project
    Init { name: String },
    /// Run auto-chained coding sessions until done or stopped
    Run {
        name: String,

        /// Maximum number of sessions this invocation may run
        #[arg(long)]
        max_sessions: Option<u32>,
    },
    /// Show project progress, next task and recent sessions
    Status { name: String },
    /// List all projects
    List,
    /// Show a project's session history
    Sessions { name: String },
    /// Wipe roadmap and session history, keeping the workspace files
    Reset {
        name: String,

        #[arg(long)]
        force: bool,
    },
    /// Delete a project, its workspace and its sandbox
    Delete {
        name: String,

        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);
    let store = StoreHandle::new(
        TaskStore::open(&config.db_path)
            .with_context(|| format!("Failed to open database {}", config.db_path.display()))?,
    );
    let orch = Arc::new(Orchestrator::new(config, store.clone()));
    orch.recover().await?;

    match cli.command {
        Commands::Create { name, spec, force } => {
            let project = orch.create_project(&name, spec.as_deref(), force).await?;
            println!(
                "{} project {} ({})",
                style("Created").green(),
                style(&project.name).bold(),
                project.id
            );
            println!("  workspace: {}", project.workspace);
            println!("  next step: atelier init {}", project.name);
        }
        Commands::Init { name } => {
            let project = resolve_project(&store, &name).await?;
            watch_for_interrupt(&orch, &project.id);
            let outcome = orch.run_initializer(&project.id).await?;
            print_session_line(&outcome.session.status, outcome.session.session_number);
            let (_, progress, _, _) = orch.project_overview(&project.id).await?;
            println!(
                "  roadmap: {} epics, {} tasks, {} tests",
                progress.total_epics, progress.total_tasks, progress.total_tests
            );
            println!(
                "  review the roadmap, then run: atelier run {}",
                project.name
            );
        }
        Commands::Run { name, max_sessions } => {
            let project = resolve_project(&store, &name).await?;
            watch_for_interrupt(&orch, &project.id);
            let outcome = orch.run_coding(&project.id, max_sessions).await?;
            match outcome {
                Some(outcome) => {
                    print_session_line(&outcome.session.status, outcome.session.session_number);
                    println!("  quick rating: {}/10", outcome.quick_rating);
                }
                None => println!("No sessions were run."),
            }
        }
        Commands::Status { name } => {
            let project = resolve_project(&store, &name).await?;
            let (project, progress, next, history) = orch.project_overview(&project.id).await?;
            println!("{}", style(&project.name).bold());
            if project.completed {
                println!("  {}", style("complete").green());
            }
            println!(
                "  epics {}/{}  tasks {}/{}  tests {}/{}",
                progress.completed_epics,
                progress.total_epics,
                progress.completed_tasks,
                progress.total_tasks,
                progress.passed_tests,
                progress.total_tests
            );
            match next {
                Some(task) => println!("  next task: #{} {}", task.id, task.title),
                None => println!("  next task: none"),
            }
            if let Some(last) = history.last() {
                println!(
                    "  last session: {} ({}, {})",
                    last.session_number,
                    last.kind.as_str(),
                    last.status
                );
                if let Some(reason) = &last.error_message {
                    println!("    {}", style(reason).red());
                }
            }
        }
        Commands::List => {
            let projects = store.call(|db| db.list_projects()).await?;
            if projects.is_empty() {
                println!("No projects yet. Start with: atelier create <name> --spec <file>");
            }
            for project in projects {
                let id = project.id.clone();
                let progress = store.call(move |db| db.progress(&id)).await?;
                println!(
                    "{:<24} tasks {}/{}{}",
                    project.name,
                    progress.completed_tasks,
                    progress.total_tasks,
                    if project.completed { "  [complete]" } else { "" }
                );
            }
        }
        Commands::Sessions { name } => {
            let project = resolve_project(&store, &name).await?;
            let id = project.id.clone();
            let history = store.call(move |db| db.session_history(&id)).await?;
            let trend = {
                let id = project.id.clone();
                store.call(move |db| db.quality_trend(&id)).await?
            };
            for session in history {
                let rating = trend
                    .iter()
                    .find(|(n, _)| *n == session.session_number)
                    .map(|(_, r)| format!("  {}/10", r))
                    .unwrap_or_default();
                println!(
                    "{:>3}  {:<12} {:<10} tools {:<5} errors {:<4}{}",
                    session.session_number,
                    session.kind.as_str(),
                    session.status.to_string(),
                    session.counters.tool_uses,
                    session.counters.errors,
                    rating
                );
            }
        }
        Commands::Reset { name, force } => {
            let project = resolve_project(&store, &name).await?;
            if !force {
                bail!(
                    "this wipes the roadmap and session history of '{}'; re-run with --force",
                    project.name
                );
            }
            orch.reset_project(&project.id).await?;
            println!("{} project {}", style("Reset").yellow(), project.name);
        }
        Commands::Delete { name, force } => {
            let project = resolve_project(&store, &name).await?;
            if !force {
                bail!(
                    "this deletes '{}' including its workspace; re-run with --force",
                    project.name
                );
            }
            orch.delete_project(&project.id).await?;
            println!("{} project {}", style("Deleted").red(), project.name);
        }
    }
    Ok(())
}

async fn resolve_project(store: &StoreHandle, name: &str) -> Result<Project> {
    let lookup = name.to_string();
    store
        .call(move |db| db.get_project_by_name(&lookup))
        .await?
        .ok_or_else(|| anyhow::anyhow!("no project named '{}'", name))
}

/// First Ctrl+C cancels the running session cooperatively; a second one
/// exits immediately.
fn watch_for_interrupt(orch: &Arc<Orchestrator>, project_id: &str) {
    let orch = orch.clone();
    let project_id = project_id.to_string();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[atelier] cancelling current session (Ctrl+C again to force quit)");
            orch.stop_after_current(&project_id, true);
            orch.cancel(&project_id);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

fn print_session_line(status: &SessionStatus, number: i64) {
    let styled = match status {
        SessionStatus::Completed => style("completed").green(),
        SessionStatus::Failed => style("failed").red(),
        SessionStatus::Cancelled => style("cancelled").yellow(),
        SessionStatus::Running => style("running").cyan(),
    };
    println!("Session {} {}", number, styled);
}
