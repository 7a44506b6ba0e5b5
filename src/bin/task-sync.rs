//! task-sync command-line front-end.
//!
//! A thin shell over the engine: task/step CRUD, dependency tree rendering,
//! schema migrations and the run entry points. Exit code 0 on success, 1 on
//! any engine or argument error.

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use task_sync::generator;
use task_sync::{DockerCli, Engine, PgStore, RunMode, Store};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "task-sync", version, about = "Dependency-driven step runner for Docker-based grading workflows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Manage steps
    Step {
        #[command(subcommand)]
        command: StepCommand,
    },
    /// Manage the database schema
    Migrate {
        #[command(subcommand)]
        command: MigrateCommand,
    },
    /// Run the global sweep on an interval
    Serve {
        /// Tag log output as a remote deployment
        #[arg(long)]
        remote: bool,
        /// Seconds between sweeps
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a task
    Create(TaskCreateArgs),
    /// Edit a task's fields
    Edit {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        local_path: Option<String>,
    },
    /// Delete a task and its steps
    Delete { id: i64 },
    /// Show one task
    Info { id: i64 },
    /// List all tasks
    List,
    /// Run every step of a task in dependency order
    Run {
        id: i64,
        /// Restrict scored commands to the Golden assignment
        #[arg(long)]
        golden: bool,
    },
}

#[derive(Args)]
struct TaskCreateArgs {
    /// Human name
    #[arg(long)]
    name: String,
    /// Initial status
    #[arg(long, default_value = "active")]
    status: String,
    /// Filesystem base path
    #[arg(long)]
    local_path: Option<String>,
    /// Settings document as JSON
    #[arg(long, default_value = "{}")]
    settings: String,
}

#[derive(Subcommand)]
enum StepCommand {
    /// Create a step
    Create {
        #[arg(long)]
        task_id: i64,
        #[arg(long)]
        title: String,
        /// Settings document as JSON (exactly one type key)
        #[arg(long)]
        settings: String,
    },
    /// Edit a step's title or settings
    Edit {
        id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        settings: Option<String>,
    },
    /// Delete a step
    Delete { id: i64 },
    /// Show one step
    Info { id: i64 },
    /// List steps, optionally restricted to a task
    List {
        #[arg(long)]
        task_id: Option<i64>,
    },
    /// Clone a step's title and settings into a new row
    Copy { id: i64 },
    /// Render the dependency tree
    Tree {
        #[arg(long)]
        task_id: Option<i64>,
    },
    /// Run a single step
    Run {
        id: i64,
        /// Bypass change detection for this invocation
        #[arg(long)]
        force: bool,
        /// Restrict scored commands to the Golden assignment
        #[arg(long, conflicts_with = "original")]
        golden: bool,
        /// Restrict scored commands to the Original assignment
        #[arg(long, conflicts_with = "golden")]
        original: bool,
    },
    /// Run a single step against the Golden assignment
    Golden { id: i64 },
    /// Run a single step against the Original assignment
    Original { id: i64 },
    /// Delete the rubric-shell steps a parent generated
    CleanupRubricShells { parent_id: i64 },
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply pending migrations
    Up,
    /// Roll back the most recent migration
    Down,
    /// Show each migration's applied state
    Status,
    /// Roll back everything, then re-apply
    Reset,
}

fn parse_json(input: &str) -> Result<Value, task_sync::Error> {
    serde_json::from_str(input)
        .map_err(|e| task_sync::Error::invalid_config(format!("invalid JSON: {e}")))
}

fn print_reports(reports: &[task_sync::StepReport]) {
    for report in reports {
        println!("{}", report.summary());
    }
}

fn engine(store: Arc<PgStore>, mode: RunMode) -> Result<Engine, task_sync::Error> {
    let docker = Arc::new(DockerCli::new()?);
    Ok(Engine::new(store, docker).with_mode(mode))
}

async fn run(cli: Cli) -> Result<(), task_sync::Error> {
    let store = Arc::new(PgStore::connect_from_env().await?);

    match cli.command {
        Command::Task { command } => match command {
            TaskCommand::Create(args) => {
                let settings = parse_json(&args.settings)?;
                let task = store
                    .create_task(&args.name, &args.status, args.local_path.as_deref(), settings)
                    .await?;
                println!("created task {}", task.id);
            }
            TaskCommand::Edit {
                id,
                name,
                status,
                local_path,
            } => {
                store
                    .update_task(id, name.as_deref(), status.as_deref(), local_path.as_deref())
                    .await?;
                println!("updated task {id}");
            }
            TaskCommand::Delete { id } => {
                store.delete_task(id).await?;
                println!("deleted task {id}");
            }
            TaskCommand::Info { id } => {
                let task = store.task(id).await?;
                println!("task {}: {} [{}]", task.id, task.name, task.status);
                if let Some(path) = &task.local_path {
                    println!("local_path: {path}");
                }
                println!("{}", serde_json::to_string_pretty(&task.settings)?);
            }
            TaskCommand::List => {
                for task in store.tasks().await? {
                    println!("{}\t{}\t{}", task.id, task.status, task.name);
                }
            }
            TaskCommand::Run { id, golden } => {
                let mode = if golden {
                    RunMode::GoldenOnly
                } else {
                    RunMode::Default
                };
                let engine = engine(store.clone(), mode)?;
                print_reports(&engine.run_task(id).await?);
            }
        },
        Command::Step { command } => match command {
            StepCommand::Create {
                task_id,
                title,
                settings,
            } => {
                let settings = parse_json(&settings)?;
                // Reject malformed settings before they reach the store
                task_sync::StepSettings::decode(&settings)?;
                let step = store.create_step(task_id, &title, settings).await?;
                println!("created step {}", step.id);
            }
            StepCommand::Edit {
                id,
                title,
                settings,
            } => {
                if let Some(title) = title {
                    store.update_step_title(id, &title).await?;
                }
                if let Some(settings) = settings {
                    let settings = parse_json(&settings)?;
                    task_sync::StepSettings::decode(&settings)?;
                    store.update_step_settings(id, settings).await?;
                }
                println!("updated step {id}");
            }
            StepCommand::Delete { id } => {
                store.delete_step(id).await?;
                println!("deleted step {id}");
            }
            StepCommand::Info { id } => {
                let step = store.step(id).await?;
                println!("step {}: {} (task {})", step.id, step.title, step.task_id);
                println!("settings: {}", serde_json::to_string_pretty(&step.settings)?);
                println!("results: {}", serde_json::to_string_pretty(&step.results)?);
            }
            StepCommand::List { task_id } => {
                let steps = match task_id {
                    Some(task_id) => store.steps_for_task(task_id).await?,
                    None => {
                        let mut all = Vec::new();
                        for task in store.tasks().await? {
                            all.extend(store.steps_for_task(task.id).await?);
                        }
                        all
                    }
                };
                for step in steps {
                    println!(
                        "{}\t{}\t{}\t{}",
                        step.id,
                        step.task_id,
                        step.result_kind(),
                        step.title
                    );
                }
            }
            StepCommand::Copy { id } => {
                let step = store.step(id).await?;
                let copy = store
                    .create_step(step.task_id, &step.title, step.settings.clone())
                    .await?;
                println!("copied step {id} to {}", copy.id);
            }
            StepCommand::Tree { task_id } => {
                let tasks = match task_id {
                    Some(id) => vec![store.task(id).await?],
                    None => store.tasks().await?,
                };
                for task in tasks {
                    let steps = store.steps_for_task(task.id).await?;
                    print!("{}", task_sync::render_tree(task.id, &task.name, &steps));
                }
            }
            StepCommand::Run {
                id,
                force,
                golden,
                original,
            } => {
                let mode = if golden {
                    RunMode::GoldenOnly
                } else if original {
                    RunMode::OriginalOnly
                } else {
                    RunMode::Default
                };
                let engine = engine(store.clone(), mode)?;
                println!("{}", engine.run_step(id, force).await?.summary());
            }
            StepCommand::Golden { id } => {
                let engine = engine(store.clone(), RunMode::GoldenOnly)?;
                println!("{}", engine.run_step(id, false).await?.summary());
            }
            StepCommand::Original { id } => {
                let engine = engine(store.clone(), RunMode::OriginalOnly)?;
                println!("{}", engine.run_step(id, false).await?.summary());
            }
            StepCommand::CleanupRubricShells { parent_id } => {
                let parent = store.step(parent_id).await?;
                let parent_settings = task_sync::StepSettings::decode(&parent.settings)?;
                if !parent_settings.config.hosts_rubric() {
                    return Err(task_sync::Error::invalid_config(format!(
                        "step {parent_id} is {}, not a rubric-hosting step",
                        parent_settings.config.type_key()
                    )));
                }
                let children =
                    generator::generated_children(store.as_ref(), parent.task_id, parent_id)
                        .await?;
                let ids: Vec<i64> = children.iter().map(|s| s.id).collect();
                let removed = store.delete_steps(&ids).await?;
                println!("deleted {removed} generated step(s)");
            }
        },
        Command::Migrate { command } => match command {
            MigrateCommand::Up => store.migrate_up().await?,
            MigrateCommand::Down => store.migrate_down().await?,
            MigrateCommand::Status => {
                for (version, name, applied) in store.migrate_status().await? {
                    let mark = if applied { "applied" } else { "pending" };
                    println!("{version}\t{name}\t{mark}");
                }
            }
            MigrateCommand::Reset => store.migrate_reset().await?,
        },
        Command::Serve { remote, interval } => {
            let target = if remote { "remote" } else { "local" };
            tracing::info!(target_mode = target, interval, "starting sweep loop");
            let engine = engine(store.clone(), RunMode::Default)?;
            loop {
                match engine.run_all().await {
                    Ok(reports) => {
                        tracing::info!(steps = reports.len(), "sweep complete");
                    }
                    Err(e) => tracing::error!(error = %e, "sweep failed"),
                }
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
