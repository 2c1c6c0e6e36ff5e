//! The `taskforge` command line.
//!
//! Unlike `gofer::cli`, a remote HTTP client talking to an already-running service, `taskforge`
//! runs as a single process: `service start` boots the HTTP service, the scheduler, and the task
//! queue directly. `task list`/`task run` talk to the same `Manager`/`Runner` in-process,
//! without an HTTP hop — useful for local debugging when the service isn't up.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Cell, CellAlignment, Color, ContentArrangement};

use crate::api::{self, ApiState};
use crate::conf::service::ServiceConfig;
use crate::conf::Configuration;
use crate::manager::Manager;
use crate::models::Status;
use crate::queue::TaskQueue;
use crate::runner::Runner;
use crate::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(name = "taskforge")]
#[command(bin_name = "taskforge")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage the taskforge service.
    Service(ServiceSubcommands),

    /// Inspect and drive tasks directly, without going through the HTTP API.
    Task(TaskSubcommands),
}

#[derive(Debug, clap::Args)]
struct ServiceSubcommands {
    #[command(subcommand)]
    command: ServiceCommands,
}

#[derive(Debug, Subcommand)]
enum ServiceCommands {
    /// Boots the HTTP service, the scheduler, and the task queue. Blocks until shutdown.
    Start,
}

#[derive(Debug, clap::Args)]
struct TaskSubcommands {
    #[command(subcommand)]
    command: TaskCommands,
}

#[derive(Debug, Subcommand)]
enum TaskCommands {
    /// List every task the configured `tasks_dir` resolves.
    List,

    /// Start a task, wait for it to finish, and print its outcome.
    Run {
        /// The task id to run, e.g. the `<id>` in `<tasksDir>/<id>.yaml`.
        task_id: String,
    },
}

/// The collaborators every subcommand needs, built once from the loaded configuration.
struct App {
    config: ServiceConfig,
    manager: Arc<Manager>,
    runner: Arc<Runner>,
    scheduler: Arc<Scheduler>,
}

impl App {
    async fn bootstrap() -> Result<Self> {
        let mut config = Configuration::<ServiceConfig>::load(None)
            .context("could not load configuration")?;
        config
            .apply_legacy_env_overrides()
            .context("could not apply legacy environment overrides")?;

        if !config.fixed_tz.is_empty() {
            std::env::set_var("TZ", &config.fixed_tz);
        }

        let manager = Arc::new(Manager::new(config.tasks_dir.clone()));
        let queue = TaskQueue::new(config.parallel, config.queue_size);
        let runner = Arc::new(Runner::new(queue, config.log_dir.clone()));
        let scheduler = Arc::new(Scheduler::new(
            manager.clone(),
            runner.clone(),
            config.schedules_path.clone(),
        ));

        Ok(Self {
            config,
            manager,
            runner,
            scheduler,
        })
    }
}

/// Parses CLI args and dispatches. This is `main`'s sole entry point.
pub async fn init() {
    if let Err(err) = run().await {
        eprintln!("{} {err:#}", "error:".red().bold());
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Service(service) => match service.command {
            ServiceCommands::Start => start_service().await,
        },
        Commands::Task(task) => match task.command {
            TaskCommands::List => task_list().await,
            TaskCommands::Run { task_id } => task_run(&task_id).await,
        },
    }
}

async fn start_service() -> Result<()> {
    let app = App::bootstrap().await?;

    api::init_logger(&app.config.log_level, app.config.development.pretty_logging)?;

    app.scheduler
        .start()
        .await
        .context("could not start scheduler")?;

    let config = app.config.clone();
    let api_state = Arc::new(ApiState::new(
        config.clone(),
        app.manager.clone(),
        app.runner.clone(),
        app.scheduler.clone(),
    ));

    api::start_web_service(config, api_state).await
}

async fn task_list() -> Result<()> {
    let app = App::bootstrap().await?;
    let tasks = app
        .manager
        .tasks()
        .await
        .context("could not list tasks")?;

    let mut table = comfy_table::Table::new();
    table
        .load_preset(comfy_table::presets::ASCII_MARKDOWN)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("task id")
            .set_alignment(CellAlignment::Center)
            .fg(Color::Blue)]);

    for task in tasks {
        table.add_row(vec![Cell::new(task.task_id)]);
    }

    println!("{}", &table.to_string());
    Ok(())
}

async fn task_run(task_id: &str) -> Result<()> {
    let app = App::bootstrap().await?;
    let task = app
        .manager
        .load(task_id)
        .await
        .with_context(|| format!("could not load task {task_id:?}"))?;

    let entry = app.runner.start(task, Default::default()).await;
    app.runner.wait(task_id, entry.run_id).await;

    let history = app.runner.get_history(task_id, 5).await;
    let Some(latest) = history.into_iter().find(|e| e.run_id == entry.run_id) else {
        println!("{task_id} run {} finished with unknown status", entry.run_id);
        return Ok(());
    };

    let status_text = colorize_status(latest.task.status);
    println!("{task_id} run {} finished: {status_text}", entry.run_id);
    if !latest.task.message.is_empty() {
        println!("  {}", latest.task.message);
    }

    Ok(())
}

fn colorize_status(status: Status) -> String {
    let text = status.to_string();
    match status {
        Status::Success => text.green().to_string(),
        Status::Failed | Status::Canceled => text.red().to_string(),
        Status::Running => text.yellow().to_string(),
        Status::Queued => text,
    }
}
