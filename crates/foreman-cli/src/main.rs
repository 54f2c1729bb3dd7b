mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use foreman_core::client;
use foreman_core::coordinator::{Coordinator, CoordinatorConfig};
use foreman_core::worker::{WorkerConfig, WorkerNode};
use foreman_db::pool;
use foreman_db::queries::tasks as task_db;

use config::ForemanConfig;

#[derive(Parser)]
#[command(name = "foreman", about = "Distributed task-dispatch coordinator")]
struct Cli {
    /// Database URL (overrides FOREMAN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Coordinator address (overrides FOREMAN_COORDINATOR_ADDR env var)
    #[arg(long, global = true)]
    coordinator: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a foreman config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/foreman")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create and migrate the foreman database
    DbInit,
    /// Run the coordinator
    Serve {
        /// Port for the message endpoint
        #[arg(long, default_value_t = CoordinatorConfig::DEFAULT_PORT)]
        port: u16,
        /// Drop and recreate the schema on startup (destructive)
        #[arg(long)]
        recreate_schema: bool,
    },
    /// Run a worker node
    Worker {
        /// Port for the worker's task listener (0 = ephemeral)
        #[arg(long, default_value_t = 0)]
        listen_port: u16,
        /// Simulated work duration per task, in milliseconds
        #[arg(long, default_value_t = 2000)]
        work_ms: u64,
    },
    /// Submit a task to the coordinator
    Submit {
        /// Short task label
        name: String,
        /// Opaque task payload
        data: String,
        /// Dispatch priority; higher dispatches earlier
        #[arg(long, default_value_t = 1)]
        priority: i32,
    },
    /// Check whether a task has completed
    Status {
        /// Task ID to check
        task_id: String,
    },
    /// List completed tasks from the store
    Completed {
        /// Maximum number of rows to show
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

/// Execute the `foreman init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        coordinator: config::CoordinatorSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  coordinator.addr = {}", config::DEFAULT_COORDINATOR_ADDR);
    println!();
    println!("Next: run `foreman db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `foreman db-init` command: create database and run
/// migrations.
async fn cmd_db_init(resolved: &ForemanConfig) -> anyhow::Result<()> {
    println!("Initializing foreman database...");

    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let pending = task_db::list_pending(&db_pool).await?;
    println!("Database ready ({} pending tasks).", pending.len());

    db_pool.close().await;
    println!("foreman db-init complete.");
    Ok(())
}

/// Execute the `foreman serve` command: run the coordinator until a
/// shutdown signal arrives.
async fn cmd_serve(
    resolved: ForemanConfig,
    port: u16,
    recreate_schema: bool,
) -> anyhow::Result<()> {
    let mut coordinator_config =
        CoordinatorConfig::new(resolved.db_config.with_recreate_schema(recreate_schema));
    coordinator_config.port = port;

    let coordinator = Coordinator::start(coordinator_config).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    coordinator.run_until_cancelled(shutdown).await
}

/// Execute the `foreman worker` command: run a worker node until a
/// shutdown signal arrives.
async fn cmd_worker(resolved: ForemanConfig, listen_port: u16, work_ms: u64) -> anyhow::Result<()> {
    let mut worker_config = WorkerConfig::new(resolved.coordinator_addr);
    worker_config.listen_port = listen_port;
    worker_config.work_duration = std::time::Duration::from_millis(work_ms);

    let worker = WorkerNode::start(worker_config).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    worker.run_until_cancelled(shutdown).await
}

/// Cancel the token on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            let resolved =
                ForemanConfig::resolve(cli.database_url.as_deref(), cli.coordinator.as_deref())?;
            cmd_db_init(&resolved).await?;
        }
        Commands::Serve {
            port,
            recreate_schema,
        } => {
            let resolved =
                ForemanConfig::resolve(cli.database_url.as_deref(), cli.coordinator.as_deref())?;
            cmd_serve(resolved, port, recreate_schema).await?;
        }
        Commands::Worker {
            listen_port,
            work_ms,
        } => {
            let resolved =
                ForemanConfig::resolve(cli.database_url.as_deref(), cli.coordinator.as_deref())?;
            cmd_worker(resolved, listen_port, work_ms).await?;
        }
        Commands::Submit {
            name,
            data,
            priority,
        } => {
            let resolved =
                ForemanConfig::resolve(cli.database_url.as_deref(), cli.coordinator.as_deref())?;
            let id = client::submit_task(resolved.coordinator_addr, &name, &data, priority).await?;
            println!("Submitted task {id} ({name}, priority {priority}).");
        }
        Commands::Status { task_id } => {
            let resolved =
                ForemanConfig::resolve(cli.database_url.as_deref(), cli.coordinator.as_deref())?;
            let id = uuid::Uuid::parse_str(&task_id)
                .with_context(|| format!("invalid task ID: {task_id}"))?;
            let completed = client::check_status(resolved.coordinator_addr, id).await?;
            println!("Task {task_id}: completed = {completed}");
        }
        Commands::Completed { limit } => {
            let resolved =
                ForemanConfig::resolve(cli.database_url.as_deref(), cli.coordinator.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = task_db::list_completed(&db_pool, limit).await;
            db_pool.close().await;

            let completed = result?;
            if completed.is_empty() {
                println!("No completed tasks.");
            } else {
                println!("{:<38} {:<24} {:>8}  completed at", "id", "name", "priority");
                for task in &completed {
                    let completed_at = task
                        .completed_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default();
                    println!(
                        "{:<38} {:<24} {:>8}  {}",
                        task.id, task.name, task.priority, completed_at
                    );
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serialise tests that mutate process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
