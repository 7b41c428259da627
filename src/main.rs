use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sparc_orchestrator::queue::TaskStatus;
use sparc_orchestrator::{
    run_until_idle, BaselineExecutor, Orchestrator, OrchestratorConfig, WorkerPoolConfig,
};

#[derive(Parser)]
#[command(name = "sparc-orchestrator")]
#[command(
    author,
    version,
    about = "Agent registry, task queue and SPARC pipeline",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $SPARC_ORCHESTRATOR_CONFIG or the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// DuckDB file, overriding `storage.database_path`
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register every agent definition (*.json) found under a directory
    Register { dir: PathBuf },

    /// Queue a task
    Submit {
        description: String,

        /// low, medium or high
        #[arg(short, long, default_value = "medium")]
        complexity: String,
    },

    /// Run queued tasks until none is eligible
    Run {
        /// Concurrent workers (default: `pipeline.workers`)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// List registered agents
    Agents,

    /// List tasks
    Tasks {
        /// pending, in_progress, completed or failed
        #[arg(long)]
        status: Option<String>,
    },

    /// Show queue, memory and performance statistics
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging.level, cli.verbose);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => OrchestratorConfig::load_default().context("loading default config")?,
    };
    if let Some(database) = &cli.database {
        config.storage.database_path = Some(database.clone());
    }
    if config.storage.database_path.is_none() {
        config.storage.database_path = OrchestratorConfig::default_database_path();
    }
    Ok(config)
}

fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("sparc_orchestrator=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("sparc_orchestrator={}", level)))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli, config: OrchestratorConfig) -> Result<()> {
    let orchestrator = Arc::new(
        Orchestrator::from_config(&config, Arc::new(BaselineExecutor))
            .context("opening orchestrator storage")?,
    );

    match cli.command {
        Commands::Register { dir } => {
            let names = orchestrator
                .capabilities()
                .load_definitions(&dir)
                .with_context(|| format!("registering agents from {}", dir.display()))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                println!("Registered {} agents", names.len());
                for name in names {
                    println!("  {}", name);
                }
            }
        }
        Commands::Submit {
            description,
            complexity,
        } => {
            let id = orchestrator.submit(&description, &complexity)?;
            let task = orchestrator.queue().get(id)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&task)?);
            } else {
                println!(
                    "Queued task {} ({} pattern, agents: {})",
                    id,
                    task.pattern_used.map(|p| p.as_str()).unwrap_or("-"),
                    task.assigned_agents.join(", ")
                );
            }
        }
        Commands::Run { workers } => {
            let mut pool_config = WorkerPoolConfig::from(&config);
            if let Some(workers) = workers {
                pool_config = pool_config.with_workers(workers);
            }
            let reports = run_until_idle(Arc::clone(&orchestrator), pool_config).await;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    match &report.error {
                        None => println!(
                            "task {}: completed, {:.2}x improvement, quality {:.2}",
                            report.task_id,
                            report.improvement_factor.unwrap_or_default(),
                            report.average_quality.unwrap_or_default()
                        ),
                        Some(reason) => println!("task {}: failed ({})", report.task_id, reason),
                    }
                }
            }
            let blocked = orchestrator.queue().blocked();
            if !blocked.is_empty() {
                info!("{} tasks are blocked behind failed dependencies", blocked.len());
            }
        }
        Commands::Agents => {
            let agents = orchestrator.capabilities().list();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&agents)?);
            } else {
                for agent in agents {
                    println!(
                        "{:<24} {:<20} {:<10} perf {:.3}  success {:.3}  tasks {}",
                        agent.name,
                        agent.agent_type,
                        agent.preferred_pattern,
                        agent.performance_score,
                        agent.success_rate,
                        agent.total_tasks
                    );
                }
            }
        }
        Commands::Tasks { status } => {
            let tasks = match status {
                Some(status) => {
                    let status: TaskStatus = status.parse()?;
                    orchestrator.queue().list_by_status(status)
                }
                None => orchestrator.queue().list(),
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                for task in tasks {
                    println!(
                        "{:>6}  {:<11} p{:<3} {:<6} {}",
                        task.id, task.status, task.priority, task.complexity, task.description
                    );
                }
            }
        }
        Commands::Stats => {
            let queue = orchestrator.queue();
            let summary = orchestrator.performance().summary();
            let stats = serde_json::json!({
                "agents": orchestrator.capabilities().len(),
                "tasks": {
                    "pending": queue.list_by_status(TaskStatus::Pending).len(),
                    "in_progress": queue.list_by_status(TaskStatus::InProgress).len(),
                    "completed": queue.list_by_status(TaskStatus::Completed).len(),
                    "failed": queue.list_by_status(TaskStatus::Failed).len(),
                    "blocked": queue.blocked().len(),
                },
                "memory_fragments": orchestrator.memory().len(),
                "memory_capacity": orchestrator.memory().capacity(),
                "performance": &summary,
            });
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("agents:           {}", stats["agents"]);
                println!("tasks:            {}", stats["tasks"]);
                println!(
                    "memory fragments: {} / {}",
                    stats["memory_fragments"], stats["memory_capacity"]
                );
                println!(
                    "performance:      {} completed, {} failed, {:.2}x avg speedup, {:.2} avg quality",
                    summary.tasks_completed,
                    summary.tasks_failed,
                    summary.average_speedup,
                    summary.average_quality
                );
            }
        }
    }
    Ok(())
}
