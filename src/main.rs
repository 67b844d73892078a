//! study-analyzer: turn lecture notes, PDFs and recordings into topics, a
//! summary and flashcards.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use study_analyzer_lib::config::AppConfig;
use study_analyzer_lib::database::{TaskRecord, TaskStatus};
use study_analyzer_lib::ollama::OllamaClient;
use study_analyzer_lib::pipeline::{AnalysisArtifact, PageRange};
use study_analyzer_lib::worker::{StartOptions, TaskScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "study-analyzer", version, about = "Analyze study material into topics, a summary and flashcards")]
struct Cli {
    /// Path to config.yaml
    #[arg(long, global = true, env = "STUDY_ANALYZER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one file and wait for the result (Ctrl-C cancels)
    Analyze {
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        owner: i64,
        /// PDF pages to read, e.g. "3" or "2-7"
        #[arg(long)]
        pages: Option<PageRange>,
        /// Print the full artifact as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one task
    Status {
        id: i64,
        #[arg(long, default_value_t = 1)]
        owner: i64,
    },
    /// List recent tasks
    List {
        #[arg(long)]
        owner: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Prune old tasks and delete orphaned uploads
    Housekeeping,
    /// Check the Ollama backend
    Health,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("study-analyzer")
        .join("config.yaml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = AppConfig::load(&config_path).context("loading configuration")?;

    match cli.command {
        Commands::Analyze {
            file,
            owner,
            pages,
            json,
        } => analyze(&config, &file, owner, pages, json).await,
        Commands::Status { id, owner } => {
            let scheduler = study_analyzer_lib::build_scheduler(&config)?;
            match scheduler.status(id, owner)? {
                Some(task) => print_task(&task),
                None => println!("Task {} not found", id),
            }
            Ok(())
        }
        Commands::List { owner, limit } => {
            let scheduler = study_analyzer_lib::build_scheduler(&config)?;
            for task in scheduler.list(owner, limit)? {
                print_task(&task);
            }
            let counts = scheduler.counts()?;
            println!(
                "processing {} / completed {} / failed {} / cancelled {}",
                counts.processing, counts.completed, counts.failed, counts.cancelled
            );
            Ok(())
        }
        Commands::Housekeeping => housekeeping(&config).await,
        Commands::Health => {
            let client = OllamaClient::new(&config.ollama);
            match client.health_check().await {
                Ok(status) => {
                    println!("Ollama running, model {} available: {}", status.model, status.model_available);
                    for model in status.available_models {
                        println!("  {}", model);
                    }
                }
                Err(e) => println!("Ollama unavailable: {}", e),
            }
            Ok(())
        }
    }
}

async fn analyze(
    config: &AppConfig,
    file: &Path,
    owner: i64,
    pages: Option<PageRange>,
    json: bool,
) -> Result<()> {
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("input path has no file name")?;

    let scheduler = study_analyzer_lib::build_scheduler(config)?;
    scheduler.recover_interrupted()?;

    // The task deletes its upload when done, so work on a private copy
    let upload = config
        .upload_dir()
        .join(format!("{}_{}", uuid::Uuid::new_v4(), filename));
    tokio::fs::copy(file, &upload)
        .await
        .with_context(|| format!("copying {:?} to {:?}", file, upload))?;

    let task_id = scheduler.create_task(owner, &filename)?;
    scheduler.start(
        task_id,
        owner,
        upload,
        &filename,
        StartOptions {
            page_range: pages,
            ..StartOptions::default()
        },
    )?;

    let task = wait_for(&scheduler, task_id, owner).await?;
    scheduler.shutdown().await;

    print_task(&task);
    if task.status != TaskStatus::Completed {
        return Ok(());
    }
    let stored = task
        .result
        .as_ref()
        .and_then(|r| scheduler.result(&r.access_token).transpose())
        .transpose()?
        .context("completed task has no stored result")?;
    if json {
        println!("{}", stored.artifact_json);
        return Ok(());
    }

    let artifact: AnalysisArtifact = serde_json::from_str(&stored.artifact_json)?;
    println!("\nSummary:\n{}\n", artifact.summary);
    println!("Topics:");
    for topic in &artifact.topics.topics {
        println!("  - {}", topic.title);
    }
    println!("\n{} flashcards (result token {})", artifact.flashcards.len(), stored.access_token);
    Ok(())
}

/// Poll until the task is terminal, printing stage changes. The first Ctrl-C
/// cancels the task.
async fn wait_for(scheduler: &TaskScheduler, task_id: i64, owner: i64) -> Result<TaskRecord> {
    let mut last_stage = String::new();
    let mut cancel_sent = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let task = scheduler
            .status(task_id, owner)?
            .context("task disappeared")?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        if task.current_stage != last_stage {
            println!("[{:>3}%] {} {}", task.progress, task.current_stage, task.stage_details);
            last_stage = task.current_stage.clone();
        }

        tokio::select! {
            _ = &mut ctrl_c, if !cancel_sent => {
                cancel_sent = true;
                if scheduler.cancel(task_id, owner)? {
                    println!("Cancelling task {}...", task_id);
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}

async fn housekeeping(config: &AppConfig) -> Result<()> {
    let scheduler = study_analyzer_lib::build_scheduler(config)?;
    let recovered = scheduler.recover_interrupted()?;
    let pruned = scheduler.prune_old_tasks(config.janitor.task_retention_days)?;
    let swept = scheduler
        .sweep_orphans(
            &config.upload_dir(),
            Duration::from_secs(config.janitor.orphan_max_age_hours * 3600),
        )
        .await?;
    println!(
        "Recovered {} interrupted tasks, pruned {} old tasks, deleted {} orphaned uploads",
        recovered,
        pruned,
        swept.len()
    );
    Ok(())
}

fn print_task(task: &TaskRecord) {
    println!(
        "#{} {} [{}] {}% {} ({})",
        task.id,
        task.filename,
        task.status,
        task.progress,
        task.current_stage,
        task.user_message()
    );
}
