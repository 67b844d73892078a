pub mod config;
pub mod database;
pub mod error;
pub mod ollama;
pub mod pipeline;
pub mod sink;
pub mod worker;

use config::AppConfig;
use database::Database;
use error::AppError;
use ollama::OllamaClient;
use pipeline::extract::FileExtractor;
use pipeline::topics::ClusterTopicModeler;
use pipeline::Pipeline;
use sink::SqliteResultSink;
use std::sync::Arc;
use worker::TaskScheduler;

/// Local stages, with the Ollama backends in front of them when enabled.
pub fn build_pipeline(config: &AppConfig) -> Pipeline {
    let mut pipeline = Pipeline::local(Arc::new(FileExtractor::new(config.media.clone())));
    if !config.ollama.enabled {
        log::info!("Ollama disabled, all stages run locally");
        return pipeline;
    }

    let client = Arc::new(OllamaClient::new(&config.ollama));
    if config.ollama.llm_topics {
        pipeline = pipeline.with_topics(client.clone());
    } else if client.has_embeddings() {
        pipeline = pipeline.with_topics(Arc::new(ClusterTopicModeler::new(client.clone())));
    }
    log::info!(
        "Using Ollama model {} at {}",
        config.ollama.model,
        config.ollama.base_url
    );
    pipeline
        .with_summarizer(client.clone())
        .with_flashcards(client)
}

/// Open the database and wire a scheduler for `config`.
pub fn build_scheduler(config: &AppConfig) -> Result<TaskScheduler, AppError> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(config.upload_dir())?;

    let db = Arc::new(Database::new(&db_path)?);
    log::info!("Database ready at {:?}", db_path);

    let sink = Arc::new(SqliteResultSink::new(db.clone()));
    Ok(TaskScheduler::new(
        db,
        build_pipeline(config),
        sink,
        config.max_concurrent_tasks,
    ))
}
