//! Where finished analyses are persisted.

use crate::database::{Database, ResultRef};
use crate::error::AppError;
use crate::pipeline::AnalysisArtifact;
use async_trait::async_trait;
use std::sync::Arc;

/// Everything needed to persist one finished analysis.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub owner_id: i64,
    pub task_id: i64,
    pub filename: String,
    pub file_type: String,
    pub artifact: AnalysisArtifact,
    /// Free-form details forwarded from the request, e.g. the page range.
    pub extra_metadata: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, request: SaveRequest) -> Result<ResultRef, AppError>;

    /// Remove a result saved for a task that did not end up completed.
    async fn discard(&self, result: &ResultRef) -> Result<(), AppError>;
}

pub struct SqliteResultSink {
    db: Arc<Database>,
}

impl SqliteResultSink {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ResultSink for SqliteResultSink {
    async fn save(&self, request: SaveRequest) -> Result<ResultRef, AppError> {
        let artifact_json = serde_json::to_string(&request.artifact)?;
        let metadata = if request.extra_metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&request.extra_metadata)?)
        };
        let result = self.db.insert_result(
            request.owner_id,
            request.task_id,
            &request.filename,
            &request.file_type,
            &artifact_json,
            metadata.as_deref(),
        )?;
        log::info!(
            "Saved result {} for task {} ({} topics, {} cards)",
            result.id,
            request.task_id,
            request.artifact.topics.topics.len(),
            request.artifact.flashcards.len()
        );
        Ok(result)
    }

    async fn discard(&self, result: &ResultRef) -> Result<(), AppError> {
        let removed = self.db.delete_result(result.id)?;
        if removed == 0 {
            log::warn!("Result {} was already gone when discarding", result.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{SourceKind, StageTimings, Topic, TopicSet};
    use tempfile::TempDir;

    fn artifact() -> AnalysisArtifact {
        AnalysisArtifact {
            kind: SourceKind::Text,
            text_length: 40,
            topics: TopicSet {
                topics: vec![Topic::generic()],
                paragraph_count: 0,
            },
            summary: "short".to_string(),
            flashcards: Vec::new(),
            segments: Vec::new(),
            duration_seconds: None,
            profile: None,
            timings: StageTimings::default(),
        }
    }

    #[tokio::test]
    async fn test_save_then_discard() {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        let task = db.create_task(3, "notes.pdf").unwrap();
        let sink = SqliteResultSink::new(db.clone());

        let mut extra = serde_json::Map::new();
        extra.insert("page_range".into(), "2-4".into());
        let saved = sink
            .save(SaveRequest {
                owner_id: 3,
                task_id: task,
                filename: "notes.pdf".into(),
                file_type: ".pdf".into(),
                artifact: artifact(),
                extra_metadata: extra,
            })
            .await
            .unwrap();

        let stored = db.get_result_by_token(&saved.access_token).unwrap().unwrap();
        assert_eq!(stored.owner_id, 3);
        assert!(stored.metadata_json.unwrap().contains("2-4"));
        let back: AnalysisArtifact = serde_json::from_str(&stored.artifact_json).unwrap();
        assert_eq!(back.summary, "short");

        sink.discard(&saved).await.unwrap();
        assert_eq!(db.count_results_for_task(task).unwrap(), 0);
        // Discarding twice is harmless
        sink.discard(&saved).await.unwrap();
    }
}
