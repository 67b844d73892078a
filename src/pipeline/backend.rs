use super::artifact::{Extracted, Flashcard, SourceInput, TopicSet};
use super::StageContext;
use crate::error::BackendError;
use async_trait::async_trait;

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        input: &SourceInput,
        ctx: &StageContext<'_>,
    ) -> Result<Extracted, BackendError>;
}

#[async_trait]
pub trait TopicModeler: Send + Sync {
    async fn topics(&self, text: &str, ctx: &StageContext<'_>) -> Result<TopicSet, BackendError>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, ctx: &StageContext<'_>) -> Result<String, BackendError>;
}

#[async_trait]
pub trait FlashcardGenerator: Send + Sync {
    async fn flashcards(
        &self,
        text: &str,
        topics: &TopicSet,
        ctx: &StageContext<'_>,
    ) -> Result<Vec<Flashcard>, BackendError>;
}

/// Turns paragraphs into fixed-length vectors for clustering.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;
}
