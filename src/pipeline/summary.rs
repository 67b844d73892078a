use super::backend::Summarizer;
use super::text::{sentences, truncate_chars};
use super::{Stage, StageContext};
use crate::error::BackendError;
use async_trait::async_trait;

/// Summary made of the opening sentences of the material.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    max_sentences: usize,
    max_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            max_sentences: 5,
            max_chars: 1200,
        }
    }
}

impl ExtractiveSummarizer {
    pub fn summarize_text(&self, text: &str) -> String {
        // Skip headings and fragments
        let picked: Vec<&str> = sentences(text)
            .into_iter()
            .filter(|s| s.chars().count() >= 20)
            .take(self.max_sentences)
            .collect();

        let summary = if picked.is_empty() {
            text.split_whitespace().collect::<Vec<_>>().join(" ")
        } else {
            picked
                .iter()
                .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
                .collect::<Vec<_>>()
                .join(" ")
        };
        truncate_chars(&summary, self.max_chars)
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, text: &str, ctx: &StageContext<'_>) -> Result<String, BackendError> {
        ctx.checkpoint()?;
        let summary = self.summarize_text(text);
        ctx.report(Stage::Summary, 1.0, "extractive summary");
        Ok(summary)
    }
}
