//! The four-stage analysis pipeline: extract → topics → summary → flashcards.
//!
//! Stages never write task state themselves. They read the cancellation
//! token in their [`StageContext`] and push progress through a
//! [`ProgressSink`]; the scheduler decides what the outcome means.

pub mod artifact;
pub mod backend;
pub mod cluster;
pub mod embed;
pub mod extract;
pub mod flashcards;
pub mod summary;
pub mod text;
pub mod topics;


use crate::error::BackendError;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use artifact::{
    AnalysisArtifact, CardKind, Extracted, Flashcard, PageRange, SourceInput, SourceKind,
    StageTimings, Topic, TopicSet, TopicSource,
};
pub use backend::{Embedder, Extractor, FlashcardGenerator, Summarizer, TopicModeler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Topics,
    Summary,
    Flashcards,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extract => "extracting",
            Stage::Topics => "topics",
            Stage::Summary => "summary",
            Stage::Flashcards => "flashcards",
        }
    }

    /// Percent window a stage reports into. Windows never overlap, so
    /// progress stays monotonic across stage boundaries.
    pub fn progress_range(&self) -> (i32, i32) {
        match self {
            Stage::Extract => (10, 40),
            Stage::Topics => (50, 60),
            Stage::Summary => (70, 80),
            Stage::Flashcards => (85, 90),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives progress pushed by stages. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: i32, stage: &str, detail: &str);
}

/// Discards every update.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: i32, _stage: &str, _detail: &str) {}
}

/// Per-task handle given to every stage and backend call.
pub struct StageContext<'a> {
    pub task_id: i64,
    pub cancel: &'a CancellationToken,
    pub progress: &'a dyn ProgressSink,
}

impl<'a> StageContext<'a> {
    pub fn new(task_id: i64, cancel: &'a CancellationToken, progress: &'a dyn ProgressSink) -> Self {
        Self {
            task_id,
            cancel,
            progress,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation checkpoint for use inside backends.
    pub fn checkpoint(&self) -> Result<(), BackendError> {
        if self.cancel.is_cancelled() {
            Err(BackendError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report progress as a fraction of the stage's window.
    pub fn report(&self, stage: Stage, fraction: f32, detail: &str) {
        let (start, end) = stage.progress_range();
        let fraction = fraction.clamp(0.0, 1.0);
        let percent = start + ((end - start) as f32 * fraction).round() as i32;
        self.progress.report(percent, stage.name(), detail);
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// Cancellation observed. Not a failure.
    #[error("{stage} cancelled")]
    Cancelled { stage: Stage },

    #[error("{stage}: {message}")]
    Validation { stage: Stage, message: String },

    #[error("{stage} failed: {message}")]
    Backend { stage: Stage, message: String },
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled { .. })
    }

    fn from_backend(stage: Stage, err: BackendError) -> Self {
        match err {
            BackendError::Cancelled => StageError::Cancelled { stage },
            BackendError::Invalid(message) => StageError::Validation { stage, message },
            BackendError::Transient(message) | BackendError::Permanent(message) => {
                StageError::Backend { stage, message }
            }
        }
    }
}

type Attempt<'a, T> = BoxFuture<'a, Result<T, BackendError>>;

/// Applies the retry/fallback policy around one stage call.
///
/// Transient errors get one retry after `retry_delay`, then the fallback
/// when one is given. Permanent and invalid-input errors end the stage
/// at once. The fallback future is lazy and only polled when needed.
#[derive(Debug, Clone)]
pub struct StageRunner {
    retry_delay: Duration,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl StageRunner {
    pub fn new(retry_delay: Duration) -> Self {
        Self { retry_delay }
    }

    pub async fn run<'a, T>(
        &self,
        stage: Stage,
        ctx: &StageContext<'_>,
        primary: impl Fn() -> Attempt<'a, T>,
        fallback: Option<Attempt<'a, T>>,
    ) -> Result<T, StageError> {
        if ctx.is_cancelled() {
            return Err(StageError::Cancelled { stage });
        }
        ctx.report(stage, 0.0, "starting");

        let first = match primary().await {
            Ok(value) => return Ok(value),
            Err(BackendError::Transient(message)) => message,
            Err(e) => return Err(StageError::from_backend(stage, e)),
        };
        log::warn!(
            "Task {} {} hit a transient error, retrying: {}",
            ctx.task_id,
            stage,
            first
        );

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(StageError::Cancelled { stage }),
            _ = tokio::time::sleep(self.retry_delay) => {}
        }

        let second = match primary().await {
            Ok(value) => return Ok(value),
            Err(BackendError::Transient(message)) => message,
            Err(e) => return Err(StageError::from_backend(stage, e)),
        };

        match fallback {
            Some(fallback) => {
                log::warn!(
                    "Task {} {} still failing ({}), using local fallback",
                    ctx.task_id,
                    stage,
                    second
                );
                fallback
                    .await
                    .map_err(|e| StageError::from_backend(stage, e))
            }
            None => Err(StageError::Backend {
                stage,
                message: second,
            }),
        }
    }
}

/// Stage backends plus their local fallbacks.
pub struct Pipeline {
    extractor: Arc<dyn Extractor>,
    topics: Arc<dyn TopicModeler>,
    summarizer: Arc<dyn Summarizer>,
    flashcards: Arc<dyn FlashcardGenerator>,
    topics_fallback: Option<Arc<dyn TopicModeler>>,
    summary_fallback: Option<Arc<dyn Summarizer>>,
    flashcards_fallback: Option<Arc<dyn FlashcardGenerator>>,
    runner: StageRunner,
}

impl Pipeline {
    /// A pipeline whose every stage is computed locally.
    pub fn local(extractor: Arc<dyn Extractor>) -> Self {
        Self {
            extractor,
            topics: Arc::new(topics::ClusterTopicModeler::default()),
            summarizer: Arc::new(summary::ExtractiveSummarizer::default()),
            flashcards: Arc::new(flashcards::RuleBasedFlashcards::default()),
            topics_fallback: None,
            summary_fallback: None,
            flashcards_fallback: None,
            runner: StageRunner::default(),
        }
    }

    /// Put `topics` in front of the current topic backend, which becomes its
    /// fallback.
    pub fn with_topics(mut self, topics: Arc<dyn TopicModeler>) -> Self {
        let local = std::mem::replace(&mut self.topics, topics);
        self.topics_fallback = Some(local);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        let local = std::mem::replace(&mut self.summarizer, summarizer);
        self.summary_fallback = Some(local);
        self
    }

    pub fn with_flashcards(mut self, flashcards: Arc<dyn FlashcardGenerator>) -> Self {
        let local = std::mem::replace(&mut self.flashcards, flashcards);
        self.flashcards_fallback = Some(local);
        self
    }

    pub fn with_runner(mut self, runner: StageRunner) -> Self {
        self.runner = runner;
        self
    }

    pub async fn run(
        &self,
        input: &SourceInput,
        ctx: &StageContext<'_>,
    ) -> Result<AnalysisArtifact, StageError> {
        let mut timings = StageTimings::default();

        let started = Instant::now();
        let extracted = self
            .runner
            .run(Stage::Extract, ctx, || self.extractor.extract(input, ctx), None)
            .await?;
        timings.extract_ms = elapsed_ms(started);

        if extracted.text.trim().is_empty() {
            return Err(StageError::Validation {
                stage: Stage::Extract,
                message: "no text could be extracted".to_string(),
            });
        }
        let text = extracted.text.as_str();
        log::info!(
            "Task {} extracted {} chars from {}",
            ctx.task_id,
            text.len(),
            input.filename
        );

        let started = Instant::now();
        let topic_set = self
            .runner
            .run(
                Stage::Topics,
                ctx,
                || self.topics.topics(text, ctx),
                self.topics_fallback.as_ref().map(|f| f.topics(text, ctx)),
            )
            .await?;
        timings.topics_ms = elapsed_ms(started);

        let started = Instant::now();
        let summary = self
            .runner
            .run(
                Stage::Summary,
                ctx,
                || self.summarizer.summarize(text, ctx),
                self.summary_fallback
                    .as_ref()
                    .map(|f| f.summarize(text, ctx)),
            )
            .await?;
        timings.summary_ms = elapsed_ms(started);

        let started = Instant::now();
        let cards = self
            .runner
            .run(
                Stage::Flashcards,
                ctx,
                || self.flashcards.flashcards(text, &topic_set, ctx),
                self.flashcards_fallback
                    .as_ref()
                    .map(|f| f.flashcards(text, &topic_set, ctx)),
            )
            .await?;
        timings.flashcards_ms = elapsed_ms(started);

        Ok(AnalysisArtifact {
            kind: extracted.kind,
            text_length: text.chars().count(),
            topics: topic_set,
            summary,
            flashcards: cards,
            segments: extracted.segments,
            duration_seconds: extracted.duration_seconds,
            profile: extracted.profile,
            timings,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
