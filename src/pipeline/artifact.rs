//! Data that flows between pipeline stages and ends up in the result sink.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Inclusive 1-based page range for paged documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl FromStr for PageRange {
    type Err = String;

    /// Accepts `"3"` or `"2-7"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (first, last) = match s.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (s, s),
        };
        let first: u32 = first
            .parse()
            .map_err(|_| format!("invalid page number: {:?}", first))?;
        let last: u32 = last
            .parse()
            .map_err(|_| format!("invalid page number: {:?}", last))?;
        if first == 0 || last < first {
            return Err(format!("invalid page range: {}", s));
        }
        Ok(Self { first, last })
    }
}

impl std::fmt::Display for PageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

/// What the extract stage is asked to read.
#[derive(Debug, Clone)]
pub struct SourceInput {
    pub path: PathBuf,
    pub filename: String,
    pub page_range: Option<PageRange>,
}

impl SourceInput {
    /// Lowercased extension including the dot, e.g. `".pdf"`.
    pub fn file_type(&self) -> String {
        std::path::Path::new(&self.filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Text,
    Pdf,
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileName {
    Express,
    Fast,
    Balanced,
    Accurate,
}

impl std::fmt::Display for ProfileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProfileName::Express => "express",
            ProfileName::Fast => "fast",
            ProfileName::Balanced => "balanced",
            ProfileName::Accurate => "accurate",
        })
    }
}

/// Transcription/sampling settings chosen from the media duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub name: ProfileName,
    /// Length of audio handed to one transcriber invocation.
    pub chunk_seconds: u32,
    /// Candidates sampled per segment; fewer is faster.
    pub best_of: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Output of the extract stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extracted {
    pub kind: SourceKind,
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub duration_seconds: Option<f64>,
    pub profile: Option<ExecutionProfile>,
}

impl Extracted {
    pub fn text(kind: SourceKind, text: String) -> Self {
        Self {
            kind,
            text,
            segments: Vec::new(),
            duration_seconds: None,
            profile: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicSource {
    Cluster,
    Keyword,
    Generic,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub title: String,
    pub summary: String,
    pub key_concepts: Vec<String>,
    pub source: TopicSource,
}

impl Topic {
    pub fn generic() -> Self {
        Self {
            title: "Main topic of the document".to_string(),
            summary: "The document is too short for a detailed breakdown".to_string(),
            key_concepts: Vec::new(),
            source: TopicSource::Generic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSet {
    pub topics: Vec<Topic>,
    pub paragraph_count: usize,
}

impl TopicSet {
    pub fn titles(&self) -> Vec<&str> {
        self.topics.iter().map(|t| t.title.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Definition,
    Concept,
    Application,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flashcard {
    pub kind: CardKind,
    pub question: String,
    pub answer: String,
    pub hint: Option<String>,
    pub difficulty: u8,
    pub next_review: NaiveDate,
    pub ease_factor: f32,
}

impl Flashcard {
    pub fn new(kind: CardKind, question: String, answer: String, difficulty: u8) -> Self {
        let difficulty = difficulty.clamp(1, 3);
        Self {
            kind,
            question,
            answer,
            hint: None,
            difficulty,
            next_review: next_review(difficulty),
            ease_factor: 2.5,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// First review date: 1, 3 or 7 days out depending on difficulty.
pub fn next_review(difficulty: u8) -> NaiveDate {
    let days = match difficulty {
        1 => 1,
        2 => 3,
        _ => 7,
    };
    (Utc::now() + ChronoDuration::days(days)).date_naive()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub extract_ms: u64,
    pub topics_ms: u64,
    pub summary_ms: u64,
    pub flashcards_ms: u64,
}

/// Everything the pipeline produced for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisArtifact {
    pub kind: SourceKind,
    pub text_length: usize,
    pub topics: TopicSet,
    pub summary: String,
    pub flashcards: Vec<Flashcard>,
    pub segments: Vec<TranscriptSegment>,
    pub duration_seconds: Option<f64>,
    pub profile: Option<ExecutionProfile>,
    pub timings: StageTimings,
}
