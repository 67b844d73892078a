//! Local topic extraction: paragraph embeddings clustered with HDBSCAN,
//! backed by keyword frequency and finally a single generic topic.

use super::artifact::{Topic, TopicSet, TopicSource};
use super::backend::{Embedder, TopicModeler};
use super::cluster::Hdbscan;
use super::embed::{l2_normalize, HashingEmbedder};
use super::text::{capitalize, frequent_words, paragraphs, sentences, truncate_chars};
use super::{Stage, StageContext};
use crate::error::BackendError;
use async_trait::async_trait;
use std::sync::Arc;

/// Paragraphs this short are ignored.
pub const MIN_PARAGRAPH_CHARS: usize = 50;
/// Below this many usable paragraphs the document gets one generic topic.
pub const MIN_PARAGRAPHS: usize = 3;
pub const MAX_TOPICS: usize = 10;
const MIN_TOPICS: usize = 3;

pub fn min_cluster_size(paragraph_count: usize) -> usize {
    (paragraph_count / 4).min(3).max(2)
}

pub struct ClusterTopicModeler {
    embedder: Arc<dyn Embedder>,
}

impl Default for ClusterTopicModeler {
    fn default() -> Self {
        Self::new(Arc::new(HashingEmbedder::default()))
    }
}

impl ClusterTopicModeler {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    async fn cluster_topics(
        &self,
        paras: &[String],
        ctx: &StageContext<'_>,
    ) -> Result<Vec<Topic>, BackendError> {
        ctx.report(Stage::Topics, 0.2, "embedding paragraphs");
        let embedded = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(BackendError::Cancelled),
            result = self.embedder.embed(paras) => result,
        };
        let mut vectors = match embedded {
            Ok(v) if v.len() == paras.len() => v,
            Ok(v) => {
                log::warn!(
                    "Embedder returned {} vectors for {} paragraphs, skipping clustering",
                    v.len(),
                    paras.len()
                );
                return Ok(Vec::new());
            }
            Err(BackendError::Cancelled) => return Err(BackendError::Cancelled),
            Err(e) => {
                log::warn!("Embedding failed, skipping clustering: {}", e);
                return Ok(Vec::new());
            }
        };
        for v in vectors.iter_mut() {
            l2_normalize(v);
        }

        ctx.checkpoint()?;
        ctx.report(Stage::Topics, 0.6, "clustering");

        let labels = Hdbscan::new(min_cluster_size(paras.len())).fit(&vectors);
        let cluster_count = labels.iter().flatten().max().map_or(0, |m| m + 1);
        let mut groups: Vec<Vec<&str>> = vec![Vec::new(); cluster_count];
        for (para, label) in paras.iter().zip(&labels) {
            if let Some(label) = label {
                groups[*label].push(para.as_str());
            }
        }

        log::debug!(
            "Task {}: {} paragraphs, {} clusters, {} noise",
            ctx.task_id,
            paras.len(),
            cluster_count,
            labels.iter().filter(|l| l.is_none()).count()
        );

        Ok(groups.iter().filter_map(|g| cluster_topic(g)).collect())
    }
}

fn cluster_topic(group: &[&str]) -> Option<Topic> {
    let first = group.first()?;
    let title = sentences(first)
        .first()
        .map(|s| truncate_chars(s.trim_end_matches(['.', '!', '?']), 80))
        .unwrap_or_else(|| truncate_chars(first, 80));
    let joined = group.join("\n\n");
    let key_concepts = frequent_words(&joined, 4, 0)
        .into_iter()
        .take(5)
        .map(|(w, _)| w)
        .collect();
    Some(Topic {
        title,
        summary: truncate_chars(first, 200),
        key_concepts,
        source: TopicSource::Cluster,
    })
}

/// Topics named after the most frequent content words of the whole text.
pub fn keyword_topics(text: &str, limit: usize) -> Vec<Topic> {
    frequent_words(text, 4, 2)
        .into_iter()
        .take(limit)
        .map(|(word, count)| Topic {
            title: capitalize(&word),
            summary: format!("Mentioned {} times in the material", count),
            key_concepts: vec![word],
            source: TopicSource::Keyword,
        })
        .collect()
}

/// Top up `topics` with keyword topics whose title is not already taken.
pub fn backfill(mut topics: Vec<Topic>, text: &str) -> Vec<Topic> {
    if topics.len() < MIN_TOPICS {
        let wanted = MIN_TOPICS - topics.len();
        let candidates = keyword_topics(text, MAX_TOPICS);
        let extra: Vec<Topic> = candidates
            .into_iter()
            .filter(|k| !topics.iter().any(|t| t.title.eq_ignore_ascii_case(&k.title)))
            .take(wanted)
            .collect();
        topics.extend(extra);
    }
    if topics.is_empty() {
        topics.push(Topic::generic());
    }
    topics.truncate(MAX_TOPICS);
    topics
}

#[async_trait]
impl TopicModeler for ClusterTopicModeler {
    async fn topics(&self, text: &str, ctx: &StageContext<'_>) -> Result<TopicSet, BackendError> {
        let paras = paragraphs(text, MIN_PARAGRAPH_CHARS);
        if paras.len() < MIN_PARAGRAPHS {
            log::info!(
                "Task {}: only {} usable paragraphs, using generic topic",
                ctx.task_id,
                paras.len()
            );
            return Ok(TopicSet {
                topics: vec![Topic::generic()],
                paragraph_count: paras.len(),
            });
        }

        let clustered = self.cluster_topics(&paras, ctx).await?;
        let topics = backfill(clustered, text);
        ctx.report(Stage::Topics, 1.0, &format!("{} topics", topics.len()));

        Ok(TopicSet {
            topics,
            paragraph_count: paras.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::NoProgress;
    use tokio_util::sync::CancellationToken;

    const BIOLOGY: &str = "Mitochondria produce energy for the cell through cellular respiration and oxygen.";
    const HISTORY: &str = "The French revolution overthrew the monarchy in Paris during seventeen eighty nine.";

    fn repeated(sentence: &str, variant: usize) -> String {
        format!("{} Variant number {} adds a little more context here.", sentence, variant)
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
            Err(BackendError::Transient("embedding server down".into()))
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(vec![vec![1.0, 0.0]; texts.len()])
        }
    }

    #[test]
    fn test_min_cluster_size() {
        assert_eq!(min_cluster_size(3), 2);
        assert_eq!(min_cluster_size(8), 2);
        assert_eq!(min_cluster_size(12), 3);
        assert_eq!(min_cluster_size(100), 3);
    }

    #[tokio::test]
    async fn test_short_text_gets_single_generic_topic() {
        let token = CancellationToken::new();
        let ctx = StageContext::new(1, &token, &NoProgress);
        let set = ClusterTopicModeler::default()
            .topics("Forty characters of text, nothing more.", &ctx)
            .await
            .unwrap();
        assert_eq!(set.topics.len(), 1);
        assert_eq!(set.topics[0].source, TopicSource::Generic);
        assert_eq!(set.paragraph_count, 0);
    }

    #[tokio::test]
    async fn test_two_paragraphs_still_generic() {
        let token = CancellationToken::new();
        let ctx = StageContext::new(1, &token, &NoProgress);
        let text = format!("{}\n\n{}", repeated(BIOLOGY, 1), repeated(HISTORY, 1));
        let set = ClusterTopicModeler::default().topics(&text, &ctx).await.unwrap();
        assert_eq!(set.topics, vec![Topic::generic()]);
    }

    #[tokio::test]
    async fn test_clusters_separate_subjects() {
        let token = CancellationToken::new();
        let ctx = StageContext::new(1, &token, &NoProgress);
        let mut paras = Vec::new();
        for _ in 0..4 {
            paras.push(BIOLOGY.to_string());
            paras.push(HISTORY.to_string());
        }
        let text = paras.join("\n\n");

        let set = ClusterTopicModeler::default().topics(&text, &ctx).await.unwrap();
        let clustered: Vec<&Topic> = set
            .topics
            .iter()
            .filter(|t| t.source == TopicSource::Cluster)
            .collect();
        assert_eq!(clustered.len(), 2);
        assert!(clustered[0].title.starts_with("Mitochondria produce energy"));
        assert!(clustered[1].title.starts_with("The French revolution"));
        // Two clusters is below the minimum, so one keyword topic tops it up
        assert_eq!(set.topics.len(), 3);
        assert_eq!(set.topics[2].source, TopicSource::Keyword);
        assert!(set.topics.len() <= MAX_TOPICS);
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_keywords() {
        let token = CancellationToken::new();
        let ctx = StageContext::new(1, &token, &NoProgress);
        let text = vec![BIOLOGY; 4].join("\n\n");
        let modeler = ClusterTopicModeler::new(Arc::new(FailingEmbedder));
        let set = modeler.topics(&text, &ctx).await.unwrap();
        assert!(!set.topics.is_empty());
        assert!(set.topics.iter().all(|t| t.source == TopicSource::Keyword));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_embedder() {
        let token = CancellationToken::new();
        let trip = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trip.cancel();
        });
        let ctx = StageContext::new(1, &token, &NoProgress);
        let text = vec![BIOLOGY; 4].join("\n\n");

        let started = std::time::Instant::now();
        let result = ClusterTopicModeler::new(Arc::new(SlowEmbedder))
            .topics(&text, &ctx)
            .await;
        assert_eq!(result, Err(BackendError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_between_embedding_and_clustering() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = StageContext::new(1, &token, &NoProgress);
        let text = vec![BIOLOGY; 4].join("\n\n");
        let result = ClusterTopicModeler::default().topics(&text, &ctx).await;
        assert_eq!(result, Err(BackendError::Cancelled));
    }

    #[test]
    fn test_backfill_falls_back_to_generic() {
        let topics = backfill(Vec::new(), "no repeated words at all here");
        assert_eq!(topics, vec![Topic::generic()]);
    }
}
