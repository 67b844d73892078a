//! Rule-based flashcards: definitions, examples and key statements lifted
//! straight from the text, topped up from topics and informative sentences.

use super::artifact::{CardKind, Flashcard, TopicSet, TopicSource};
use super::backend::FlashcardGenerator;
use super::text::{sentences, truncate_chars};
use super::{Stage, StageContext};
use crate::error::BackendError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

const MAX_CARDS: usize = 15;
const MIN_CARDS: usize = 5;

struct Patterns {
    definitions: Vec<Regex>,
    example: Regex,
    key_statement: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        definitions: vec![
            Regex::new(r"\b([A-Z][a-z]+(?:\s+[a-z]+){0,3})\s+(?:is|are|refers to|means|—|–)\s+([^.!?]+)[.!?]")
                .unwrap(),
            Regex::new(r"\b([A-Z][a-z]+(?:\s+[a-z]+){0,3})\s+is called\s+([^.!?]+)[.!?]").unwrap(),
        ],
        example: Regex::new(r"(?i)\b(?:for example|for instance|e\.g\.)[,:]?\s*([^.!?]+)[.!?]").unwrap(),
        key_statement: Regex::new(
            r"(?i)\b(?:it is important to|importantly,|note that|remember that|keep in mind that)\s+([^.!?]+)[.!?]",
        )
        .unwrap(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct RuleBasedFlashcards;

impl RuleBasedFlashcards {
    pub fn generate(&self, text: &str, topics: &TopicSet) -> Vec<Flashcard> {
        let p = patterns();
        let mut cards = Vec::new();

        for re in &p.definitions {
            for caps in re.captures_iter(text).take(3) {
                let term = caps[1].trim();
                let definition = caps[2].trim();
                if term.len() > 3 && definition.len() > 10 && !is_pronoun(term) {
                    cards.push(
                        Flashcard::new(
                            CardKind::Definition,
                            format!("What is {}?", term),
                            format!("{} is {}", term, definition),
                            1,
                        )
                        .with_hint("The definition is given in the text"),
                    );
                }
            }
        }

        for (i, caps) in p.example.captures_iter(text).take(2).enumerate() {
            cards.push(
                Flashcard::new(
                    CardKind::Application,
                    format!("Give example #{} from the material", i + 1),
                    caps[1].trim().to_string(),
                    2,
                )
                .with_hint("The example is stated explicitly"),
            );
        }

        for caps in p.key_statement.captures_iter(text).take(2) {
            cards.push(Flashcard::new(
                CardKind::Concept,
                "What does the material say is important to remember?".to_string(),
                caps[1].trim().to_string(),
                2,
            ));
        }

        for topic in topics
            .topics
            .iter()
            .filter(|t| t.source != TopicSource::Generic)
            .take(5)
        {
            cards.push(
                Flashcard::new(
                    CardKind::Keyword,
                    format!("What does the material say about \"{}\"?", topic.title),
                    topic.summary.clone(),
                    1,
                )
                .with_hint("One of the main topics"),
            );
        }

        if cards.len() < MIN_CARDS {
            let wanted = MIN_CARDS - cards.len();
            cards.extend(
                sentences(text)
                    .into_iter()
                    .filter(|s| s.split_whitespace().count() >= 8)
                    .take(wanted)
                    .map(cloze_card),
            );
        }

        if cards.is_empty() {
            cards.push(Flashcard::new(
                CardKind::Concept,
                "What is this material about?".to_string(),
                truncate_chars(text.trim(), 300),
                1,
            ));
        }

        let mut seen = HashSet::new();
        cards.retain(|c| seen.insert(c.question.clone()));
        cards.truncate(MAX_CARDS);
        cards
    }
}

fn is_pronoun(term: &str) -> bool {
    let first = term.split_whitespace().next().unwrap_or(term);
    matches!(
        first,
        "This" | "That" | "These" | "Those" | "There" | "Here" | "What" | "Which" | "Today"
    )
}

/// Blank out the longest word of `sentence`.
fn cloze_card(sentence: &str) -> Flashcard {
    let answer = sentence
        .split(|c: char| !c.is_alphanumeric())
        .max_by_key(|w| w.chars().count())
        .unwrap_or_default()
        .to_string();
    let question = if answer.is_empty() {
        format!("Explain: {}", sentence)
    } else {
        format!("Fill in the blank: {}", sentence.replacen(&answer, "_____", 1))
    };
    Flashcard::new(CardKind::Concept, question, answer, 2).with_hint(truncate_chars(sentence, 40))
}

#[async_trait]
impl FlashcardGenerator for RuleBasedFlashcards {
    async fn flashcards(
        &self,
        text: &str,
        topics: &TopicSet,
        ctx: &StageContext<'_>,
    ) -> Result<Vec<Flashcard>, BackendError> {
        ctx.checkpoint()?;
        let cards = self.generate(text, topics);
        ctx.report(Stage::Flashcards, 1.0, &format!("{} cards", cards.len()));
        Ok(cards)
    }
}
