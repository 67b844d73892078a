//! Small text helpers shared by the local stages.

use super::embed::is_stopword;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn paragraph_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t\r]*\n").unwrap())
}

/// Paragraphs separated by blank lines, trimmed, longer than `min_chars`.
pub fn paragraphs(text: &str, min_chars: usize) -> Vec<String> {
    paragraph_break()
        .split(text)
        .map(str::trim)
        .filter(|p| p.chars().count() > min_chars)
        .map(str::to_string)
        .collect()
}

/// Sentences ending in `.`, `!` or `?` followed by whitespace or end of
/// text. A trailing fragment without a terminator counts as a sentence.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = match chars.peek() {
                Some((_, next)) => next.is_whitespace(),
                None => true,
            };
            if at_boundary {
                let end = i + c.len_utf8();
                let s = text[start..end].trim();
                if !s.is_empty() {
                    out.push(s);
                }
                start = end;
            }
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Cut `s` to at most `max` chars, ending with `...` when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", keep.trim_end())
}

/// Non-stopwords of at least `min_len` letters seen more than `min_count`
/// times, most frequent first. Ties break alphabetically.
pub fn frequent_words(text: &str, min_len: usize, min_count: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in text.split(|c: char| !c.is_alphabetic()) {
        if word.chars().count() < min_len {
            continue;
        }
        let word = word.to_lowercase();
        if is_stopword(&word) {
            continue;
        }
        *counts.entry(word).or_default() += 1;
    }
    let mut words: Vec<(String, usize)> = counts
        .into_iter()
        .filter(|(_, n)| *n > min_count)
        .collect();
    words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    words
}

pub fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
