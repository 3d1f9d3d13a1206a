//! Two-clause response assembly.
//!
//! The first clause is planned from the charged seeds. The second clause is
//! planned from a fresh seed and must share no word with the first and stay
//! topically apart from it: every word with a known vector keeps its maximum
//! cosine similarity to the first clause's words below the drift threshold.
//! The clauses are joined with `". "` and closed with a period.

use std::collections::{HashMap, HashSet};

use super::grammar::{capitalize_first, is_possessive, is_terminal_word, match_casing};
use super::{Constraints, SentencePlanner};
use crate::metrics::{Metrics, compute_metrics, entropy, lowercase, perplexity, target_length};

/// Reply used when nothing at all can be planned.
pub const SILENCE: &str = "Silence echoes within void.";

/// Knobs for one response.
#[derive(Debug, Clone)]
pub struct ResponseParams {
    pub chaos_factor: f64,
    pub similarity_threshold: f64,
    pub first_len: (usize, usize),
    pub second_len: (usize, usize),
    pub char_n: usize,
}

impl Default for ResponseParams {
    fn default() -> Self {
        Self {
            chaos_factor: 0.0,
            similarity_threshold: 0.3,
            first_len: (5, 10),
            second_len: (5, 6),
            char_n: 3,
        }
    }
}

/// Metrics of the lowercased `tokens` and the target length they map to.
pub fn compute_target_length(
    planner: &SentencePlanner<'_>,
    tokens: &[String],
    range: (usize, usize),
    char_n: usize,
) -> (Metrics, usize) {
    let metrics = compute_metrics(&lowercase(tokens), planner.model(), char_n);
    let len = target_length(&metrics.values(), range.0, range.1);
    (metrics, len)
}

/// Plan the first clause from `seeds`.
pub fn build_first_phrase(
    planner: &SentencePlanner<'_>,
    seeds: &[String],
    target: usize,
    chaos_factor: f64,
    forbidden: &HashSet<String>,
) -> Vec<String> {
    let constraints = Constraints {
        forbidden: forbidden.clone(),
        admissible: None,
    };
    planner.plan_with(seeds, target, chaos_factor, &constraints)
}

/// Whether `word` may appear in a clause following `first` (lowercased).
fn drifts_from(
    planner: &SentencePlanner<'_>,
    first: &HashSet<String>,
    threshold: f64,
    word: &str,
) -> bool {
    if first.contains(word) {
        return false;
    }
    let Some(index) = planner.index() else {
        return true;
    };
    first
        .iter()
        .filter_map(|f| index.word_similarity(word, f))
        .all(|s| s < threshold)
}

/// Plan the second clause: disjoint from `first_words` and below
/// `threshold` similarity to them. Its length comes from the entropy and
/// perplexity of the first clause, mapped onto `len_range`.
pub fn build_second_phrase(
    planner: &SentencePlanner<'_>,
    first_words: &[String],
    threshold: f64,
    forbidden: &HashSet<String>,
    chaos_factor: f64,
    len_range: (usize, usize),
) -> Vec<String> {
    let first_lower = lowercase(first_words);
    let model = planner.model();
    let target = target_length(
        &[
            entropy(&first_lower),
            perplexity(&first_lower, &model.bigram_counts, &model.word_counts),
        ],
        len_range.0,
        len_range.1,
    );
    let first: HashSet<String> = first_lower.into_iter().collect();

    let ok = |w: &str| drifts_from(planner, &first, threshold, w);

    // Seed with the most frequent admissible word that may end a clause,
    // then the index vocabulary.
    let mut pool: Vec<(&String, f64)> = model.word_counts.iter().map(|(w, &c)| (w, c)).collect();
    pool.sort_by(|a, b| b.1.total_cmp(&a.1));
    let index_vocab = planner.index().map(|i| i.sorted_vocab()).unwrap_or_default();
    let seed = pool
        .into_iter()
        .map(|(w, _)| w.clone())
        .chain(index_vocab)
        .find(|w| {
            !forbidden.contains(w) && !is_possessive(w) && !is_terminal_word(w) && ok(w.as_str())
        });
    let Some(seed) = seed else {
        return Vec::new();
    };

    let mut blocked = forbidden.clone();
    blocked.extend(first.iter().cloned());
    let constraints = Constraints {
        forbidden: blocked,
        admissible: Some(Box::new(ok)),
    };
    planner.plan_with(&[seed], target, chaos_factor, &constraints)
}

/// Render tokens as a clause: first word capitalized unless it already
/// carries uppercase, every other token verbatim.
pub fn render_clause(words: &[String]) -> String {
    let mut out = String::new();
    for (i, w) in words.iter().enumerate() {
        if i == 0 {
            out.push_str(&capitalize_first(w));
        } else {
            out.push(' ');
            out.push_str(w);
        }
    }
    out
}

/// Replace each forbidden seed with its analog (casing transferred from the
/// original); forbidden seeds without an analog are dropped.
pub fn substitute_forbidden(
    seeds: &[String],
    analogs: &HashMap<String, String>,
    forbidden: &HashSet<String>,
) -> Vec<String> {
    seeds
        .iter()
        .filter_map(|s| {
            let lower = s.to_lowercase();
            if !forbidden.contains(&lower) {
                return Some(s.clone());
            }
            analogs
                .get(&lower)
                .filter(|a| !forbidden.contains(&a.to_lowercase()))
                .map(|a| match_casing(s, a))
        })
        .collect()
}

/// Full two-clause reply for `seeds`, or [`SILENCE`] when no seed exists.
pub fn respond(
    planner: &SentencePlanner<'_>,
    seeds: &[String],
    forbidden: &HashSet<String>,
    params: &ResponseParams,
) -> String {
    if seeds.is_empty() {
        return SILENCE.to_string();
    }
    let (_, target) = compute_target_length(planner, seeds, params.first_len, params.char_n);
    let first = build_first_phrase(planner, seeds, target, params.chaos_factor, forbidden);
    if first.is_empty() {
        return SILENCE.to_string();
    }
    let second = build_second_phrase(
        planner,
        &first,
        params.similarity_threshold,
        forbidden,
        params.chaos_factor,
        params.second_len,
    );
    let mut text = render_clause(&first);
    if !second.is_empty() {
        text.push_str(". ");
        text.push_str(&render_clause(&second));
    }
    text.push('.');
    text
}
