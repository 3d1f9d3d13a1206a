//! Tokenization and n-gram metrics.
//!
//! Entropy, add-one-smoothed bigram/trigram perplexity, and the "resonance"
//! family (mean raw counts along the observed path). [`compute_metrics`]
//! bundles them for chaos control, target lengths and the retraining monitor.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::sequence::{Counts, SENTINEL, SequenceModel, Table, TrigramKey, char_ngrams};

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w+\b").unwrap());

/// Split text on word boundaries, preserving case.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Lowercased copy of `tokens`, for statistics only.
pub fn lowercase(tokens: &[String]) -> Vec<String> {
    tokens.iter().map(|t| t.to_lowercase()).collect()
}

/// Shannon entropy (bits) of the token distribution; 0 for empty input.
pub fn entropy(tokens: &[String]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in tokens {
        *counts.entry(t.as_str()).or_default() += 1;
    }
    let total = tokens.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum::<f64>()
        .max(0.0)
}

fn vocab(word_counts: &Counts) -> f64 {
    word_counts.len().max(1) as f64
}

/// Add-one-smoothed bigram perplexity; 0 for empty input, otherwise >= 1.
pub fn perplexity(tokens: &[String], bigrams: &Table<String>, word_counts: &Counts) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let v = vocab(word_counts);
    let mut nll = 0.0;
    let mut prev = SENTINEL;
    for t in tokens {
        let row = bigrams.get(prev);
        let num = row.map(|r| r.count(t)).unwrap_or(0.0) + 1.0;
        // The sentinel has no unigram count; its row total stands in.
        let seen = word_counts
            .count(prev)
            .max(row.map(Counts::total).unwrap_or(0.0));
        nll -= (num / (seen + v)).ln();
        prev = t.as_str();
    }
    (nll / tokens.len() as f64).exp()
}

/// Add-one-smoothed trigram perplexity, normalized by the context's total
/// continuations plus the vocabulary size.
pub fn trigram_perplexity(
    tokens: &[String],
    trigrams: &Table<TrigramKey>,
    word_counts: &Counts,
) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let v = vocab(word_counts);
    let mut nll = 0.0;
    let (mut prev2, mut prev1) = (SENTINEL, SENTINEL);
    for t in tokens {
        let row = trigrams.get(&TrigramKey::new(prev2, prev1));
        let num = row.map(|r| r.count(t)).unwrap_or(0.0) + 1.0;
        let den = row.map(Counts::total).unwrap_or(0.0) + v;
        nll -= (num / den).ln();
        prev2 = prev1;
        prev1 = t.as_str();
    }
    (nll / tokens.len() as f64).exp()
}

/// Mean raw bigram count along the path.
pub fn resonance(tokens: &[String], bigrams: &Table<String>) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let mut prev = SENTINEL;
    let mut total = 0.0;
    for t in tokens {
        total += bigrams.get(prev).map(|row| row.count(t)).unwrap_or(0.0);
        prev = t.as_str();
    }
    total / tokens.len() as f64
}

/// Mean raw trigram count along the path.
pub fn trigram_resonance(tokens: &[String], trigrams: &Table<TrigramKey>) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let (mut prev2, mut prev1) = (SENTINEL, SENTINEL);
    let mut total = 0.0;
    for t in tokens {
        total += trigrams
            .get(&TrigramKey::new(prev2, prev1))
            .map(|row| row.count(t))
            .unwrap_or(0.0);
        prev2 = prev1;
        prev1 = t.as_str();
    }
    total / tokens.len() as f64
}

/// Mean count of every width-`n` character window across `tokens`.
pub fn char_ngram_resonance(tokens: &[String], counts: &Counts, n: usize) -> f64 {
    let grams: Vec<String> = tokens.iter().flat_map(|t| char_ngrams(t, n)).collect();
    if grams.is_empty() {
        return 0.0;
    }
    grams.iter().map(|g| counts.count(g)).sum::<f64>() / grams.len() as f64
}

/// All metrics for one token sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub entropy: f64,
    pub perplexity: f64,
    pub resonance: f64,
    pub trigram_perplexity: f64,
    pub trigram_resonance: f64,
    pub char_ngram_resonance: f64,
}

impl Metrics {
    /// Metric values in a fixed order.
    pub fn values(&self) -> [f64; 6] {
        [
            self.entropy,
            self.perplexity,
            self.resonance,
            self.trigram_perplexity,
            self.trigram_resonance,
            self.char_ngram_resonance,
        ]
    }
}

/// Compute every metric of `tokens` against `model`.
pub fn compute_metrics(tokens: &[String], model: &SequenceModel, char_n: usize) -> Metrics {
    Metrics {
        entropy: entropy(tokens),
        perplexity: perplexity(tokens, &model.bigram_counts, &model.word_counts),
        resonance: resonance(tokens, &model.bigram_counts),
        trigram_perplexity: trigram_perplexity(tokens, &model.trigram_counts, &model.word_counts),
        trigram_resonance: trigram_resonance(tokens, &model.trigram_counts),
        char_ngram_resonance: char_ngram_resonance(tokens, &model.char_ngram_counts, char_n),
    }
}

/// Map a set of metric values onto `[min_len, max_len]`.
///
/// `min_len + floor(sum) mod (max_len - min_len + 1)` over the finite values;
/// a negative or non-finite sum gives `min_len`.
pub fn target_length(values: &[f64], min_len: usize, max_len: usize) -> usize {
    let (lo, hi) = if min_len <= max_len {
        (min_len, max_len)
    } else {
        (max_len, min_len)
    };
    let sum: f64 = values.iter().filter(|v| v.is_finite()).sum();
    if !sum.is_finite() || sum < 0.0 {
        return lo;
    }
    let span = (hi - lo + 1) as u128;
    lo + ((sum.floor() as u128) % span) as usize
}

/// [`target_length`] over every field of `metrics`.
pub fn target_length_from_metrics(metrics: &Metrics, min_len: usize, max_len: usize) -> usize {
    target_length(&metrics.values(), min_len, max_len)
}
