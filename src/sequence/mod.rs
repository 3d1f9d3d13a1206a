//! Sequence model: weighted n-gram frequency tables.
//!
//! Unigram, bigram, trigram and fixed-width character n-gram counts, each
//! paired with an inverse-frequency table (`1 / count`) that the planner uses
//! as its novelty term. Every increment rewrites the matching inverse entry in
//! the same step, so the two tables never disagree.

pub mod codec;
pub mod counts;
pub mod train;

use std::hash::Hash;

use serde::{Deserialize, Serialize};

pub use counts::{Counts, OrderedMap};

/// Start-of-sequence sentinel used for the first one or two look-back slots.
pub const SENTINEL: &str = "<s>";

/// Context table: key → continuation counts.
pub type Table<K> = OrderedMap<K, Counts>;

/// Ordered pair of the two most recent tokens (the trigram context).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrigramKey {
    pub first: String,
    pub second: String,
}

impl TrigramKey {
    pub fn new(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self {
            first: first.into(),
            second: second.into(),
        }
    }

    /// Both halves lowercased.
    pub fn lowercased(&self) -> Self {
        Self::new(self.first.to_lowercase(), self.second.to_lowercase())
    }
}

/// Mutable n-gram statistics shared by the planner, metrics and trainers.
///
/// Only the count tables are persisted; the inverse tables are rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceModel {
    #[serde(default)]
    pub word_counts: Counts,
    #[serde(default)]
    pub bigram_counts: Table<String>,
    #[serde(default)]
    pub trigram_counts: Table<TrigramKey>,
    #[serde(default)]
    pub char_ngram_counts: Counts,

    #[serde(skip)]
    pub word_inv: Counts,
    #[serde(skip)]
    pub bigram_inv: Table<String>,
    #[serde(skip)]
    pub trigram_inv: Table<TrigramKey>,
    #[serde(skip)]
    pub char_ngram_inv: Counts,
}

/// Increment `counts[key]` by `by` and store `1 / new` in `inv[key]`.
fn bump<K: Eq + Hash + Clone>(
    counts: &mut OrderedMap<K, f64>,
    inv: &mut OrderedMap<K, f64>,
    key: K,
    by: f64,
) {
    let new = counts.increment(key.clone(), by);
    inv.insert(key, inverse(new));
}

fn bump_nested<C: Eq + Hash + Clone>(
    counts: &mut Table<C>,
    inv: &mut Table<C>,
    context: &C,
    token: &str,
    by: f64,
) {
    let row = counts.get_or_insert_with(context.clone(), Counts::new);
    let new = row.increment(token.to_string(), by);
    inv.get_or_insert_with(context.clone(), Counts::new)
        .insert(token.to_string(), inverse(new));
}

fn inverse(count: f64) -> f64 {
    if count > 0.0 { 1.0 / count } else { 0.0 }
}

/// All character windows of width `n` in `token` (none when shorter than `n`).
pub fn char_ngrams(token: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = token.chars().collect();
    if n == 0 || chars.len() < n {
        return Vec::new();
    }
    chars.windows(n).map(|w| w.iter().collect()).collect()
}

/// Fold `tokens` into `model`.
///
/// Only the trailing `window` tokens are considered when a window is given.
/// Both look-back slots start at [`SENTINEL`]; `char_n == 0` disables the
/// character table. `weight` is assumed positive: callers reject non-positive
/// weights before training.
pub fn analyze_sequences(
    model: &mut SequenceModel,
    tokens: &[String],
    char_n: usize,
    weight: f64,
    window: Option<usize>,
) {
    let start = match window {
        Some(w) if w < tokens.len() => tokens.len() - w,
        _ => 0,
    };
    let mut prev2 = SENTINEL.to_string();
    let mut prev1 = SENTINEL.to_string();

    for token in &tokens[start..] {
        bump(&mut model.word_counts, &mut model.word_inv, token.clone(), weight);
        bump_nested(
            &mut model.bigram_counts,
            &mut model.bigram_inv,
            &prev1,
            token,
            weight,
        );
        let context = TrigramKey::new(prev2.as_str(), prev1.as_str());
        bump_nested(
            &mut model.trigram_counts,
            &mut model.trigram_inv,
            &context,
            token,
            weight,
        );
        for gram in char_ngrams(token, char_n) {
            bump(
                &mut model.char_ngram_counts,
                &mut model.char_ngram_inv,
                gram,
                weight,
            );
        }
        prev2 = std::mem::replace(&mut prev1, token.clone());
    }
}

impl SequenceModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct tokens seen.
    pub fn vocab_size(&self) -> usize {
        self.word_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.word_counts.is_empty()
    }

    /// Drop every count (used before a full retrain).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Recompute all inverse tables from the counts.
    pub fn rebuild_inverses(&mut self) {
        self.word_inv = invert(&self.word_counts);
        self.char_ngram_inv = invert(&self.char_ngram_counts);
        self.bigram_inv = self
            .bigram_counts
            .iter()
            .map(|(k, row)| (k.clone(), invert(row)))
            .collect();
        self.trigram_inv = self
            .trigram_counts
            .iter()
            .map(|(k, row)| (k.clone(), invert(row)))
            .collect();
    }

    /// Add every count of `other` into `self`, refreshing the touched inverses.
    pub fn merge(&mut self, other: &SequenceModel) {
        for (k, &c) in other.word_counts.iter() {
            bump(&mut self.word_counts, &mut self.word_inv, k.clone(), c);
        }
        for (ctx, row) in other.bigram_counts.iter() {
            for (tok, &c) in row.iter() {
                bump_nested(&mut self.bigram_counts, &mut self.bigram_inv, ctx, tok, c);
            }
        }
        for (ctx, row) in other.trigram_counts.iter() {
            for (tok, &c) in row.iter() {
                bump_nested(&mut self.trigram_counts, &mut self.trigram_inv, ctx, tok, c);
            }
        }
        for (k, &c) in other.char_ngram_counts.iter() {
            bump(
                &mut self.char_ngram_counts,
                &mut self.char_ngram_inv,
                k.clone(),
                c,
            );
        }
    }
}

fn invert(counts: &Counts) -> Counts {
    counts.iter().map(|(k, &c)| (k.clone(), inverse(c))).collect()
}
