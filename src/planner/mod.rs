//! Constrained token-by-token sentence planning.
//!
//! The planner seeds a sentence, then repeatedly extends it with the best
//! admissible continuation until the target length is reached or no
//! candidate passes the constraints. Candidates come from four sources tried
//! in order: the trigram context, the bigram context, the prediction index
//! (analogs and positive-similarity neighbors of the last token), then the
//! unigram table. Within a source each candidate scores
//! `count + chaos_factor × inverse_frequency`; ties keep the order in which
//! the continuation was first registered.
//!
//! Constraints on every accepted token:
//! 1. no case-insensitive repeat of a token already in the sentence,
//! 2. not a forbidden word, and admissible under any extra predicate,
//! 3. never three single-character tokens in a row,
//! 4. at the final position: not a second single-character token in a row,
//!    not a possessive pronoun, not a preposition or wh-word.
//!
//! Seeds obey the same rules: a seed that would close a run of three
//! single-character tokens is skipped. A dead end is not an error: the
//! planner returns what it has built, with any dangling tail (possessive,
//! preposition, single-letter pair) trimmed, seeds included.

pub mod grammar;
pub mod phrase;

use std::collections::HashSet;

use crate::predict::PredictionIndex;
use crate::sequence::{Counts, SENTINEL, SequenceModel, TrigramKey};

use grammar::{is_possessive, is_single_char, is_terminal_word};

/// Neighbors pulled from the prediction index per step.
const INDEX_FANOUT: usize = 5;

/// Extra per-call constraints.
#[derive(Default)]
pub struct Constraints<'a> {
    /// Lowercased words that must not be generated.
    pub forbidden: HashSet<String>,
    /// Additional predicate on lowercased candidates.
    pub admissible: Option<Box<dyn Fn(&str) -> bool + 'a>>,
}

impl<'a> Constraints<'a> {
    pub fn forbid<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            forbidden: words.into_iter().map(|w| w.as_ref().to_lowercase()).collect(),
            admissible: None,
        }
    }

    pub fn with_predicate(mut self, pred: impl Fn(&str) -> bool + 'a) -> Self {
        self.admissible = Some(Box::new(pred));
        self
    }

    fn allows(&self, lower: &str) -> bool {
        !self.forbidden.contains(lower) && self.admissible.as_ref().is_none_or(|p| p(lower))
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Trigram,
    Bigram,
    Index,
    Unigram,
}

impl Source {
    const ORDER: [Source; 4] = [Source::Trigram, Source::Bigram, Source::Index, Source::Unigram];
}

/// Plans sentences against a sequence model and an optional prediction index.
pub struct SentencePlanner<'a> {
    model: &'a SequenceModel,
    index: Option<&'a PredictionIndex>,
}

fn ranked(mut scored: Vec<(String, f64)>) -> Vec<String> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().map(|(w, _)| w).collect()
}

fn score_row(row: &Counts, inv: Option<&Counts>, chaos: f64) -> Vec<(String, f64)> {
    row.iter()
        .map(|(w, &c)| {
            let i = inv.map(|t| t.count(w)).unwrap_or(0.0);
            (w.clone(), c + chaos * i)
        })
        .collect()
}

impl<'a> SentencePlanner<'a> {
    pub fn new(model: &'a SequenceModel, index: Option<&'a PredictionIndex>) -> Self {
        Self { model, index }
    }

    pub fn model(&self) -> &SequenceModel {
        self.model
    }

    pub fn index(&self) -> Option<&PredictionIndex> {
        self.index
    }

    fn trigram_source(&self, prev2: &str, prev1: &str, chaos: f64) -> Vec<String> {
        let exact = TrigramKey::new(prev2, prev1);
        let key = if self.model.trigram_counts.contains_key(&exact) {
            exact
        } else {
            exact.lowercased()
        };
        match self.model.trigram_counts.get(&key) {
            Some(row) => ranked(score_row(row, self.model.trigram_inv.get(&key), chaos)),
            None => Vec::new(),
        }
    }

    fn bigram_source(&self, prev1: &str, chaos: f64) -> Vec<String> {
        let lower = prev1.to_lowercase();
        let key = if self.model.bigram_counts.contains_key(prev1) {
            prev1
        } else {
            lower.as_str()
        };
        match self.model.bigram_counts.get(key) {
            Some(row) => ranked(score_row(row, self.model.bigram_inv.get(key), chaos)),
            None => Vec::new(),
        }
    }

    fn index_source(&self, prev1: &str, chaos: f64) -> Vec<String> {
        let Some(index) = self.index else {
            return Vec::new();
        };
        if prev1 == SENTINEL {
            return Vec::new();
        }
        let lower = prev1.to_lowercase();
        let mut scored: Vec<(String, f64)> = Vec::new();
        if let Some(analog) = index.lookup_analogs(&lower) {
            scored.push((analog, 1.0));
        }
        scored.extend(index.similar(&lower, INDEX_FANOUT));
        let inv = &self.model.word_inv;
        ranked(
            scored
                .into_iter()
                .map(|(w, s)| {
                    let bonus = chaos * inv.count(&w);
                    (w, s + bonus)
                })
                .collect(),
        )
    }

    fn unigram_source(&self, chaos: f64) -> Vec<String> {
        ranked(score_row(&self.model.word_counts, Some(&self.model.word_inv), chaos))
    }

    fn accepts(
        &self,
        seq: &[String],
        used: &HashSet<String>,
        cand: &str,
        is_final: bool,
        constraints: &Constraints<'_>,
    ) -> bool {
        let lower = cand.to_lowercase();
        if cand.is_empty() || cand == SENTINEL || used.contains(&lower) || !constraints.allows(&lower) {
            return false;
        }
        if closes_single_run(seq, cand) {
            return false;
        }
        if is_final {
            if is_single_char(cand) && seq.last().is_some_and(|p| is_single_char(p)) {
                return false;
            }
            if is_possessive(cand) || is_terminal_word(cand) {
                return false;
            }
        }
        true
    }

    fn next_token(
        &self,
        seq: &[String],
        used: &HashSet<String>,
        is_final: bool,
        chaos: f64,
        constraints: &Constraints<'_>,
    ) -> Option<String> {
        let n = seq.len();
        let prev1 = if n >= 1 { seq[n - 1].as_str() } else { SENTINEL };
        let prev2 = if n >= 2 { seq[n - 2].as_str() } else { SENTINEL };

        // The empty seed starts straight from the unigram table.
        let order: &[Source] = if n == 0 { &[Source::Unigram] } else { &Source::ORDER };
        order.iter().find_map(|source| {
            let ranked = match source {
                Source::Trigram => self.trigram_source(prev2, prev1, chaos),
                Source::Bigram => self.bigram_source(prev1, chaos),
                Source::Index => self.index_source(prev1, chaos),
                Source::Unigram => self.unigram_source(chaos),
            };
            ranked
                .into_iter()
                .find(|c| self.accepts(seq, used, c, is_final, constraints))
        })
    }

    /// Plan a sentence of up to `target` tokens from `seed`.
    pub fn plan(&self, seed: &[String], target: usize, chaos_factor: f64) -> Vec<String> {
        self.plan_with(seed, target, chaos_factor, &Constraints::default())
    }

    /// [`plan`](Self::plan) under extra constraints.
    pub fn plan_with(
        &self,
        seed: &[String],
        target: usize,
        chaos_factor: f64,
        constraints: &Constraints<'_>,
    ) -> Vec<String> {
        let mut used: HashSet<String> = HashSet::new();
        let mut seq: Vec<String> = Vec::with_capacity(target);
        for tok in seed {
            if seq.len() == target {
                break;
            }
            if tok.is_empty() || used.contains(&tok.to_lowercase()) || closes_single_run(&seq, tok) {
                continue;
            }
            used.insert(tok.to_lowercase());
            seq.push(tok.clone());
        }

        while seq.len() < target {
            let is_final = seq.len() + 1 == target;
            match self.next_token(&seq, &used, is_final, chaos_factor, constraints) {
                Some(tok) => {
                    used.insert(tok.to_lowercase());
                    seq.push(tok);
                }
                None => {
                    tracing::trace!(built = seq.len(), target, "planner dead end");
                    break;
                }
            }
        }
        trim_tail(&mut seq);
        seq
    }
}

/// Whether appending `tok` would make three single-character tokens in a row.
fn closes_single_run(seq: &[String], tok: &str) -> bool {
    let n = seq.len();
    is_single_char(tok) && n >= 2 && is_single_char(&seq[n - 1]) && is_single_char(&seq[n - 2])
}

/// Drop tokens, seeds included, that would leave the sentence ending badly.
fn trim_tail(seq: &mut Vec<String>) {
    while let Some(last) = seq.last() {
        let n = seq.len();
        let dangling = is_possessive(last)
            || is_terminal_word(last)
            || (n >= 2 && is_single_char(last) && is_single_char(&seq[n - 2]));
        if !dangling {
            break;
        }
        seq.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{Table, analyze_sequences};

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn counts(pairs: &[(&str, f64)]) -> Counts {
        pairs.iter().map(|(w, c)| (w.to_string(), *c)).collect()
    }

    fn model_with(trigrams: &[((&str, &str), &[(&str, f64)])], words: &[(&str, f64)]) -> SequenceModel {
        let mut model = SequenceModel::new();
        model.trigram_counts = trigrams
            .iter()
            .map(|((a, b), row)| (TrigramKey::new(*a, *b), counts(row)))
            .collect::<Table<TrigramKey>>();
        model.word_counts = counts(words);
        model
    }

    #[test]
    fn follows_trigram_chain_preserving_case() {
        let model = model_with(
            &[
                (("hello", "WORLD"), &[("foo", 2.0)]),
                (("WORLD", "foo"), &[("bar", 3.0)]),
                (("foo", "bar"), &[("baz", 4.0)]),
            ],
            &[("foo", 2.0), ("bar", 3.0), ("baz", 4.0)],
        );
        let planner = SentencePlanner::new(&model, None);
        let out = planner.plan(&toks(&["hello", "WORLD"]), 5, 0.0);
        assert_eq!(out, toks(&["hello", "WORLD", "foo", "bar", "baz"]));
    }

    #[test]
    fn chaos_factor_flips_first_choice() {
        let mut model = SequenceModel::new();
        analyze_sequences(&mut model, &toks(&["foo", "bar", "foo"]), 3, 1.0, None);
        let planner = SentencePlanner::new(&model, None);

        let calm = planner.plan(&[], 2, 0.0);
        assert_eq!(calm[0], "foo");

        let wild = planner.plan(&[], 2, 1000.0);
        assert_eq!(wild, toks(&["bar", "foo"]));
        let unique: HashSet<_> = wild.iter().map(|w| w.to_lowercase()).collect();
        assert_eq!(unique.len(), wild.len());
    }

    #[test]
    fn no_three_single_letters_in_a_row() {
        let model = model_with(
            &[(("a", "b"), &[("c", 5.0), ("word", 4.0)])],
            &[("a", 5.0), ("b", 5.0), ("c", 5.0), ("word", 1.0)],
        );
        let planner = SentencePlanner::new(&model, None);
        assert_eq!(planner.plan(&toks(&["a", "b"]), 3, 0.0), toks(&["a", "b", "word"]));
    }

    #[test]
    fn never_ends_on_two_single_letters() {
        let model = model_with(
            &[((SENTINEL, "a"), &[("b", 5.0), ("word", 4.0)])],
            &[("a", 5.0), ("b", 5.0), ("word", 1.0)],
        );
        let planner = SentencePlanner::new(&model, None);
        assert_eq!(planner.plan(&toks(&["a"]), 2, 0.0), toks(&["a", "word"]));
    }

    #[test]
    fn single_letter_may_end_after_longer_word() {
        let model = model_with(&[((SENTINEL, "word"), &[("a", 5.0)])], &[("word", 5.0), ("a", 5.0)]);
        let planner = SentencePlanner::new(&model, None);
        assert_eq!(planner.plan(&toks(&["word"]), 2, 0.0), toks(&["word", "a"]));
    }

    #[test]
    fn skips_possessive_at_final_position_only() {
        let model = model_with(
            &[
                ((SENTINEL, "saw"), &[("my", 9.0), ("dog", 1.0)]),
                (("saw", "my"), &[("dog", 3.0)]),
            ],
            &[("saw", 1.0)],
        );
        let planner = SentencePlanner::new(&model, None);
        assert_eq!(planner.plan(&toks(&["saw"]), 2, 0.0), toks(&["saw", "dog"]));
        assert_eq!(planner.plan(&toks(&["saw"]), 3, 0.0), toks(&["saw", "my", "dog"]));
    }

    #[test]
    fn lowercased_context_matches() {
        let mut model = SequenceModel::new();
        analyze_sequences(&mut model, &toks(&["nasa", "launch", "window"]), 0, 1.0, None);
        let planner = SentencePlanner::new(&model, None);
        // ("<s>", "NASA") is unseen verbatim but matches once lowercased.
        let out = planner.plan(&toks(&["NASA"]), 3, 0.0);
        assert_eq!(out, toks(&["NASA", "launch", "window"]));
    }

    #[test]
    fn dead_end_returns_partial_sentence() {
        let model = model_with(&[], &[("only", 1.0)]);
        let planner = SentencePlanner::new(&model, None);
        assert_eq!(planner.plan(&toks(&["only"]), 6, 0.0), toks(&["only"]));
        assert!(SentencePlanner::new(&SequenceModel::new(), None).plan(&[], 4, 0.0).is_empty());
    }

    #[test]
    fn forbidden_and_predicate_are_honored() {
        let model = model_with(&[], &[("alpha", 5.0), ("beta", 4.0), ("gamma", 3.0)]);
        let planner = SentencePlanner::new(&model, None);
        let c = Constraints::forbid(["ALPHA"]).with_predicate(|w| w != "beta");
        assert_eq!(planner.plan_with(&[], 3, 0.0, &c), toks(&["gamma"]));
    }

    #[test]
    fn seed_is_deduplicated_and_truncated() {
        let model = SequenceModel::new();
        let planner = SentencePlanner::new(&model, None);
        let out = planner.plan(&toks(&["Echo", "echo", "two", "three"]), 2, 0.0);
        assert_eq!(out, toks(&["Echo", "two"]));
    }

    #[test]
    fn index_neighbors_extend_when_counts_run_out() {
        use crate::predict::Vectors;
        use std::collections::HashMap;

        let model = model_with(&[], &[]);
        let mut vectors = Vectors::new();
        vectors.insert("qux".into(), HashMap::from([("b".to_string(), 1.0)]));
        vectors.insert("quux".into(), HashMap::from([("b".to_string(), 0.8)]));
        vectors.insert("foo".into(), HashMap::from([("a".to_string(), 1.0)]));
        let index = PredictionIndex::from_vectors(vectors);
        let planner = SentencePlanner::new(&model, Some(&index));
        assert_eq!(planner.plan(&toks(&["qux"]), 3, 0.0), toks(&["qux", "quux"]));
    }

    #[test]
    fn dangling_seed_is_trimmed() {
        let model = SequenceModel::new();
        let planner = SentencePlanner::new(&model, None);
        assert_eq!(planner.plan(&toks(&["saw", "my"]), 5, 0.0), toks(&["saw"]));
        assert_eq!(planner.plan(&toks(&["look", "at"]), 2, 0.0), toks(&["look"]));
        assert!(planner.plan(&toks(&["their"]), 3, 0.0).is_empty());
    }

    #[test]
    fn single_letter_seeds_never_run_three_long() {
        let model = model_with(&[], &[("word", 1.0)]);
        let planner = SentencePlanner::new(&model, None);
        let out = planner.plan(&toks(&["x", "y", "z"]), 4, 0.0);
        assert_eq!(out, toks(&["x", "y", "word"]));

        let bare = SequenceModel::new();
        let out = SentencePlanner::new(&bare, None).plan(&toks(&["x", "y", "z"]), 3, 0.0);
        assert_eq!(out, toks(&["x"]));
    }
}
