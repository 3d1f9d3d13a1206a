//! Tiny single-head self-attention model over a fixed vocabulary.
//!
//! Weights are drawn from a seeded generator, so two models built for the same
//! vocabulary are identical. Logits are deterministic unless the caller passes
//! an RNG, which turns on quantum dropout: every attention weight is rotated
//! by a random phase and replaced by the magnitude of its real part before the
//! row is renormalized.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::combiner::MemoryCombiner;

type Matrix = Vec<Vec<f64>>;

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize, scale: f64) -> Matrix {
    (0..rows)
        .map(|_| (0..cols).map(|_| rng.gen_range(-scale..=scale)).collect())
        .collect()
}

/// `x · w` for a row vector `x` of `w.len()` entries.
fn project(x: &[f64], w: &Matrix) -> Vec<f64> {
    let cols = w.first().map_or(0, Vec::len);
    let mut out = vec![0.0; cols];
    for (xi, row) in x.iter().zip(w) {
        for (o, wij) in out.iter_mut().zip(row) {
            *o += xi * wij;
        }
    }
    out
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Numerically stable softmax; an empty input yields an empty output.
pub fn softmax(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        vec![1.0 / values.len().max(1) as f64; values.len()]
    }
}

fn quantum_dropout(weights: &mut [f64], rng: &mut StdRng) {
    for w in weights.iter_mut() {
        let phase: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        *w = (*w * phase.cos()).abs();
    }
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 {
        weights.iter_mut().for_each(|w| *w /= sum);
    }
}

pub struct MiniSelfAttention {
    vocab: Vec<String>,
    index: HashMap<String, usize>,
    dim: usize,
    embed: Matrix,
    wq: Matrix,
    wk: Matrix,
    wv: Matrix,
    /// `dim × vocab` output projection; the only trained weights.
    w_out: Matrix,
    memory: Option<(Arc<dyn MemoryCombiner>, Vec<f64>)>,
}

impl std::fmt::Debug for MiniSelfAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniSelfAttention")
            .field("vocab", &self.vocab.len())
            .field("dim", &self.dim)
            .field("memory", &self.memory.as_ref().map(|(c, _)| c.name()))
            .finish()
    }
}

impl MiniSelfAttention {
    pub const DEFAULT_SEED: u64 = 0;

    pub fn new(vocab: &[String], dim: usize, seed: u64) -> Self {
        let dim = dim.max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (dim as f64).sqrt();
        let mut index = HashMap::new();
        for (i, w) in vocab.iter().enumerate() {
            index.entry(w.clone()).or_insert(i);
        }
        Self {
            embed: random_matrix(&mut rng, vocab.len(), dim, scale),
            wq: random_matrix(&mut rng, dim, dim, scale),
            wk: random_matrix(&mut rng, dim, dim, scale),
            wv: random_matrix(&mut rng, dim, dim, scale),
            w_out: random_matrix(&mut rng, dim, vocab.len(), scale),
            vocab: vocab.to_vec(),
            index,
            dim,
            memory: None,
        }
    }

    pub fn vocab(&self) -> &[String] {
        &self.vocab
    }

    /// Fold `memory` into every pooled context through `combiner`.
    pub fn set_memory(&mut self, combiner: Arc<dyn MemoryCombiner>, memory: Vec<f64>) {
        self.memory = Some((combiner, memory));
    }

    pub fn clear_memory(&mut self) {
        self.memory = None;
    }

    /// Mean-pooled attention output over the known tokens, or `None` when no
    /// token is in the vocabulary.
    fn context(&self, tokens: &[String], mut rng: Option<&mut StdRng>) -> Option<Vec<f64>> {
        let rows: Vec<&Vec<f64>> = tokens
            .iter()
            .filter_map(|t| self.index.get(t))
            .map(|&i| &self.embed[i])
            .collect();
        if rows.is_empty() {
            return None;
        }
        let q: Matrix = rows.iter().map(|x| project(x, &self.wq)).collect();
        let k: Matrix = rows.iter().map(|x| project(x, &self.wk)).collect();
        let v: Matrix = rows.iter().map(|x| project(x, &self.wv)).collect();
        let scale = (self.dim as f64).sqrt();

        let mut pooled = vec![0.0; self.dim];
        for qi in &q {
            let scores: Vec<f64> = k.iter().map(|kj| dot(qi, kj) / scale).collect();
            let mut weights = softmax(&scores);
            if let Some(rng) = rng.as_deref_mut() {
                quantum_dropout(&mut weights, rng);
            }
            for (w, vj) in weights.iter().zip(&v) {
                for (p, x) in pooled.iter_mut().zip(vj) {
                    *p += w * x;
                }
            }
        }
        let n = q.len() as f64;
        pooled.iter_mut().for_each(|p| *p /= n);

        if let Some((combiner, memory)) = &self.memory {
            pooled = combiner.combine(&pooled, memory);
        }
        Some(pooled)
    }

    fn raw_logits(&self, tokens: &[String], rng: Option<&mut StdRng>) -> Option<(Vec<f64>, Vec<f64>)> {
        let ctx = self.context(tokens, rng)?;
        let logits = project(&ctx, &self.w_out);
        Some((ctx, logits))
    }

    /// One logit per vocabulary entry, in vocabulary order. All zero when no
    /// token is known.
    pub fn logits(&self, tokens: &[String], rng: Option<&mut StdRng>) -> Vec<(String, f64)> {
        let values = self
            .raw_logits(tokens, rng)
            .map(|(_, l)| l)
            .unwrap_or_else(|| vec![0.0; self.vocab.len()]);
        self.vocab.iter().cloned().zip(values).collect()
    }

    /// One cross-entropy gradient step on the output projection towards
    /// `target`. Returns false when nothing could be trained.
    pub fn train_step(&mut self, context: &[String], target: &str, lr: f64) -> bool {
        let Some(&t) = self.index.get(target) else {
            return false;
        };
        let Some((ctx, logits)) = self.raw_logits(context, None) else {
            return false;
        };
        let probs = softmax(&logits);
        for (i, row) in self.w_out.iter_mut().enumerate() {
            let x = ctx.get(i).copied().unwrap_or(0.0);
            for (j, w) in row.iter_mut().enumerate() {
                let y = if j == t { 1.0 } else { 0.0 };
                *w -= lr * x * (probs[j] - y);
            }
        }
        true
    }
}
