//! Prediction index: co-occurrence graph, sparse neighbor vectors, analog
//! lookup and the per-vocabulary self-attention cache.
//!
//! The graph counts every unordered pair of tokens that share a line
//! (symmetric, no positional decay). Each token's vector is its L1-normalized
//! neighbor distribution and is recomputed whenever that token's neighbor set
//! changes, so `vectors` always derives from `graph`.

pub mod attention;
pub mod cache;
pub mod combiner;
pub mod fuzzy;

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::metrics::{lowercase, tokenize};

use attention::MiniSelfAttention;
use cache::LruCache;
use combiner::{CombinerRegistry, MemoryCombiner};

pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Neighbor counts per token.
pub type Graph = HashMap<String, HashMap<String, u64>>;
/// Sparse embedding per token.
pub type Vectors = HashMap<String, HashMap<String, f64>>;

/// Index shared between turns and background tasks.
pub type SharedIndex = Arc<Mutex<PredictionIndex>>;

/// Lock a shared index. A poisoned lock is logged and recovered; the index
/// holds no invariant a panicking reader could break.
pub fn lock_index(index: &Mutex<PredictionIndex>) -> MutexGuard<'_, PredictionIndex> {
    index.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("prediction index lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Minimum string similarity for an embedding neighbor to count as an analog.
pub const ANALOG_RATIO: f64 = 0.95;
/// Cutoff for fuzzy matching of out-of-vocabulary words.
pub const FUZZY_CUTOFF: f64 = 0.6;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    graph: Graph,
}

/// Where the index reads and writes its files; all optional.
#[derive(Debug, Clone, Default)]
pub struct IndexSources {
    pub corpus_dir: Option<PathBuf>,
    pub snapshot: Option<PathBuf>,
    pub synonyms: Option<PathBuf>,
}

pub struct PredictionIndex {
    sources: IndexSources,
    graph: Graph,
    vectors: Vectors,
    synonyms: HashMap<String, String>,
    built: bool,
    dirty: bool,
    attention: LruCache<u64, MiniSelfAttention>,
    attention_dim: usize,
    combiner: Option<Arc<dyn MemoryCombiner>>,
    memory: Option<Vec<f64>>,
}

impl std::fmt::Debug for PredictionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionIndex")
            .field("vocab", &self.graph.len())
            .field("synonyms", &self.synonyms.len())
            .field("built", &self.built)
            .field("attention_models", &self.attention.len())
            .finish()
    }
}

/// Add one co-occurrence for every unordered pair in `words`; returns the
/// tokens whose neighbor sets changed.
fn fold_pairs(graph: &mut Graph, words: &[String]) -> HashSet<String> {
    let mut touched = HashSet::new();
    for (i, word) in words.iter().enumerate() {
        for other in &words[i + 1..] {
            if word.is_empty() || other.is_empty() {
                continue;
            }
            *graph
                .entry(word.clone())
                .or_default()
                .entry(other.clone())
                .or_default() += 1;
            *graph
                .entry(other.clone())
                .or_default()
                .entry(word.clone())
                .or_default() += 1;
            touched.insert(word.clone());
            touched.insert(other.clone());
        }
    }
    touched
}

fn normalize(neighbors: &HashMap<String, u64>) -> HashMap<String, f64> {
    let total = neighbors.values().sum::<u64>().max(1) as f64;
    neighbors
        .iter()
        .map(|(n, &c)| (n.clone(), c as f64 / total))
        .collect()
}

/// Derive every vector from `graph`.
pub fn build_vectors(graph: &Graph) -> Vectors {
    graph
        .iter()
        .map(|(w, neighbors)| (w.clone(), normalize(neighbors)))
        .collect()
}

fn norm(v: &HashMap<String, f64>) -> f64 {
    v.values().map(|x| x * x).sum::<f64>().sqrt()
}

/// Cosine similarity of two sparse vectors; 0 when either has zero norm.
pub fn sparse_cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let (na, nb) = (norm(a), norm(b));
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .iter()
        .filter_map(|(k, x)| large.get(k).map(|y| x * y))
        .sum();
    dot / (na * nb)
}

/// Stable key for a vocabulary: hash of its sorted, deduplicated entries.
pub fn vocab_key(vocab: &[String]) -> u64 {
    let mut sorted: Vec<&String> = vocab.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut hasher = DefaultHasher::new();
    sorted.hash(&mut hasher);
    hasher.finish()
}

fn canonical_vocab(vocab: &[String]) -> Vec<String> {
    let mut sorted = vocab.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

fn scan_file(path: &Path) -> IndexResult<Graph> {
    let text = std::fs::read_to_string(path).map_err(|e| IndexError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut graph = Graph::new();
    for line in text.lines() {
        fold_pairs(&mut graph, &lowercase(&tokenize(line)));
    }
    Ok(graph)
}

fn merge_graph(into: &mut Graph, from: Graph) {
    for (w, neighbors) in from {
        let row = into.entry(w).or_default();
        for (n, c) in neighbors {
            *row.entry(n).or_default() += c;
        }
    }
}

/// The n-gram prediction (if any) followed by the logit vocabulary in
/// descending logit order, without duplicates.
pub fn combine_predictions(ngram_word: &str, logits: &[(String, f64)]) -> Vec<String> {
    let mut ordered: Vec<&(String, f64)> = logits.iter().collect();
    ordered.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut out: Vec<String> = Vec::with_capacity(logits.len() + 1);
    if !ngram_word.is_empty() {
        out.push(ngram_word.to_string());
    }
    for (w, _) in ordered {
        if !out.iter().any(|o| o == w) {
            out.push(w.clone());
        }
    }
    out
}

impl PredictionIndex {
    pub fn new(sources: IndexSources) -> Self {
        Self {
            sources,
            graph: Graph::new(),
            vectors: Vectors::new(),
            synonyms: HashMap::new(),
            built: false,
            dirty: false,
            attention: LruCache::new(8),
            attention_dim: 16,
            combiner: None,
            memory: None,
        }
    }

    /// An index with no backing files.
    pub fn in_memory() -> Self {
        Self::new(IndexSources::default())
    }

    /// An already-built index over `graph`.
    pub fn from_graph(graph: Graph) -> Self {
        let mut index = Self::in_memory();
        index.vectors = build_vectors(&graph);
        index.graph = graph;
        index.built = true;
        index
    }

    /// An already-built index whose vectors are given directly. The graph is
    /// left empty, so later updates only touch their own tokens.
    pub fn from_vectors(vectors: Vectors) -> Self {
        let mut index = Self::in_memory();
        index.vectors = vectors;
        index.built = true;
        index
    }

    /// Attention cache capacity and embedding width.
    pub fn with_attention(mut self, capacity: usize, dim: usize) -> Self {
        self.attention = LruCache::new(capacity);
        self.attention_dim = dim.max(1);
        self
    }

    /// Fold memory into attention through the combiner registered as `name`.
    pub fn with_combiner(mut self, registry: &CombinerRegistry, name: &str) -> IndexResult<Self> {
        self.combiner = Some(registry.get(name)?);
        Ok(self)
    }

    pub fn set_synonyms(&mut self, synonyms: HashMap<String, String>) {
        self.synonyms = synonyms;
    }

    /// Memory vector folded into every attention context (needs a combiner).
    pub fn set_memory(&mut self, memory: Option<Vec<f64>>) {
        self.memory = memory;
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn vectors(&self) -> &Vectors {
        &self.vectors
    }

    pub fn vector(&self, word: &str) -> Option<&HashMap<String, f64>> {
        self.vectors.get(word)
    }

    pub fn vocab_len(&self) -> usize {
        self.vectors.len()
    }

    /// Vocabulary in sorted order.
    pub fn sorted_vocab(&self) -> Vec<String> {
        let mut vocab: Vec<String> = self.vectors.keys().cloned().collect();
        vocab.sort();
        vocab
    }

    fn load_synonyms(&mut self) {
        let Some(path) = self.sources.synonyms.clone() else {
            return;
        };
        if !path.exists() {
            return;
        }
        let parsed = std::fs::read(&path)
            .map_err(|e| IndexError::Io {
                path: path.display().to_string(),
                source: e,
            })
            .and_then(|bytes| {
                serde_json::from_slice::<HashMap<String, String>>(&bytes).map_err(|e| {
                    IndexError::Synonyms {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    }
                })
            });
        match parsed {
            Ok(table) => {
                tracing::debug!(entries = table.len(), "loaded synonym table");
                self.synonyms = table;
            }
            Err(e) => tracing::warn!(error = %e, "synonym table ignored"),
        }
    }

    fn load_snapshot(&self) -> Option<Graph> {
        let path = self.sources.snapshot.as_ref()?;
        let bytes = std::fs::read(path).ok()?;
        match bincode::deserialize::<Snapshot>(&bytes) {
            Ok(snap) => Some(snap.graph),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "index snapshot corrupt, rebuilding");
                None
            }
        }
    }

    fn scan_corpus(&self) -> IndexResult<Graph> {
        use rayon::prelude::*;

        let Some(dir) = self.sources.corpus_dir.as_ref() else {
            return Ok(Graph::new());
        };
        if !dir.is_dir() {
            return Ok(Graph::new());
        }
        let entries = std::fs::read_dir(dir).map_err(|e| IndexError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();

        let parts: Vec<(PathBuf, IndexResult<Graph>)> = files
            .par_iter()
            .map(|p| (p.clone(), scan_file(p)))
            .collect();

        let mut graph = Graph::new();
        for (path, part) in parts {
            match part {
                Ok(g) => merge_graph(&mut graph, g),
                Err(e) => tracing::warn!(error = %e, path = %path.display(), "corpus file skipped"),
            }
        }
        Ok(graph)
    }

    /// Build from the snapshot or a corpus scan. A no-op once built.
    pub fn ensure_built(&mut self) -> IndexResult<()> {
        if self.built {
            return Ok(());
        }
        self.load_synonyms();
        let graph = match self.load_snapshot() {
            Some(g) => {
                tracing::info!(vocab = g.len(), "prediction index loaded from snapshot");
                g
            }
            None => {
                let g = self.scan_corpus()?;
                tracing::info!(vocab = g.len(), "prediction index built from corpus");
                self.dirty = true;
                g
            }
        };
        self.vectors = build_vectors(&graph);
        self.graph = graph;
        self.built = true;
        Ok(())
    }

    /// Drop the built tables so the next [`ensure_built`](Self::ensure_built)
    /// rescans the corpus.
    pub fn invalidate(&mut self) {
        self.graph.clear();
        self.vectors.clear();
        self.attention.clear();
        self.built = false;
        if let Some(path) = &self.sources.snapshot {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(error = %e, "stale index snapshot not removed");
                }
            }
        }
    }

    /// Fold the co-occurrences of `tokens` (one line) into the graph and
    /// recompute the touched vectors only.
    pub fn update(&mut self, tokens: &[String]) -> IndexResult<()> {
        self.ensure_built()?;
        let words = lowercase(tokens);
        let touched = fold_pairs(&mut self.graph, &words);
        for w in &touched {
            if let Some(neighbors) = self.graph.get(w) {
                self.vectors.insert(w.clone(), normalize(neighbors));
            }
        }
        if !touched.is_empty() {
            self.dirty = true;
        }
        Ok(())
    }

    /// Up to `topn` words close to `word`: cosine neighbors for known words,
    /// fuzzy string matches otherwise.
    pub fn suggest(&self, word: &str, topn: usize) -> Vec<String> {
        let Some(vec) = self.vectors.get(word) else {
            let vocab = self.sorted_vocab();
            return fuzzy::close_matches(word, vocab.iter().map(String::as_str), topn, FUZZY_CUTOFF);
        };
        if norm(vec) == 0.0 {
            return Vec::new();
        }
        let mut scored: Vec<(&String, f64)> = self
            .vectors
            .iter()
            .filter(|(other, ov)| other.as_str() != word && norm(ov) > 0.0)
            .map(|(other, ov)| (other, sparse_cosine(vec, ov)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        scored.into_iter().take(topn).map(|(w, _)| w.clone()).collect()
    }

    /// Up to `topn` in-vocabulary neighbors of `word` with positive cosine
    /// similarity, best first.
    pub fn similar(&self, word: &str, topn: usize) -> Vec<(String, f64)> {
        let Some(vec) = self.vectors.get(word) else {
            return Vec::new();
        };
        let mut scored: Vec<(String, f64)> = self
            .vectors
            .iter()
            .filter(|(other, _)| other.as_str() != word)
            .map(|(other, ov)| (other.clone(), sparse_cosine(vec, ov)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(topn);
        scored
    }

    /// Cosine similarity of two known words; `None` when either is unknown.
    pub fn word_similarity(&self, a: &str, b: &str) -> Option<f64> {
        Some(sparse_cosine(self.vectors.get(a)?, self.vectors.get(b)?))
    }

    /// Synonym table first, else the single best suggestion if it is textually
    /// near-identical to `word`.
    pub fn lookup_analogs(&self, word: &str) -> Option<String> {
        if let Some(s) = self
            .synonyms
            .get(word)
            .or_else(|| self.synonyms.get(&word.to_lowercase()))
        {
            return Some(s.clone());
        }
        let best = self.suggest(word, 1).into_iter().next()?;
        (fuzzy::ratio(word, &best) >= ANALOG_RATIO).then_some(best)
    }

    fn attention_model(&mut self, vocab: &[String]) -> &mut MiniSelfAttention {
        let key = vocab_key(vocab);
        let dim = self.attention_dim;
        let model = self.attention.get_or_insert_with(key, || {
            MiniSelfAttention::new(&canonical_vocab(vocab), dim, MiniSelfAttention::DEFAULT_SEED)
        });
        match (&self.combiner, &self.memory) {
            (Some(c), Some(m)) => model.set_memory(Arc::clone(c), m.clone()),
            _ => model.clear_memory(),
        }
        model
    }

    /// Next-word logits over `vocab` (sorted, deduplicated) from the cached
    /// self-attention model for that vocabulary. Deterministic unless `rng` is
    /// given, which enables quantum dropout.
    pub fn transformer_logits(
        &mut self,
        tokens: &[String],
        vocab: &[String],
        rng: Option<&mut StdRng>,
    ) -> Vec<(String, f64)> {
        if vocab.is_empty() {
            return Vec::new();
        }
        self.attention_model(vocab).logits(tokens, rng)
    }

    /// Nudge the model for `vocab` towards predicting `target` after `context`.
    pub fn train_transformer(
        &mut self,
        vocab: &[String],
        context: &[String],
        target: &str,
        lr: f64,
    ) -> bool {
        if vocab.is_empty() {
            return false;
        }
        self.attention_model(vocab).train_step(context, target, lr)
    }

    /// Sum of the vectors of the known `words`.
    pub fn context_vector(&self, words: &[String]) -> HashMap<String, f64> {
        let mut out: HashMap<String, f64> = HashMap::new();
        for w in words {
            if let Some(v) = self.vectors.get(w) {
                for (k, x) in v {
                    *out.entry(k.clone()).or_default() += x;
                }
            }
        }
        out
    }

    /// Write the graph snapshot if one is configured and anything changed.
    pub fn save_snapshot(&mut self) -> IndexResult<()> {
        let Some(path) = self.sources.snapshot.clone() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        let snap = Snapshot {
            graph: self.graph.clone(),
        };
        let bytes = bincode::serialize(&snap).map_err(|e| IndexError::Snapshot {
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IndexError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(&path, bytes).map_err(|e| IndexError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        self.dirty = false;
        tracing::debug!(path = %path.display(), vocab = self.graph.len(), "index snapshot saved");
        Ok(())
    }
}
