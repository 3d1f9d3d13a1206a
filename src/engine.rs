//! Engine orchestrator: the top-level conversational API.
//!
//! The `Engine` owns the sequence model, the prediction index, the message
//! store and the embedding provider, and runs one turn at a time through
//! [`Engine::process_message`]. Background work (dataset scans, dreaming,
//! retraining) goes through the same engine and the same locks; see
//! [`crate::daemon`].
//!
//! Lock order is always state, then model, then index. The state lock is an
//! async mutex held for a whole turn or retrain; anything that touches the
//! model holds it. Model and index sit behind std mutexes and their heavy
//! work runs on the blocking pool.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::Notify;

use crate::candidates::{Candidate, CandidateBuffer, CandidatePipeline, filter_similar_candidates};
use crate::config::EngineConfig;
use crate::datasets::{DatasetWatcher, ScanReport, retrain};
use crate::dream::{DreamScript, simulate_dialogue};
use crate::error::{EngineError, ProResult, StorageError};
use crate::forecast::{ForecastNode, backpropagate_forecast, simulate_paths};
use crate::memory::embed::embed_checked;
use crate::memory::{
    DurableMessageStore, EmbeddingProvider, HashingEmbedder, MemoryStore, MessageStore,
    StorageResult, TAG_DREAM, TAG_MESSAGE,
};
use crate::meta::{MetaOptimizer, PerplexityMonitor, TuningParams};
use crate::metrics::{Metrics, compute_metrics, lowercase, tokenize};
use crate::paths::ProPaths;
use crate::planner::SentencePlanner;
use crate::planner::grammar::{passes_filters, swap_pronouns};
use crate::planner::phrase::{ResponseParams, SILENCE, respond, substitute_forbidden};
use crate::predict::combiner::CombinerRegistry;
use crate::predict::{IndexSources, PredictionIndex, SharedIndex, combine_predictions, lock_index};
use crate::retrieve::{retrieve_context, retrieve_external};
use crate::sequence::codec::{load_or_default, save_state};
use crate::sequence::{Counts, SequenceModel, analyze_sequences};

/// Charged words taken from one message.
pub const CHARGED_LIMIT: usize = 5;
/// Stored messages pulled in as context per turn.
pub const CONTEXT_LIMIT: usize = 5;
/// Index neighbors per seed offered to the attention model.
const NEURAL_FANOUT: usize = 5;
/// Blended predictions appended to the seeds for the neural candidate.
const NEURAL_EXTENSION: usize = 2;

/// Per-turn state serialized behind one async mutex.
struct EngineState {
    monitor: PerplexityMonitor,
    meta: MetaOptimizer,
    rng: StdRng,
    buffer: CandidateBuffer,
}

/// Vocabulary sizes for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub words: usize,
    pub bigram_contexts: usize,
    pub trigram_contexts: usize,
    pub char_ngrams: usize,
    pub index_vocab: usize,
}

/// Tokens of `words` ranked by `frequency × (1 + successor count)`, at most
/// [`CHARGED_LIMIT`]. Counting is case-insensitive; each word keeps the form
/// it first appeared in, and ties keep first-seen order.
pub fn compute_charged_words(model: &SequenceModel, words: &[String]) -> Vec<String> {
    let mut first_seen: Vec<(String, String)> = Vec::new();
    let mut freq: HashMap<String, usize> = HashMap::new();
    for w in words {
        let lower = w.to_lowercase();
        *freq.entry(lower.clone()).or_insert_with(|| {
            first_seen.push((lower, w.clone()));
            0
        }) += 1;
    }
    let mut charged: Vec<(f64, String)> = first_seen
        .into_iter()
        .map(|(lower, form)| {
            let successors = model.bigram_counts.get(&lower).map_or(0, Counts::len);
            let f = freq.get(&lower).copied().unwrap_or(0);
            ((f * (1 + successors)) as f64, form)
        })
        .collect();
    charged.sort_by(|a, b| b.0.total_cmp(&a.0));
    charged.into_iter().take(CHARGED_LIMIT).map(|(_, w)| w).collect()
}

/// Lowercased token → analog: the best suggestion, else the analog lookup.
/// Tokens without either (or whose only candidate is themselves) are absent.
pub fn build_analog_map(index: &PredictionIndex, tokens: &[String]) -> HashMap<String, String> {
    let mut analogs = HashMap::new();
    for tok in tokens {
        let lower = tok.to_lowercase();
        if analogs.contains_key(&lower) {
            continue;
        }
        let found = index
            .suggest(&lower, 1)
            .into_iter()
            .next()
            .or_else(|| index.lookup_analogs(&lower));
        if let Some(a) = found.filter(|a| *a != lower) {
            analogs.insert(lower, a);
        }
    }
    analogs
}

/// First-registered continuation with the highest count.
fn top_continuation(row: &Counts) -> Option<&String> {
    let mut best: Option<(&String, f64)> = None;
    for (w, &c) in row.iter() {
        if best.is_none_or(|(_, b)| c > b) {
            best = Some((w, c));
        }
    }
    best.map(|(w, _)| w)
}

/// Seeds extended with the head of the blended n-gram/attention prediction.
fn neural_seeds(
    index: &mut PredictionIndex,
    model: &SequenceModel,
    seeds: &[String],
    forbidden: &HashSet<String>,
    rng: Option<&mut StdRng>,
) -> Vec<String> {
    let Some(last) = seeds.last() else {
        return Vec::new();
    };
    let lower = lowercase(seeds);
    let mut vocab = lower.clone();
    for s in &lower {
        vocab.extend(index.similar(s, NEURAL_FANOUT).into_iter().map(|(w, _)| w));
    }
    vocab.sort();
    vocab.dedup();

    let ngram_word = model
        .bigram_counts
        .get(&last.to_lowercase())
        .and_then(top_continuation)
        .cloned()
        .unwrap_or_default();
    let logits = index.transformer_logits(&lower, &vocab, rng);
    let used: HashSet<&String> = lower.iter().collect();

    let mut out = seeds.to_vec();
    out.extend(
        combine_predictions(&ngram_word, &logits)
            .into_iter()
            .filter(|w| !used.contains(w) && !forbidden.contains(w))
            .take(NEURAL_EXTENSION),
    );
    out
}

fn task_error(task: &str) -> impl FnOnce(tokio::task::JoinError) -> EngineError + '_ {
    move |e| EngineError::Task {
        task: task.to_string(),
        message: e.to_string(),
    }
}

fn validate(config: &EngineConfig) -> ProResult<()> {
    let invalid = |message: &str| -> ProResult<()> {
        Err(EngineError::InvalidConfig {
            message: message.to_string(),
        }
        .into())
    };
    if config.first_len.0 == 0 || config.second_len.0 == 0 {
        return invalid("clause length ranges must start at 1 or more");
    }
    if config.chaos_variants.is_empty() {
        return invalid("chaos_variants must not be empty");
    }
    if config.chaos_variants.iter().any(|c| !c.is_finite()) {
        return invalid("chaos_variants must be finite");
    }
    if config.dream_weight.is_nan() || config.dream_weight <= 0.0 {
        return invalid("dream_weight must be positive");
    }
    if !(0.0..=1.0).contains(&config.idle_threshold) {
        return invalid("idle_threshold must be within [0, 1]");
    }
    if config.perplexity_tolerance.is_nan() || config.perplexity_tolerance < 0.0 {
        return invalid("perplexity_tolerance must be non-negative");
    }
    Ok(())
}

/// Owned inputs of a turn's CPU-bound work: learning the message, measuring
/// it and planning every candidate text.
struct TurnPlan {
    raw: Vec<String>,
    words: Vec<String>,
    context: Vec<String>,
    forbidden: HashSet<String>,
    base: ResponseParams,
    chaos_variants: Vec<f64>,
    attention_dim: usize,
    echo_guard: bool,
    quantum_dropout: bool,
}

impl TurnPlan {
    fn new(config: &EngineConfig, raw: Vec<String>, context: Vec<String>, params: TuningParams) -> Self {
        let words = lowercase(&raw);
        let forbidden = if config.echo_guard {
            words.iter().cloned().collect()
        } else {
            HashSet::new()
        };
        Self {
            raw,
            words,
            context,
            forbidden,
            base: ResponseParams {
                chaos_factor: params.chaos_factor,
                similarity_threshold: params.similarity_threshold,
                first_len: config.first_len,
                second_len: config.second_len,
                char_n: config.char_n,
            },
            chaos_variants: config.chaos_variants.clone(),
            attention_dim: config.attention_dim,
            echo_guard: config.echo_guard,
            quantum_dropout: config.quantum_dropout,
        }
    }

    /// Learn the message, then return its metrics and the candidate texts,
    /// grammar-passing ones only when any pass.
    fn run(&self, model: &mut SequenceModel, idx: &mut PredictionIndex, rng: &mut StdRng) -> (Metrics, Vec<String>) {
        let char_n = self.base.char_n;
        analyze_sequences(model, &self.words, char_n, 1.0, None);

        let context_tokens = tokenize(&self.context.join(" "));
        let mut all_words = self.words.clone();
        all_words.extend(lowercase(&context_tokens));
        let metrics = compute_metrics(&all_words, model, char_n);

        let mut sources = self.raw.clone();
        sources.extend(context_tokens);
        let charged = swap_pronouns(&compute_charged_words(model, &sources));

        let memory = (!self.context.is_empty())
            .then(|| HashingEmbedder::new(self.attention_dim).embed_sync(&self.context.join(" ")));
        idx.set_memory(memory);

        let seeds = if self.echo_guard {
            let analogs = build_analog_map(idx, &charged);
            substitute_forbidden(&charged, &analogs, &self.forbidden)
        } else {
            charged
        };
        let rng = self.quantum_dropout.then_some(rng);
        let neural = neural_seeds(idx, model, &seeds, &self.forbidden, rng);

        let planner = SentencePlanner::new(model, Some(&*idx));
        let mut texts: Vec<String> = self
            .chaos_variants
            .iter()
            .map(|variant| {
                let p = ResponseParams {
                    chaos_factor: self.base.chaos_factor + variant,
                    ..self.base.clone()
                };
                respond(&planner, &seeds, &self.forbidden, &p)
            })
            .collect();
        if neural.len() > seeds.len() {
            texts.push(respond(&planner, &neural, &self.forbidden, &self.base));
        }

        let passing: Vec<String> = texts.iter().filter(|t| passes_filters(t)).cloned().collect();
        (metrics, if passing.is_empty() { texts } else { passing })
    }
}

fn lock_model(model: &Mutex<SequenceModel>) -> MutexGuard<'_, SequenceModel> {
    model.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("sequence model lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// The conversational engine.
pub struct Engine {
    config: EngineConfig,
    paths: Option<ProPaths>,
    state: tokio::sync::Mutex<EngineState>,
    model: Arc<Mutex<SequenceModel>>,
    index: SharedIndex,
    store: Arc<dyn MessageStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    pipeline: CandidatePipeline,
    watcher: Option<DatasetWatcher>,
    dream_script: DreamScript,
    tune: Notify,
    retrain_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open an engine. With a data directory, state, index snapshot, message
    /// database and meta history are loaded from it; otherwise everything
    /// lives in memory.
    pub fn new(config: EngineConfig) -> ProResult<Self> {
        validate(&config)?;
        let paths = config.paths();
        let engine = match &paths {
            Some(p) => {
                p.ensure_dirs().map_err(|_| EngineError::DataDir {
                    path: p.data_dir.display().to_string(),
                })?;
                let model = load_or_default(&p.state_file());
                let index = PredictionIndex::new(IndexSources {
                    corpus_dir: Some(p.datasets_dir()),
                    snapshot: Some(p.index_snapshot()),
                    synonyms: Some(p.synonyms_file()),
                });
                let store: Arc<dyn MessageStore> = Arc::new(DurableMessageStore::open(&p.messages_dir())?);
                let mut engine =
                    Self::with_parts(config, model, index, store, Arc::new(HashingEmbedder::default()))?;
                engine.state.get_mut().meta = MetaOptimizer::open(p.meta_file());
                engine.dream_script = DreamScript::load(&p.dream_script());
                engine
            }
            None => Self::with_parts(
                config,
                SequenceModel::new(),
                PredictionIndex::in_memory(),
                Arc::new(MemoryStore::new()),
                Arc::new(HashingEmbedder::default()),
            )?,
        };
        let vocab = lock_model(&engine.model).vocab_size();
        tracing::info!(
            data_dir = ?engine.config.data_dir,
            vocab,
            combiner = %engine.config.memory_combiner,
            "initializing pro engine"
        );
        Ok(engine)
    }

    /// Assemble an engine from explicit collaborators.
    pub fn with_parts(
        config: EngineConfig,
        model: SequenceModel,
        index: PredictionIndex,
        store: Arc<dyn MessageStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> ProResult<Self> {
        validate(&config)?;
        let index = index
            .with_attention(config.attention_cache, config.attention_dim)
            .with_combiner(&CombinerRegistry::builtin(), &config.memory_combiner)?;
        let paths = config.paths();
        let watcher = paths.as_ref().map(DatasetWatcher::from_paths);
        let state = EngineState {
            monitor: PerplexityMonitor::new(config.perplexity_window, config.perplexity_tolerance),
            meta: MetaOptimizer::in_memory(),
            rng: StdRng::seed_from_u64(config.seed),
            buffer: CandidateBuffer::new(config.candidate_buffer, config.dedup_threshold),
        };
        Ok(Self {
            config,
            paths,
            state: tokio::sync::Mutex::new(state),
            model: Arc::new(Mutex::new(model)),
            index: Arc::new(Mutex::new(index)),
            store,
            embedder,
            pipeline: CandidatePipeline::new(),
            watcher,
            dream_script: DreamScript::default(),
            tune: Notify::new(),
            retrain_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn paths(&self) -> Option<&ProPaths> {
        self.paths.as_ref()
    }

    /// Signalled when the perplexity monitor asks for a full retrain.
    pub fn tune_signal(&self) -> &Notify {
        &self.tune
    }

    /// Highest number of overlapping candidate generations seen (always 1).
    pub fn peak_candidate_concurrency(&self) -> usize {
        self.pipeline.peak_concurrency()
    }

    /// Run `f` against the current sequence model.
    pub async fn with_model<T>(&self, f: impl FnOnce(&SequenceModel) -> T) -> T {
        let _state = self.state.lock().await;
        f(&lock_model(&self.model))
    }

    pub async fn stats(&self) -> EngineStats {
        self.ensure_index().await;
        let _state = self.state.lock().await;
        self.blocking("stats", |model, idx| EngineStats {
            words: model.word_counts.len(),
            bigram_contexts: model.bigram_counts.len(),
            trigram_contexts: model.trigram_counts.len(),
            char_ngrams: model.char_ngram_counts.len(),
            index_vocab: idx.vocab_len(),
        })
        .await
        .unwrap_or_default()
    }

    /// Run `f` on the model and index on the blocking pool. Callers hold the
    /// state lock. A panic inside `f` is logged and yields `None`.
    async fn blocking<T, F>(&self, task: &str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SequenceModel, &mut PredictionIndex) -> T + Send + 'static,
    {
        let model = Arc::clone(&self.model);
        let index = Arc::clone(&self.index);
        let joined = tokio::task::spawn_blocking(move || {
            let mut model = lock_model(&model);
            let mut idx = lock_index(&index);
            std::panic::catch_unwind(AssertUnwindSafe(|| f(&mut *model, &mut *idx))).ok()
        })
        .await;
        match joined {
            Ok(Some(v)) => Some(v),
            Ok(None) => {
                tracing::warn!(task, "blocking task panicked");
                None
            }
            Err(e) => {
                tracing::warn!(error = %task_error(task)(e), "blocking task failed");
                None
            }
        }
    }

    /// Run `f` on the index alone on the blocking pool.
    async fn with_index_blocking<T, F>(&self, task: &str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PredictionIndex) -> T + Send + 'static,
    {
        let index = Arc::clone(&self.index);
        let joined = tokio::task::spawn_blocking(move || f(&mut *lock_index(&index))).await;
        match joined {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %task_error(task)(e), "index task failed");
                None
            }
        }
    }

    async fn ensure_index(&self) {
        if let Some(Err(e)) = self.with_index_blocking("index build", |idx| idx.ensure_built()).await {
            tracing::warn!(error = %e, "prediction index unavailable");
        }
    }

    /// Await a storage call under the storage timeout; failures are logged.
    async fn guarded<T>(&self, what: &'static str, call: impl Future<Output = StorageResult<T>>) -> Option<T> {
        let err = match tokio::time::timeout(self.config.storage_timeout(), call).await {
            Ok(Ok(v)) => return Some(v),
            Ok(Err(e)) => e,
            Err(_) => StorageError::Timeout {
                millis: self.config.storage_timeout_ms,
            },
        };
        tracing::warn!(error = %err, what, "storage call failed");
        None
    }

    async fn embed(&self, text: &str) -> Vec<f64> {
        match embed_checked(self.embedder.as_ref(), text).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, candidate left unranked");
                Vec::new()
            }
        }
    }

    async fn gather_context(&self, text: &str, words: &[String]) -> Vec<String> {
        let lookup = retrieve_context(self.store.as_ref(), &self.index, words, CONTEXT_LIMIT);
        let mut context = match tokio::time::timeout(self.config.storage_timeout(), lookup).await {
            Ok(found) => found,
            Err(_) => {
                tracing::warn!(millis = self.config.storage_timeout_ms, "context retrieval timed out");
                Vec::new()
            }
        };
        if let Some(api) = &self.config.external_api {
            context.extend(retrieve_external(api, text, self.config.external_timeout()).await);
        }
        context
    }

    /// Answer one message. Never fails: every collaborator failure degrades
    /// to a neutral contribution.
    pub async fn process_message(&self, text: &str) -> (String, Metrics) {
        let raw = tokenize(text);
        let words = lowercase(&raw);

        self.guarded("add message", self.store.add_message(text, TAG_MESSAGE))
            .await;
        let context = self.gather_context(text, &words).await;
        self.ensure_index().await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let params = state.meta.best_params();
        let plan = TurnPlan::new(&self.config, raw, context, params);

        let (metrics, response) = self.pipeline.run(self.prepare_candidates(state, text, plan)).await;

        let response_words = lowercase(&tokenize(&response));
        let char_n = self.config.char_n;
        self.blocking("learn turn", move |model, idx| {
            analyze_sequences(model, &response_words, char_n, 1.0, None);
            for line in [&words, &response_words] {
                if let Err(e) = idx.update(line) {
                    tracing::warn!(error = %e, "index update skipped");
                }
            }
        })
        .await;

        let drifted = state.monitor.record(metrics.perplexity);
        state.meta.update(metrics, params, &mut state.rng);
        drop(guard);

        if drifted {
            self.tune.notify_one();
        }
        self.guarded("store response", self.store.store_response(&response))
            .await;
        if let Err(e) = self.save_state().await {
            tracing::warn!(error = %e, "state not saved");
        }

        tracing::info!(
            target: "pro_engine::interaction",
            user = text,
            response = %response,
            entropy = metrics.entropy,
            perplexity = metrics.perplexity,
            resonance = metrics.resonance,
            "turn"
        );
        (response, metrics)
    }

    /// Learn and measure the message, then generate, deduplicate and rank
    /// this turn's candidates. Runs inside the candidate pipeline gate.
    async fn prepare_candidates(&self, state: &mut EngineState, text: &str, plan: TurnPlan) -> (Metrics, String) {
        let mut rng = state.rng.clone();
        let planned = self
            .blocking("plan turn", move |model, idx| {
                let out = plan.run(model, idx, &mut rng);
                (out, rng)
            })
            .await;
        let (metrics, texts) = match planned {
            Some((out, rng)) => {
                state.rng = rng;
                out
            }
            None => (Metrics::default(), Vec::new()),
        };

        let query = self.embed(text).await;
        let mut fresh = Vec::with_capacity(texts.len());
        for t in texts {
            let embedding = self.embed(&t).await;
            fresh.push(Candidate::new(embedding, t));
        }
        let fresh = filter_similar_candidates(fresh, self.config.dedup_threshold);
        let fresh_texts: HashSet<String> = fresh.iter().map(|c| c.text.clone()).collect();
        let first_fresh = fresh.first().map(|c| c.text.clone());
        state.buffer.extend(fresh);

        let ranked = state.buffer.rank_candidates(&query, state.buffer.len());
        let mut fallback: Option<String> = None;
        for cand in ranked.into_iter().filter(|c| fresh_texts.contains(&c.text)) {
            let unique = self
                .guarded("uniqueness check", self.store.is_unique(&cand.text))
                .await
                .unwrap_or(true);
            if unique {
                return (metrics, cand.text);
            }
            fallback.get_or_insert(cand.text);
        }
        let response = fallback
            .or(first_fresh)
            .unwrap_or_else(|| SILENCE.to_string());
        (metrics, response)
    }

    /// Persist the model, the index snapshot and the meta history (no-op in
    /// memory-only mode). Holds the state lock until written.
    pub async fn save_state(&self) -> ProResult<()> {
        let Some(paths) = self.paths.clone() else {
            return Ok(());
        };
        let state = self.state.lock().await;
        let meta = state.meta.snapshot();
        let model = Arc::clone(&self.model);
        let index = Arc::clone(&self.index);
        let written = tokio::task::spawn_blocking(move || -> ProResult<()> {
            save_state(&lock_model(&model), &paths.state_file())?;
            lock_index(&index).save_snapshot()?;
            if let Some(meta) = meta {
                meta.write()?;
            }
            Ok(())
        })
        .await
        .map_err(task_error("save state"))?;
        drop(state);
        written
    }

    /// Train on one file with `weight`; returns whether anything was learned.
    pub async fn train_file(&self, path: &Path, weight: f64) -> bool {
        let delta = retrain(&[(path.to_path_buf(), weight)], self.config.char_n, 1).await;
        if delta.is_empty() {
            return false;
        }
        let _state = self.state.lock().await;
        let vocab = self
            .blocking("train file", move |model, _| {
                model.merge(&delta);
                model.vocab_size()
            })
            .await;
        tracing::info!(path = %path.display(), weight, ?vocab, "trained on file");
        vocab.is_some()
    }

    async fn scan(&self) -> ProResult<Option<(DatasetWatcher, ScanReport)>> {
        let Some(watcher) = self.watcher.clone() else {
            return Ok(None);
        };
        let w = watcher.clone();
        let report = tokio::task::spawn_blocking(move || w.scan())
            .await
            .map_err(task_error("dataset scan"))??;
        Ok(Some((watcher, report)))
    }

    /// Merge the scanned files into the model, rebuild the index and commit
    /// the manifest. Callers hold the retrain gate.
    async fn apply_training(&self, watcher: &DatasetWatcher, report: &ScanReport, full: bool) -> ProResult<()> {
        let files: Vec<(PathBuf, f64)> = if full {
            report.all.clone()
        } else {
            report.training_set().to_vec()
        };
        let delta = retrain(&files, self.config.char_n, self.config.tune_concurrency).await;
        {
            let _state = self.state.lock().await;
            let count = files.len();
            let rebuilt = self
                .blocking("apply training", move |model, idx| {
                    if full {
                        model.reset();
                    }
                    model.merge(&delta);
                    tracing::info!(files = count, full, vocab = model.vocab_size(), "retrained from datasets");
                    idx.invalidate();
                    idx.ensure_built()
                })
                .await;
            match rebuilt {
                Some(Ok(())) => {}
                Some(Err(e)) => tracing::warn!(error = %e, "prediction index not rebuilt"),
                None => {
                    return Err(EngineError::Task {
                        task: "apply training".into(),
                        message: "training was not applied".into(),
                    }
                    .into());
                }
            }
        }
        watcher.commit(report)?;
        self.save_state().await
    }

    /// Diff the dataset directory against the manifest and retrain what
    /// changed. Returns whether any training happened.
    pub async fn scan_datasets(&self) -> ProResult<bool> {
        let _gate = self.retrain_gate.lock().await;
        let Some((watcher, report)) = self.scan().await? else {
            return Ok(false);
        };
        if report.is_empty() {
            return Ok(false);
        }
        let full = report.needs_full_retrain();
        self.apply_training(&watcher, &report, full).await?;
        Ok(true)
    }

    /// Reset the model and retrain on every dataset file.
    pub async fn full_retrain(&self) -> ProResult<()> {
        let _gate = self.retrain_gate.lock().await;
        let Some((watcher, report)) = self.scan().await? else {
            return Ok(());
        };
        self.apply_training(&watcher, &report, true).await
    }

    /// One dream: train on a simulated dialogue with the dream weight and
    /// store its lines. Returns the number of lines.
    pub async fn dream_cycle(&self) -> usize {
        let dialogue = {
            let mut state = self.state.lock().await;
            let dialogue = simulate_dialogue(self.config.dream_turns, &self.dream_script, &mut state.rng);
            let lines = dialogue.clone();
            let (char_n, weight) = (self.config.char_n, self.config.dream_weight);
            self.blocking("dream", move |model, idx| {
                for line in &lines {
                    let tokens = lowercase(&tokenize(line));
                    analyze_sequences(model, &tokens, char_n, weight, None);
                    if let Err(e) = idx.update(&tokens) {
                        tracing::warn!(error = %e, "index update skipped");
                    }
                }
            })
            .await;
            dialogue
        };
        for line in &dialogue {
            self.guarded("store dream", self.store.add_message(line, TAG_DREAM))
                .await;
        }
        if let Err(e) = self.save_state().await {
            tracing::warn!(error = %e, "state not saved after dream");
        }
        tracing::info!(lines = dialogue.len(), "dream cycle complete");
        dialogue.len()
    }

    /// Forecast tree for `seeds`; with `learn`, surprising branches are fed
    /// back into the attention model.
    pub async fn forecast(&self, seeds: &[String], depth: usize, learn: bool) -> Option<ForecastNode> {
        self.ensure_index().await;
        let seeds = lowercase(seeds);
        self.with_index_blocking("forecast", move |idx| {
            let root = simulate_paths(idx, &seeds, depth);
            if learn {
                let steps = backpropagate_forecast(idx, &root);
                tracing::debug!(steps, "forecast backpropagated");
            }
            root
        })
        .await
    }

    /// Flush state before exit.
    pub async fn shutdown(&self) {
        if let Err(e) = self.save_state().await {
            tracing::warn!(error = %e, "state not saved at shutdown");
        }
        tracing::info!("pro engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::predict::Graph;

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn trained_model(lines: &[&str]) -> SequenceModel {
        let mut model = SequenceModel::new();
        for line in lines {
            analyze_sequences(&mut model, &lowercase(&tokenize(line)), 3, 1.0, None);
        }
        model
    }

    fn index_over(lines: &[&str]) -> PredictionIndex {
        let mut idx = PredictionIndex::from_graph(Graph::new());
        for line in lines {
            idx.update(&tokenize(line)).unwrap();
        }
        idx
    }

    fn memory_engine(model: SequenceModel, index: PredictionIndex, store: Arc<dyn MessageStore>) -> Engine {
        Engine::with_parts(
            EngineConfig::default(),
            model,
            index,
            store,
            Arc::new(HashingEmbedder::default()),
        )
        .unwrap()
    }

    #[test]
    fn charged_words_rank_by_successors() {
        let model = trained_model(&["foo x", "foo y", "bar z"]);
        let charged = compute_charged_words(&model, &toks(&["baz", "Foo", "bar", "foo", "qux"]));
        assert_eq!(charged[0], "Foo");
        assert_eq!(charged[1], "bar");
        assert_eq!(charged[2..], toks(&["baz", "qux"]));
        let many = toks(&["a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(compute_charged_words(&model, &many).len(), CHARGED_LIMIT);
    }

    #[test]
    fn analog_map_prefers_suggestion() {
        let mut idx = index_over(&["sun warm sky", "sun bright sky"]);
        idx.set_synonyms(HashMap::from([("world".to_string(), "globe".to_string())]));
        let map = build_analog_map(&idx, &toks(&["WORLD", "warm", "zzz"]));
        assert_eq!(map.get("world").map(String::as_str), Some("globe"));
        assert!(map.contains_key("warm"));
        assert!(!map.contains_key("zzz"));
    }

    #[test]
    fn top_continuation_keeps_first_on_ties() {
        let row: Counts = [("b", 2.0), ("a", 2.0), ("c", 1.0)]
            .into_iter()
            .map(|(w, c)| (w.to_string(), c))
            .collect();
        assert_eq!(top_continuation(&row).map(String::as_str), Some("b"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.chaos_variants.clear();
        assert!(Engine::new(cfg).is_err());
        let cfg = EngineConfig {
            memory_combiner: "nonsense".into(),
            ..EngineConfig::default()
        };
        assert!(Engine::new(cfg).is_err());
    }

    #[tokio::test]
    async fn empty_engine_answers_silence() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let (response, metrics) = engine.process_message("hello there").await;
        assert_eq!(response, SILENCE);
        assert!(metrics.entropy >= 0.0);
        // The turn still trains the model.
        assert!(engine.with_model(|m| m.word_counts.count("hello")).await > 0.0);
    }

    #[tokio::test]
    async fn echo_guard_substitutes_with_casing() {
        let corpus = ["globe spins around bright stars", "stars shine over quiet oceans"];
        let mut index = index_over(&corpus);
        index.set_synonyms(HashMap::from([("world".to_string(), "globe".to_string())]));
        let engine = memory_engine(trained_model(&corpus), index, Arc::new(MemoryStore::new()));

        let (response, _) = engine.process_message("hello WORLD friend").await;
        assert!(response.starts_with("GLOBE"), "{response}");
        assert!(!response.to_lowercase().contains("world"));
        assert!(!response.to_lowercase().contains("friend"));
        assert!(response.ends_with('.'));
    }

    #[tokio::test]
    async fn turns_never_overlap() {
        let corpus = ["the cat sat on the mat", "a dog ran in the park"];
        let engine = Arc::new(memory_engine(
            trained_model(&corpus),
            index_over(&corpus),
            Arc::new(MemoryStore::new()),
        ));
        let mut handles = Vec::new();
        for msg in ["cat", "dog", "park", "mat"] {
            let e = Arc::clone(&engine);
            handles.push(tokio::spawn(async move { e.process_message(msg).await }));
        }
        for h in handles {
            let (response, _) = h.await.unwrap();
            assert!(!response.is_empty());
        }
        assert_eq!(engine.peak_candidate_concurrency(), 1);
    }

    #[tokio::test]
    async fn index_contention_never_stalls_the_runtime() {
        let corpus = ["the cat sat on the mat", "a dog ran in the park"];
        let engine = memory_engine(trained_model(&corpus), index_over(&corpus), Arc::new(MemoryStore::new()));
        let held = Arc::clone(&engine.index);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(400));
        });
        locked_rx.recv().unwrap();

        let start = std::time::Instant::now();
        let ticker = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            start.elapsed()
        };
        let ((response, _), ticked) = tokio::join!(engine.process_message("cat"), ticker);
        holder.join().unwrap();
        assert!(ticked < Duration::from_millis(300), "runtime stalled for {ticked:?}");
        assert!(!response.is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn add_message(&self, _: &str, _: &str) -> StorageResult<()> {
            Err(StorageError::Redb {
                message: "down".into(),
            })
        }
        async fn store_response(&self, _: &str) -> StorageResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
        async fn fetch_recent(&self, _: usize) -> StorageResult<Vec<String>> {
            Err(StorageError::Redb {
                message: "down".into(),
            })
        }
        async fn is_unique(&self, _: &str) -> StorageResult<bool> {
            Err(StorageError::Redb {
                message: "down".into(),
            })
        }
    }

    #[tokio::test]
    async fn storage_failures_do_not_break_the_turn() {
        let corpus = ["rivers flow into the sea", "mountains rise above rivers"];
        let engine = memory_engine(trained_model(&corpus), index_over(&corpus), Arc::new(BrokenStore));
        let (response, _) = engine.process_message("rivers").await;
        assert!(response.ends_with('.'));
    }

    #[tokio::test]
    async fn dream_cycle_trains_and_stores() {
        let store = Arc::new(MemoryStore::new());
        let engine = memory_engine(SequenceModel::new(), PredictionIndex::from_graph(Graph::new()), store.clone());
        let lines = engine.dream_cycle().await;
        assert_eq!(lines, 2 * engine.config().dream_turns);
        assert_eq!(store.messages_tagged(TAG_DREAM).unwrap().len(), lines);
        assert!(engine.stats().await.words > 0);
        assert!(engine.stats().await.index_vocab > 0);
    }

    #[tokio::test]
    async fn dataset_scan_and_removal_retrain() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
        let datasets = engine.paths().unwrap().datasets_dir();
        std::fs::create_dir_all(&datasets).unwrap();
        std::fs::write(datasets.join("a.txt"), "alpha beta gamma").unwrap();

        assert!(engine.scan_datasets().await.unwrap());
        assert!(engine.with_model(|m| m.word_counts.count("alpha")).await > 0.0);
        assert!(!engine.scan_datasets().await.unwrap());

        std::fs::remove_file(datasets.join("a.txt")).unwrap();
        std::fs::write(datasets.join("b.txt"), "delta epsilon").unwrap();
        assert!(engine.scan_datasets().await.unwrap());
        assert_eq!(engine.with_model(|m| m.word_counts.count("alpha")).await, 0.0);
        assert!(engine.with_model(|m| m.word_counts.count("delta")).await > 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_retrains_count_each_file_once() {
        for _ in 0..10 {
            let dir = TempDir::new().unwrap();
            let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
            let datasets = engine.paths().unwrap().datasets_dir();
            std::fs::create_dir_all(&datasets).unwrap();
            std::fs::write(datasets.join("a.txt"), "alpha beta").unwrap();

            let (full, scan) = tokio::join!(engine.full_retrain(), engine.scan_datasets());
            full.unwrap();
            scan.unwrap();
            assert_eq!(engine.with_model(|m| m.word_counts.count("alpha")).await, 1.0);
            assert!(!engine.scan_datasets().await.unwrap());
        }
    }

    #[tokio::test]
    async fn edited_dataset_replaces_old_counts() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
        let datasets = engine.paths().unwrap().datasets_dir();
        std::fs::create_dir_all(&datasets).unwrap();
        std::fs::write(datasets.join("a.txt"), "alpha beta").unwrap();
        assert!(engine.scan_datasets().await.unwrap());

        std::fs::write(datasets.join("a.txt"), "alpha gamma").unwrap();
        assert!(engine.scan_datasets().await.unwrap());
        let (alpha, beta) = engine
            .with_model(|m| (m.word_counts.count("alpha"), m.word_counts.count("beta")))
            .await;
        assert_eq!(alpha, 1.0);
        assert_eq!(beta, 0.0);
    }

    #[tokio::test]
    async fn pronouns_are_mirrored_in_seeds() {
        let corpus = ["i like quiet rivers", "rivers like quiet nights"];
        let config = EngineConfig {
            echo_guard: false,
            ..EngineConfig::default()
        };
        let engine = Engine::with_parts(
            config,
            trained_model(&corpus),
            index_over(&corpus),
            Arc::new(MemoryStore::new()),
            Arc::new(HashingEmbedder::default()),
        )
        .unwrap();
        let (response, _) = engine.process_message("you").await;
        assert!(response.starts_with("I "), "{response}");
    }

    #[tokio::test]
    async fn state_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
            engine.process_message("persistent words here").await;
            engine.shutdown().await;
        }
        let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
        assert!(engine.with_model(|m| m.word_counts.count("persistent")).await > 0.0);
    }

    #[tokio::test]
    async fn forecast_over_index() {
        let corpus = ["sun rises east", "moon rises night"];
        let engine = memory_engine(trained_model(&corpus), index_over(&corpus), Arc::new(MemoryStore::new()));
        let root = engine.forecast(&toks(&["Sun"]), 2, true).await.unwrap();
        assert_eq!(root.text, "sun");
        assert_eq!(root.children.len(), crate::forecast::BRANCHES);
    }
}
