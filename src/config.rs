//! Engine configuration, persisted as TOML.
//!
//! Every field carries a serde default so partial config files stay valid
//! across versions. `data_dir = None` runs the engine memory-only: nothing is
//! loaded at startup and nothing is written back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::ProPaths;

/// Errors from config operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read engine config: {path}")]
    #[diagnostic(
        code(pro::config::read),
        help("Ensure the config file exists and is valid TOML.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse engine config: {path}")]
    #[diagnostic(
        code(pro::config::parse),
        help("Check the TOML syntax in the config file: {message}")
    )]
    Parse { path: String, message: String },

    #[error("failed to write engine config: {path}")]
    #[diagnostic(
        code(pro::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Tunables for the conversational engine and its background workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of all persisted files. `None` for memory-only mode.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Character n-gram size tracked by the sequence model (0 disables).
    #[serde(default = "default_char_n")]
    pub char_n: usize,
    /// Inclusive length range of the first clause.
    #[serde(default = "default_first_len")]
    pub first_len: (usize, usize),
    /// Inclusive length range of the second clause.
    #[serde(default = "default_second_len")]
    pub second_len: (usize, usize),
    /// Maximum cosine similarity allowed between the two clauses' words.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Cosine similarity above which two candidates count as duplicates.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
    /// Rolling candidate buffer capacity.
    #[serde(default = "default_buffer_capacity")]
    pub candidate_buffer: usize,
    /// Chaos factors tried per turn; one statistical candidate per entry.
    #[serde(default = "default_chaos_variants")]
    pub chaos_variants: Vec<f64>,
    /// Maximum dataset files parsed in parallel during retraining.
    #[serde(default = "default_tune_concurrency")]
    pub tune_concurrency: usize,
    /// Seconds between dataset directory scans.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Seconds between dream-worker idle checks.
    #[serde(default = "default_dream_interval")]
    pub dream_interval_secs: u64,
    /// Idle CPU share at or above which the dream worker may run.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: f64,
    /// Training weight applied to dreamed dialogue.
    #[serde(default = "default_dream_weight")]
    pub dream_weight: f64,
    /// Dialogue turns per dream cycle.
    #[serde(default = "default_dream_turns")]
    pub dream_turns: usize,
    /// Sliding window of perplexities watched by the retraining monitor.
    #[serde(default = "default_perplexity_window")]
    pub perplexity_window: usize,
    /// Fraction above baseline perplexity that triggers a full retrain.
    #[serde(default = "default_perplexity_tolerance")]
    pub perplexity_tolerance: f64,
    /// Timeout for each message-store call.
    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_ms: u64,
    /// Optional opensearch-style endpoint for external knowledge.
    #[serde(default)]
    pub external_api: Option<String>,
    /// Timeout for external knowledge retrieval.
    #[serde(default = "default_external_timeout")]
    pub external_timeout_ms: u64,
    /// Self-attention models kept in the per-vocabulary cache.
    #[serde(default = "default_attention_cache")]
    pub attention_cache: usize,
    /// Self-attention embedding width.
    #[serde(default = "default_attention_dim")]
    pub attention_dim: usize,
    /// Apply random phase dropout to attention weights.
    #[serde(default)]
    pub quantum_dropout: bool,
    /// Forbid the user's own words in the reply, substituting analogs.
    #[serde(default = "default_true")]
    pub echo_guard: bool,
    /// Name of the memory combiner folded into self-attention context.
    #[serde(default = "default_combiner")]
    pub memory_combiner: String,
    /// Seed for the engine's random source.
    #[serde(default)]
    pub seed: u64,
}

fn default_char_n() -> usize {
    3
}
fn default_first_len() -> (usize, usize) {
    (5, 10)
}
fn default_second_len() -> (usize, usize) {
    (5, 6)
}
fn default_similarity_threshold() -> f64 {
    0.3
}
fn default_dedup_threshold() -> f64 {
    0.98
}
fn default_buffer_capacity() -> usize {
    32
}
fn default_chaos_variants() -> Vec<f64> {
    vec![0.0, 0.5, 2.0]
}
fn default_tune_concurrency() -> usize {
    2
}
fn default_scan_interval() -> u64 {
    60
}
fn default_dream_interval() -> u64 {
    300
}
fn default_idle_threshold() -> f64 {
    0.8
}
fn default_dream_weight() -> f64 {
    0.5
}
fn default_dream_turns() -> usize {
    3
}
fn default_perplexity_window() -> usize {
    20
}
fn default_perplexity_tolerance() -> f64 {
    0.25
}
fn default_storage_timeout() -> u64 {
    500
}
fn default_external_timeout() -> u64 {
    1500
}
fn default_attention_cache() -> usize {
    8
}
fn default_attention_dim() -> usize {
    16
}
fn default_true() -> bool {
    true
}
fn default_combiner() -> String {
    "additive".into()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            char_n: default_char_n(),
            first_len: default_first_len(),
            second_len: default_second_len(),
            similarity_threshold: default_similarity_threshold(),
            dedup_threshold: default_dedup_threshold(),
            candidate_buffer: default_buffer_capacity(),
            chaos_variants: default_chaos_variants(),
            tune_concurrency: default_tune_concurrency(),
            scan_interval_secs: default_scan_interval(),
            dream_interval_secs: default_dream_interval(),
            idle_threshold: default_idle_threshold(),
            dream_weight: default_dream_weight(),
            dream_turns: default_dream_turns(),
            perplexity_window: default_perplexity_window(),
            perplexity_tolerance: default_perplexity_tolerance(),
            storage_timeout_ms: default_storage_timeout(),
            external_api: None,
            external_timeout_ms: default_external_timeout(),
            attention_cache: default_attention_cache(),
            attention_dim: default_attention_dim(),
            quantum_dropout: false,
            echo_guard: true,
            memory_combiner: default_combiner(),
            seed: 0,
        }
    }
}

impl EngineConfig {
    /// Config rooted at `dir` (other fields default).
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// File layout for the persisted state, if any.
    pub fn paths(&self) -> Option<ProPaths> {
        self.data_dir.as_deref().map(ProPaths::rooted)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}
