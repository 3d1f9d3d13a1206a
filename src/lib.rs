// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # pro-engine
//!
//! A self-tuning conversational engine built from plain corpus statistics:
//! n-gram sequence tables, a word co-occurrence prediction index and a
//! constrained sentence planner, with a tiny self-attention model blended in.
//!
//! ## Architecture
//!
//! - **Sequence model** (`sequence`): weighted word, bigram, trigram and
//!   character n-gram counts with inverse tables, persisted as JSON
//! - **Metrics** (`metrics`): entropy, perplexity and resonance of a token run
//! - **Prediction index** (`predict`): co-occurrence vectors, fuzzy
//!   suggestions, synonyms and cached self-attention logits
//! - **Planner** (`planner`): two-clause responses under forbidden-word and
//!   topical-drift constraints
//! - **Candidates** (`candidates`): embedding dedup and ranking behind a
//!   single-flight generation gate
//! - **Memory** (`memory`): message stores (in-process and redb) and
//!   embedding providers
//! - **Self-tuning** (`meta`, `datasets`, `dream`, `daemon`): perplexity
//!   drift detection, dataset rescans, idle-time dreaming
//!
//! ## Library usage
//!
//! ```no_run
//! use pro_engine::config::EngineConfig;
//! use pro_engine::engine::Engine;
//!
//! # async fn demo() -> pro_engine::error::ProResult<()> {
//! let engine = Engine::new(EngineConfig::with_data_dir("/tmp/pro"))?;
//! engine.scan_datasets().await?;
//! let (reply, metrics) = engine.process_message("tell me about the sea").await;
//! println!("{reply} (perplexity {:.2})", metrics.perplexity);
//! # Ok(())
//! # }
//! ```

pub mod candidates;
pub mod config;
pub mod daemon;
pub mod datasets;
pub mod dream;
pub mod engine;
pub mod error;
pub mod forecast;
pub mod memory;
pub mod meta;
pub mod metrics;
pub mod paths;
pub mod planner;
pub mod predict;
pub mod retrieve;
pub mod sequence;
