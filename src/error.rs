//! Rich diagnostic error types for the pro-engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains. The conversational path
//! never surfaces these to the user: `Engine::process_message` degrades every
//! failure to a neutral contribution and logs it instead.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the pro-engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, sources) through to the CLI.
#[derive(Debug, Error, Diagnostic)]
pub enum ProError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] crate::paths::PathError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Sequence-model state errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    #[error("I/O error on state file {path}: {source}")]
    #[diagnostic(
        code(pro::state::io),
        help(
            "The sequence-model state file could not be read or written. \
             Check that the state directory exists and is writable."
        )
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed state file {path}: {message}")]
    #[diagnostic(
        code(pro::state::malformed),
        help(
            "The persisted state is not valid JSON for this version. \
             The engine falls back to an empty model at startup; delete the file \
             or retrain from the dataset directory to rebuild it."
        )
    )]
    Malformed { path: String, message: String },

    #[error("invalid trigram key encoding: {key:?}")]
    #[diagnostic(
        code(pro::state::trigram_key),
        help("Trigram context keys must contain exactly one unescaped separator.")
    )]
    TrigramKey { key: String },
}

// ---------------------------------------------------------------------------
// Prediction index errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum IndexError {
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(
        code(pro::index::io),
        help("Check that the corpus directory and snapshot location are readable and writable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot serialization error: {message}")]
    #[diagnostic(
        code(pro::index::snapshot),
        help(
            "The prediction-index snapshot could not be encoded or decoded. \
             Delete the snapshot to force a rebuild from the corpus."
        )
    )]
    Snapshot { message: String },

    #[error("malformed synonym table {path}: {message}")]
    #[diagnostic(
        code(pro::index::synonyms),
        help("The synonym table must be a JSON object mapping words to words.")
    )]
    Synonyms { path: String, message: String },

    #[error("unknown memory combiner: \"{name}\"")]
    #[diagnostic(
        code(pro::index::combiner),
        help("Built-in combiners are \"additive\" and \"phase-magnitude\".")
    )]
    UnknownCombiner { name: String },

    #[error("memory combiner already registered: \"{name}\"")]
    #[diagnostic(
        code(pro::index::duplicate_combiner),
        help("Each combiner name can be registered once per registry.")
    )]
    DuplicateCombiner { name: String },
}

// ---------------------------------------------------------------------------
// Message storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(pro::storage::io),
        help("Check that the storage directory exists and has correct permissions.")
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(pro::storage::redb),
        help(
            "The embedded message database encountered a transaction error. \
             Try running with a fresh data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(pro::storage::serde),
        help("A stored message could not be encoded or decoded.")
    )]
    Serialization { message: String },

    #[error("storage call timed out after {millis} ms")]
    #[diagnostic(
        code(pro::storage::timeout),
        help("Raise `storage_timeout_ms` in the engine config if the store is slow.")
    )]
    Timeout { millis: u64 },
}

// ---------------------------------------------------------------------------
// Embedding errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EmbedError {
    #[error("embedding provider failed: {message}")]
    #[diagnostic(
        code(pro::embed::provider),
        help("The embedding collaborator returned an error; candidates fall back to unranked order.")
    )]
    Provider { message: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(pro::embed::dimension),
        help("All embeddings compared in one ranking pass must share a dimension.")
    )]
    Dimension { expected: usize, actual: usize },
}

// ---------------------------------------------------------------------------
// Dataset errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DatasetError {
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(
        code(pro::dataset::io),
        help("Check that the dataset directory exists and its files are readable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {what} file {path}: {message}")]
    #[diagnostic(
        code(pro::dataset::malformed),
        help("Delete the file; it is regenerated on the next dataset scan.")
    )]
    Malformed {
        what: &'static str,
        path: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(code(pro::engine::invalid_config), help("Check the EngineConfig fields. {message}"))]
    InvalidConfig { message: String },

    #[error("data directory error: {path}")]
    #[diagnostic(
        code(pro::engine::data_dir),
        help(
            "The data directory could not be created. \
             Ensure the path exists and has read/write permissions."
        )
    )]
    DataDir { path: String },

    #[error("background task \"{task}\" failed: {message}")]
    #[diagnostic(
        code(pro::engine::task),
        help("A supervised background worker panicked or was aborted; see the logs for the cause.")
    )]
    Task { task: String, message: String },
}

/// Convenience alias for functions returning pro-engine results.
pub type ProResult<T> = std::result::Result<T, ProError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_converts_to_pro_error() {
        let err = StateError::TrigramKey { key: "a".into() };
        let pro: ProError = err.into();
        assert!(matches!(pro, ProError::State(StateError::TrigramKey { .. })));
    }

    #[test]
    fn storage_error_converts_to_pro_error() {
        let err = StorageError::Timeout { millis: 250 };
        let pro: ProError = err.into();
        assert!(matches!(pro, ProError::Storage(StorageError::Timeout { millis: 250 })));
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = EmbedError::Dimension {
            expected: 64,
            actual: 32,
        };
        let msg = format!("{err}");
        assert!(msg.contains("64"));
        assert!(msg.contains("32"));
    }
}
