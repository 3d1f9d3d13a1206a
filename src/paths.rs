//! XDG-compliant path resolution for pro-engine.
//!
//! `ProPaths` resolves the global directories following the XDG Base Directory
//! Specification and derives the default location of every file the engine
//! persists: model state, dataset manifest, index snapshot, and so on.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(pro::paths::no_home),
        help("Set the HOME environment variable or pass --data-dir explicitly.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(pro::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

/// Global XDG-compliant directories for pro-engine.
#[derive(Debug, Clone)]
pub struct ProPaths {
    /// `$XDG_CONFIG_HOME/pro-engine/`
    pub config_dir: PathBuf,
    /// `$XDG_DATA_HOME/pro-engine/`
    pub data_dir: PathBuf,
    /// `$XDG_STATE_HOME/pro-engine/`
    pub state_dir: PathBuf,
    /// `$XDG_CACHE_HOME/pro-engine/`
    pub cache_dir: PathBuf,
}

impl ProPaths {
    /// Resolve XDG directories from environment variables with standard fallbacks.
    pub fn resolve() -> PathResult<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| PathError::NoHome)?;

        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".config"))
            .join("pro-engine");

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/share"))
            .join("pro-engine");

        let state_dir = std::env::var("XDG_STATE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/state"))
            .join("pro-engine");

        let cache_dir = std::env::var("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".cache"))
            .join("pro-engine");

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
            cache_dir,
        })
    }

    /// Lay every directory out under a single root (used by `--data-dir` and tests).
    pub fn rooted(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.to_path_buf(),
            state_dir: root.join("state"),
            cache_dir: root.join("cache"),
        }
    }

    /// Create all base directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.state_dir,
            &self.cache_dir,
            &self.datasets_dir(),
        ] {
            std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Path to the engine config file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Directory scanned for plain-text training files.
    pub fn datasets_dir(&self) -> PathBuf {
        self.data_dir.join("datasets")
    }

    /// Sequence-model JSON snapshot.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("pro_state.json")
    }

    /// Content-hash manifest of the dataset directory.
    pub fn manifest_file(&self) -> PathBuf {
        self.state_dir.join("dataset_sha.json")
    }

    /// Per-file training weights.
    pub fn weights_file(&self) -> PathBuf {
        self.data_dir.join("dataset_weights.json")
    }

    /// Prediction-index snapshot (bincode).
    pub fn index_snapshot(&self) -> PathBuf {
        self.cache_dir.join("prediction_index.bin")
    }

    /// Precomputed synonym table.
    pub fn synonyms_file(&self) -> PathBuf {
        self.data_dir.join("synonyms.json")
    }

    /// Meta-optimizer history and best parameters.
    pub fn meta_file(&self) -> PathBuf {
        self.state_dir.join("pro_meta.json")
    }

    /// Prompts and responses replayed by the dream worker.
    pub fn dream_script(&self) -> PathBuf {
        self.data_dir.join("dream_data.json")
    }

    /// Durable message store directory.
    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir.join("messages")
    }
}
