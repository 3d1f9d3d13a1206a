//! Dataset directory scanning and weighted retraining.
//!
//! Each plain-text file in the dataset directory is tracked in a manifest by
//! its SHA-256 and the weight it was trained with. A scan reports files whose
//! hash or weight changed, plus files that disappeared. A disappearance means
//! the model must be rebuilt from scratch, since counts cannot be subtracted.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::error::DatasetError;
use crate::paths::ProPaths;
use crate::sequence::SequenceModel;
use crate::sequence::train::parse_file;

/// Result type for dataset operations.
pub type DatasetResult<T> = std::result::Result<T, DatasetError>;

/// Weight used for files absent from the weights table.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// What a file was last trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sha256: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    DEFAULT_WEIGHT
}

/// File name → last trained entry.
pub type Manifest = BTreeMap<String, ManifestEntry>;

/// Accepts the current format and plain `name → hash` maps.
#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Entries(Manifest),
    Hashes(BTreeMap<String, String>),
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> DatasetResult<String> {
    let bytes = std::fs::read(path).map_err(|e| DatasetError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Read the weights table; missing means empty, malformed is an error.
pub fn load_weights(path: &Path) -> DatasetResult<HashMap<String, f64>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path).map_err(|e| DatasetError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| DatasetError::Malformed {
        what: "dataset weights",
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

pub fn load_manifest(path: &Path) -> DatasetResult<Manifest> {
    if !path.exists() {
        return Ok(Manifest::new());
    }
    let bytes = std::fs::read(path).map_err(|e| DatasetError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let file: ManifestFile = serde_json::from_slice(&bytes).map_err(|e| DatasetError::Malformed {
        what: "dataset manifest",
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(match file {
        ManifestFile::Entries(m) => m,
        ManifestFile::Hashes(h) => h
            .into_iter()
            .map(|(name, sha256)| {
                (
                    name,
                    ManifestEntry {
                        sha256,
                        weight: DEFAULT_WEIGHT,
                    },
                )
            })
            .collect(),
    })
}

pub fn save_manifest(path: &Path, manifest: &Manifest) -> DatasetResult<()> {
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| DatasetError::Malformed {
        what: "dataset manifest",
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatasetError::Io {
            path: parent.display().to_string(),
            source: e,
        })?;
    }
    std::fs::write(path, json).map_err(|e| DatasetError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Outcome of one scan. Nothing is written until [`DatasetWatcher::commit`].
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Files (with weights) whose hash or weight changed, sorted by name.
    pub changed: Vec<(PathBuf, f64)>,
    /// Names that were in the manifest but are gone from the directory.
    pub removed: Vec<String>,
    /// Names already in the manifest whose hash or weight changed.
    pub modified: Vec<String>,
    /// Every current file with its weight, sorted by name.
    pub all: Vec<(PathBuf, f64)>,
    manifest: Manifest,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    /// Counts already merged from a removed or edited file cannot be taken
    /// back, so either forces a reset.
    pub fn needs_full_retrain(&self) -> bool {
        !self.removed.is_empty() || !self.modified.is_empty()
    }

    /// Files to train on: everything after a reset, else only new files.
    pub fn training_set(&self) -> &[(PathBuf, f64)] {
        if self.needs_full_retrain() {
            &self.all
        } else {
            &self.changed
        }
    }
}

/// Compares the dataset directory against the persisted manifest.
#[derive(Debug, Clone)]
pub struct DatasetWatcher {
    dir: PathBuf,
    manifest_path: PathBuf,
    weights_path: PathBuf,
}

impl DatasetWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
        weights_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dir: dir.into(),
            manifest_path: manifest_path.into(),
            weights_path: weights_path.into(),
        }
    }

    pub fn from_paths(paths: &ProPaths) -> Self {
        Self::new(paths.datasets_dir(), paths.manifest_file(), paths.weights_file())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn files(&self) -> DatasetResult<Vec<(String, PathBuf)>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| DatasetError::Io {
            path: self.dir.display().to_string(),
            source: e,
        })?;
        let mut files: Vec<(String, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DatasetError::Io {
                path: self.dir.display().to_string(),
                source: e,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                files.push((name.to_string(), path.clone()));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Hash every file and diff against the manifest.
    ///
    /// A malformed weights table or manifest is logged and treated as empty,
    /// which at worst retrains everything.
    pub fn scan(&self) -> DatasetResult<ScanReport> {
        let weights = load_weights(&self.weights_path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "dataset weights ignored");
            HashMap::new()
        });
        let old = load_manifest(&self.manifest_path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "dataset manifest ignored");
            Manifest::new()
        });

        let mut report = ScanReport::default();
        for (name, path) in self.files()? {
            let sha256 = match sha256_file(&path) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "dataset file skipped");
                    continue;
                }
            };
            let weight = weights.get(&name).copied().unwrap_or(DEFAULT_WEIGHT);
            let entry = ManifestEntry { sha256, weight };
            match old.get(&name) {
                Some(prev) if *prev == entry => {}
                Some(_) => {
                    report.modified.push(name.clone());
                    report.changed.push((path.clone(), weight));
                }
                None => report.changed.push((path.clone(), weight)),
            }
            report.all.push((path, weight));
            report.manifest.insert(name, entry);
        }
        report.removed = old
            .keys()
            .filter(|k| !report.manifest.contains_key(*k))
            .cloned()
            .collect();

        tracing::debug!(
            files = report.all.len(),
            changed = report.changed.len(),
            modified = report.modified.len(),
            removed = report.removed.len(),
            "dataset scan"
        );
        Ok(report)
    }

    /// Persist the manifest of a scan once its training has been applied.
    pub fn commit(&self, report: &ScanReport) -> DatasetResult<()> {
        save_manifest(&self.manifest_path, &report.manifest)
    }
}

/// Parse `files` concurrently (at most `concurrency` at once, on the
/// blocking pool) and fold the results serially, in the given order.
pub async fn retrain(files: &[(PathBuf, f64)], char_n: usize, concurrency: usize) -> SequenceModel {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let tasks: Vec<_> = files
        .iter()
        .cloned()
        .map(|(path, weight)| {
            let permits = Arc::clone(&permits);
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                let p = path.clone();
                match tokio::task::spawn_blocking(move || parse_file(&p, char_n, weight)).await {
                    Ok(delta) => delta,
                    Err(e) => {
                        tracing::warn!(error = %e, path = %path.display(), "dataset parse task failed");
                        None
                    }
                }
            })
        })
        .collect();

    let mut model = SequenceModel::new();
    for (joined, (path, _)) in futures_util::future::join_all(tasks).await.into_iter().zip(files) {
        match joined {
            Ok(Some(delta)) => {
                model.merge(&delta);
                tracing::debug!(path = %path.display(), "dataset folded");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "dataset task panicked"),
        }
    }
    model
}
