//! Self-tuning: a sliding perplexity monitor that asks for retraining when
//! quality drifts, and a meta optimizer that evolves the generation knobs.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::metrics::Metrics;
use crate::sequence::codec::StateResult;

/// Perturbation applied to each parameter when evolving.
pub const EVOLVE_STEP: f64 = 0.05;
/// Most recent turns kept in the optimizer history.
pub const HISTORY_LIMIT: usize = 1000;

/// Sliding window of recent perplexities against an established baseline.
///
/// The baseline is the mean of the first full window. Afterwards, a windowed
/// mean above `baseline × (1 + tolerance)` signals that the model should be
/// retrained; the baseline is then re-established from the next full window.
#[derive(Debug, Clone)]
pub struct PerplexityMonitor {
    window: usize,
    tolerance: f64,
    values: VecDeque<f64>,
    baseline: Option<f64>,
}

impl PerplexityMonitor {
    pub fn new(window: usize, tolerance: f64) -> Self {
        let window = window.max(1);
        Self {
            window,
            tolerance,
            values: VecDeque::with_capacity(window),
            baseline: None,
        }
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    /// Windowed mean, once the window is full.
    pub fn average(&self) -> Option<f64> {
        (self.values.len() == self.window)
            .then(|| self.values.iter().sum::<f64>() / self.window as f64)
    }

    /// Record one perplexity; returns `true` when retraining is due.
    pub fn record(&mut self, perplexity: f64) -> bool {
        if !perplexity.is_finite() {
            return false;
        }
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(perplexity);
        let Some(avg) = self.average() else {
            return false;
        };
        match self.baseline {
            None => {
                self.baseline = Some(avg);
                false
            }
            Some(base) if avg > base * (1.0 + self.tolerance) => {
                tracing::info!(average = avg, baseline = base, "perplexity drifted above baseline");
                self.baseline = None;
                self.values.clear();
                true
            }
            Some(_) => false,
        }
    }
}

/// Tunable generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningParams {
    pub chaos_factor: f64,
    pub similarity_threshold: f64,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            chaos_factor: 0.0,
            similarity_threshold: 0.3,
        }
    }
}

impl TuningParams {
    fn perturbed(&self, rng: &mut impl Rng) -> Self {
        let mut nudge = |v: f64| (v + rng.gen_range(-EVOLVE_STEP..=EVOLVE_STEP)).clamp(0.0, 1.0);
        Self {
            chaos_factor: nudge(self.chaos_factor),
            similarity_threshold: nudge(self.similarity_threshold),
        }
    }
}

/// One observed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub metrics: Metrics,
    pub params: TuningParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaFile {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    best_params: TuningParams,
}

/// Records `(metrics, params)` per turn and evolves the best-perplexity
/// parameter set.
#[derive(Debug, Default)]
pub struct MetaOptimizer {
    path: Option<PathBuf>,
    history: Vec<HistoryEntry>,
    best: TuningParams,
}

impl MetaOptimizer {
    /// Optimizer persisted to `path`; a missing or unreadable file starts
    /// fresh.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<MetaFile>(&bytes).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = %path.display(), "meta file malformed, starting fresh");
                MetaFile::default()
            }),
            Err(_) => MetaFile::default(),
        };
        Self {
            path: Some(path),
            history: file.history,
            best: file.best_params,
        }
    }

    /// Optimizer without persistence.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn best_params(&self) -> TuningParams {
        self.best
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Record a turn, then evolve the lowest-perplexity entry's params.
    /// Only the last [`HISTORY_LIMIT`] turns are kept. Nothing is written;
    /// see [`snapshot`](Self::snapshot).
    pub fn update(&mut self, metrics: Metrics, params: TuningParams, rng: &mut impl Rng) {
        self.history.push(HistoryEntry { metrics, params });
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
        let best = self
            .history
            .iter()
            .min_by(|a, b| a.metrics.perplexity.total_cmp(&b.metrics.perplexity))
            .map(|h| h.params);
        if let Some(best) = best {
            self.best = best.perturbed(rng);
        }
    }

    /// Owned copy of the persisted state, for writing off the turn path.
    /// `None` without a path.
    pub fn snapshot(&self) -> Option<MetaSnapshot> {
        let path = self.path.clone()?;
        Some(MetaSnapshot {
            path,
            file: MetaFile {
                history: self.history.clone(),
                best_params: self.best,
            },
        })
    }

    /// Write history and best params as JSON, if a path is set.
    pub fn save(&self) -> StateResult<()> {
        self.snapshot().map_or(Ok(()), |s| s.write())
    }
}

/// Detached copy of a [`MetaOptimizer`]'s history and best params.
#[derive(Debug, Clone)]
pub struct MetaSnapshot {
    path: PathBuf,
    file: MetaFile,
}

impl MetaSnapshot {
    pub fn write(&self) -> StateResult<()> {
        write_json(&self.path, &self.file)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StateResult<()> {
    let json = serde_json::to_vec(value).map_err(|e| StateError::Malformed {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StateError::Io {
            path: parent.display().to_string(),
            source: e,
        })?;
    }
    std::fs::write(path, json).map_err(|e| StateError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    use super::*;

    fn metrics(perplexity: f64) -> Metrics {
        Metrics {
            perplexity,
            ..Metrics::default()
        }
    }

    #[test]
    fn monitor_triggers_on_drift() {
        let mut m = PerplexityMonitor::new(3, 0.25);
        assert!(!m.record(10.0));
        assert!(!m.record(10.0));
        assert!(!m.record(10.0));
        assert_eq!(m.baseline(), Some(10.0));
        assert!(!m.record(12.0)); // mean 10.67
        assert!(!m.record(12.0)); // mean 11.33
        assert!(m.record(20.0)); // mean 14.67 > 12.5
        assert_eq!(m.baseline(), None);
        assert!(!m.record(f64::NAN));
    }

    #[test]
    fn evolve_stays_near_best_and_clamped() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut opt = MetaOptimizer::in_memory();
        assert_eq!(opt.best_params(), TuningParams::default());

        let good = TuningParams {
            chaos_factor: 0.0,
            similarity_threshold: 1.0,
        };
        opt.update(metrics(50.0), TuningParams::default(), &mut rng);
        opt.update(metrics(5.0), good, &mut rng);
        opt.update(metrics(80.0), TuningParams::default(), &mut rng);

        let best = opt.best_params();
        assert!((0.0..=EVOLVE_STEP).contains(&best.chaos_factor));
        assert!((1.0 - EVOLVE_STEP..=1.0).contains(&best.similarity_threshold));
        assert_eq!(opt.history().len(), 3);
    }

    #[test]
    fn persists_history_and_best() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");
        let mut rng = StdRng::seed_from_u64(1);
        let best = {
            let mut opt = MetaOptimizer::open(&path);
            opt.update(metrics(3.0), TuningParams::default(), &mut rng);
            assert!(!path.exists());
            opt.snapshot().unwrap().write().unwrap();
            opt.best_params()
        };
        let reopened = MetaOptimizer::open(&path);
        assert_eq!(reopened.history().len(), 1);
        assert_eq!(reopened.best_params(), best);

        std::fs::write(&path, b"{broken").unwrap();
        assert!(MetaOptimizer::open(&path).history().is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut opt = MetaOptimizer::in_memory();
        for i in 0..HISTORY_LIMIT + 10 {
            opt.update(metrics(i as f64 + 1.0), TuningParams::default(), &mut rng);
        }
        assert_eq!(opt.history().len(), HISTORY_LIMIT);
        assert_eq!(opt.history()[0].metrics.perplexity, 11.0);
        assert!(opt.snapshot().is_none());
        assert!(opt.save().is_ok());
    }
}
