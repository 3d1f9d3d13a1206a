//! Dataset training with the skip-don't-crash policy.
//!
//! A missing file, an empty file or a non-positive weight is logged and
//! skipped; the model is left untouched.

use std::path::Path;

use super::{SequenceModel, analyze_sequences};
use crate::metrics::{lowercase, tokenize};

/// Parse one dataset file into a fresh delta model.
///
/// Returns `None` (after a warning) when the file cannot contribute.
pub fn parse_file(path: &Path, char_n: usize, weight: f64) -> Option<SequenceModel> {
    if weight.is_nan() || weight <= 0.0 {
        tracing::warn!(path = %path.display(), weight, "non-positive weight, skipping training");
        return None;
    }
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "dataset unreadable, skipping training");
            return None;
        }
    };
    if text.trim().is_empty() {
        tracing::warn!(path = %path.display(), "dataset is empty, skipping training");
        return None;
    }
    let tokens = lowercase(&tokenize(&text));
    let mut delta = SequenceModel::new();
    analyze_sequences(&mut delta, &tokens, char_n, weight, None);
    Some(delta)
}

/// Train `model` on `path` with `weight`. Returns whether anything was learned.
pub fn train_weighted(model: &mut SequenceModel, path: &Path, char_n: usize, weight: f64) -> bool {
    match parse_file(path, char_n, weight) {
        Some(delta) => {
            model.merge(&delta);
            tracing::debug!(path = %path.display(), weight, "trained on dataset");
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_leaves_model_untouched() {
        let mut model = SequenceModel::new();
        assert!(!train_weighted(&mut model, Path::new("/nonexistent/lines.txt"), 3, 1.0));
        assert!(model.is_empty());
    }

    #[test]
    fn non_positive_weight_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lines.txt");
        std::fs::write(&path, "hello world").unwrap();
        let mut model = SequenceModel::new();
        assert!(!train_weighted(&mut model, &path, 3, 0.0));
        assert!(!train_weighted(&mut model, &path, 3, -1.0));
        assert!(!train_weighted(&mut model, &path, 3, f64::NAN));
        assert!(model.is_empty());
    }

    #[test]
    fn training_lowercases_and_weights() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lines.txt");
        std::fs::write(&path, "Hello World\nhello again").unwrap();
        let mut model = SequenceModel::new();
        assert!(train_weighted(&mut model, &path, 3, 2.0));
        assert_eq!(model.word_counts.count("hello"), 4.0);
        assert_eq!(model.word_inv.count("hello"), 0.25);
        assert!(!model.word_counts.contains_key("Hello"));
    }
}
