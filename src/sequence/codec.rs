//! JSON persistence for [`SequenceModel`].
//!
//! Trigram contexts are written as a single string: both halves escaped
//! (`\` → `\\`, separator → `\s`) and joined with U+0001. Legacy files that
//! joined raw halves with the separator decode unchanged.

use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{SequenceModel, TrigramKey};
use crate::error::StateError;

pub type StateResult<T> = std::result::Result<T, StateError>;

/// Reserved separator between the two halves of a trigram context.
pub const KEY_SEPARATOR: char = '\u{1}';

fn escape_into(out: &mut String, part: &str) {
    for ch in part.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            KEY_SEPARATOR => out.push_str("\\s"),
            c => out.push(c),
        }
    }
}

/// Encode a context pair as one string.
pub fn encode_key(key: &TrigramKey) -> String {
    let mut out = String::with_capacity(key.first.len() + key.second.len() + 1);
    escape_into(&mut out, &key.first);
    out.push(KEY_SEPARATOR);
    escape_into(&mut out, &key.second);
    out
}

/// Decode a string produced by [`encode_key`].
pub fn decode_key(raw: &str) -> StateResult<TrigramKey> {
    let bad = || StateError::TrigramKey {
        key: raw.to_string(),
    };
    let mut parts = vec![String::new()];
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('\\') => parts.last_mut().ok_or_else(bad)?.push('\\'),
                Some('s') => parts.last_mut().ok_or_else(bad)?.push(KEY_SEPARATOR),
                _ => return Err(bad()),
            },
            KEY_SEPARATOR => parts.push(String::new()),
            c => parts.last_mut().ok_or_else(bad)?.push(c),
        }
    }
    match <[String; 2]>::try_from(parts) {
        Ok([first, second]) => Ok(TrigramKey { first, second }),
        Err(_) => Err(bad()),
    }
}

impl Serialize for TrigramKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_key(self))
    }
}

impl<'de> Deserialize<'de> for TrigramKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        decode_key(&raw).map_err(D::Error::custom)
    }
}

/// Write the count tables as JSON, replacing `path` atomically.
pub fn save_state(model: &SequenceModel, path: &Path) -> StateResult<()> {
    let io_err = |e| StateError::Io {
        path: path.display().to_string(),
        source: e,
    };
    let json = serde_json::to_vec(model).map_err(|e| StateError::Malformed {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

/// Read a snapshot and rebuild its inverse tables.
pub fn load_state(path: &Path) -> StateResult<SequenceModel> {
    let bytes = std::fs::read(path).map_err(|e| StateError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut model: SequenceModel =
        serde_json::from_slice(&bytes).map_err(|e| StateError::Malformed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    model.rebuild_inverses();
    Ok(model)
}

/// Load a snapshot, falling back to an empty model when it is missing or corrupt.
pub fn load_or_default(path: &Path) -> SequenceModel {
    if !path.exists() {
        return SequenceModel::default();
    }
    match load_state(path) {
        Ok(model) => {
            tracing::info!(path = %path.display(), words = model.vocab_size(), "loaded sequence state");
            model
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "state unreadable, starting empty");
            SequenceModel::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::analyze_sequences;

    #[test]
    fn keys_with_reserved_characters_survive() {
        for key in [
            TrigramKey::new("<s>", "<s>"),
            TrigramKey::new("a\\", "b"),
            TrigramKey::new("x\u{1}y", "\\s"),
            TrigramKey::new("", ""),
        ] {
            assert_eq!(decode_key(&encode_key(&key)).unwrap(), key);
        }
    }

    #[test]
    fn legacy_joined_key_decodes() {
        let key = decode_key("hello\u{1}world").unwrap();
        assert_eq!(key, TrigramKey::new("hello", "world"));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(decode_key("no-separator").is_err());
        assert!(decode_key("a\u{1}b\u{1}c").is_err());
        assert!(decode_key("dangling\\").is_err());
    }

    #[test]
    fn corrupt_file_falls_back_to_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pro_state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(load_state(&path), Err(StateError::Malformed { .. })));
        assert!(load_or_default(&path).is_empty());
    }

    #[test]
    fn save_then_load_rebuilds_inverses() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state").join("pro_state.json");
        let mut model = SequenceModel::new();
        let tokens: Vec<String> = ["foo", "bar", "foo"].iter().map(|s| s.to_string()).collect();
        analyze_sequences(&mut model, &tokens, 3, 1.0, None);
        save_state(&model, &path).unwrap();

        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded.trigram_counts, model.trigram_counts);
        assert_eq!(loaded.word_inv, model.word_inv);
        assert_eq!(loaded.trigram_inv, model.trigram_inv);
    }
}
