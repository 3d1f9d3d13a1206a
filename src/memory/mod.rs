//! Message and response persistence.
//!
//! The engine talks to storage only through the narrow [`MessageStore`]
//! contract. Two implementations ship with the crate: [`MemoryStore`] keeps
//! everything in process, [`durable::DurableMessageStore`] persists to redb.

pub mod durable;
pub mod embed;

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::StorageError;

pub use durable::DurableMessageStore;
pub use embed::{EmbeddingProvider, HashingEmbedder};

/// Result type for message storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Tag for messages received from the user.
pub const TAG_MESSAGE: &str = "message";
/// Tag for lines produced by the dream worker.
pub const TAG_DREAM: &str = "dream";

/// One stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub text: String,
    pub tag: String,
}

/// Storage collaborator used by the engine.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Record an incoming message under `tag`.
    async fn add_message(&self, text: &str, tag: &str) -> StorageResult<()>;

    /// Record a generated response.
    async fn store_response(&self, text: &str) -> StorageResult<()>;

    /// Up to `limit` stored message texts, newest first.
    async fn fetch_recent(&self, limit: usize) -> StorageResult<Vec<String>>;

    /// Whether no stored response has the same [`fingerprint`] as `text`.
    async fn is_unique(&self, text: &str) -> StorageResult<bool>;
}

/// Normalized comparison key: NFKC, lowercased, alphanumerics and single
/// spaces only.
pub fn fingerprint(text: &str) -> String {
    let cleaned: String = text
        .nfkc()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Default)]
struct MemoryInner {
    messages: Vec<StoredMessage>,
    responses: Vec<String>,
    fingerprints: HashSet<String>,
}

/// In-process message store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|e| StorageError::Serialization {
            message: format!("memory store lock poisoned: {e}"),
        })
    }

    /// All messages with `tag`, oldest first.
    pub fn messages_tagged(&self, tag: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .filter(|m| m.tag == tag)
            .map(|m| m.text.clone())
            .collect())
    }

    /// Stored responses, oldest first.
    pub fn responses(&self) -> StorageResult<Vec<String>> {
        Ok(self.lock()?.responses.clone())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn add_message(&self, text: &str, tag: &str) -> StorageResult<()> {
        self.lock()?.messages.push(StoredMessage {
            text: text.to_string(),
            tag: tag.to_string(),
        });
        Ok(())
    }

    async fn store_response(&self, text: &str) -> StorageResult<()> {
        let mut inner = self.lock()?;
        inner.responses.push(text.to_string());
        inner.fingerprints.insert(fingerprint(text));
        Ok(())
    }

    async fn fetch_recent(&self, limit: usize) -> StorageResult<Vec<String>> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .rev()
            .take(limit)
            .map(|m| m.text.clone())
            .collect())
    }

    async fn is_unique(&self, text: &str) -> StorageResult<bool> {
        Ok(!self.lock()?.fingerprints.contains(&fingerprint(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_normalizes() {
        assert_eq!(fingerprint("Hello,   WORLD!"), "hello world");
        // Full-width letters fold under NFKC.
        assert_eq!(fingerprint("ＨＥＬＬＯ world"), "hello world");
        assert_eq!(fingerprint("...!"), "");
    }

    #[tokio::test]
    async fn memory_store_contract() {
        let store = MemoryStore::new();
        store.add_message("first", TAG_MESSAGE).await.unwrap();
        store.add_message("second", TAG_MESSAGE).await.unwrap();
        store.add_message("dreamt", TAG_DREAM).await.unwrap();

        assert_eq!(store.fetch_recent(2).await.unwrap(), ["dreamt", "second"]);
        assert_eq!(store.messages_tagged(TAG_DREAM).unwrap(), ["dreamt"]);

        assert!(store.is_unique("Nice reply.").await.unwrap());
        store.store_response("Nice reply.").await.unwrap();
        assert!(!store.is_unique("nice   REPLY").await.unwrap());
        assert!(store.is_unique("Other reply.").await.unwrap());
        assert_eq!(store.responses().unwrap(), ["Nice reply."]);
    }
}
