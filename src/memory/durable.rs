//! ACID-durable message store backed by redb.
//!
//! Messages and responses live in append-only tables keyed by a monotonically
//! increasing id; response fingerprints get their own table so `is_unique` is
//! a point lookup. All redb work runs on the blocking pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use super::{MessageStore, StorageResult, StoredMessage, fingerprint};
use crate::error::StorageError;

const MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("messages");
const RESPONSES: TableDefinition<u64, &str> = TableDefinition::new("responses");
const FINGERPRINTS: TableDefinition<&str, u64> = TableDefinition::new("response_fingerprints");

fn redb_err<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> StorageError {
    move |e| StorageError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

/// Message store persisted in `<dir>/messages.redb`.
pub struct DurableMessageStore {
    db: Arc<Database>,
}

impl DurableMessageStore {
    /// Open or create the store in `data_dir`.
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StorageError::Io { source: e })?;
        let db_path = data_dir.join("messages.redb");
        let db = Database::create(&db_path).map_err(|e| StorageError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;

        // Create the tables up front so read transactions never miss them.
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        {
            txn.open_table(MESSAGES).map_err(redb_err("open_table"))?;
            txn.open_table(RESPONSES).map_err(redb_err("open_table"))?;
            txn.open_table(FINGERPRINTS).map_err(redb_err("open_table"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;

        tracing::debug!(path = %db_path.display(), "opened message store");
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> StorageResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StorageError::Redb {
                message: format!("storage task failed: {e}"),
            })?
    }

    fn append_message(db: &Database, message: &StoredMessage) -> StorageResult<()> {
        let bytes = bincode::serialize(message).map_err(|e| StorageError::Serialization {
            message: e.to_string(),
        })?;
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(redb_err("open_table"))?;
            let next = table
                .last().map_err(redb_err("last"))?
                .map_or(0, |(k, _)| k.value() + 1);
            table.insert(next, bytes.as_slice()).map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn append_response(db: &Database, text: &str) -> StorageResult<()> {
        let key = fingerprint(text);
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut responses = txn.open_table(RESPONSES).map_err(redb_err("open_table"))?;
            let next = responses
                .last().map_err(redb_err("last"))?
                .map_or(0, |(k, _)| k.value() + 1);
            responses.insert(next, text).map_err(redb_err("insert"))?;

            let mut prints = txn.open_table(FINGERPRINTS).map_err(redb_err("open_table"))?;
            prints.insert(key.as_str(), next).map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn recent(db: &Database, limit: usize) -> StorageResult<Vec<String>> {
        let txn = db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(MESSAGES).map_err(redb_err("open_table"))?;
        let mut out = Vec::with_capacity(limit);
        for entry in table.iter().map_err(redb_err("iter"))?.rev() {
            if out.len() == limit {
                break;
            }
            let (_, value) = entry.map_err(redb_err("iter"))?;
            let message: StoredMessage =
                bincode::deserialize(value.value()).map_err(|e| StorageError::Serialization {
                    message: e.to_string(),
                })?;
            out.push(message.text);
        }
        Ok(out)
    }

    fn has_fingerprint(db: &Database, text: &str) -> StorageResult<bool> {
        let key = fingerprint(text);
        let txn = db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(FINGERPRINTS).map_err(redb_err("open_table"))?;
        let hit = table.get(key.as_str()).map_err(redb_err("get"))?;
        Ok(hit.is_some())
    }
}

#[async_trait]
impl MessageStore for DurableMessageStore {
    async fn add_message(&self, text: &str, tag: &str) -> StorageResult<()> {
        let message = StoredMessage {
            text: text.to_string(),
            tag: tag.to_string(),
        };
        self.blocking(move |db| Self::append_message(db, &message)).await
    }

    async fn store_response(&self, text: &str) -> StorageResult<()> {
        let text = text.to_string();
        self.blocking(move |db| Self::append_response(db, &text)).await
    }

    async fn fetch_recent(&self, limit: usize) -> StorageResult<Vec<String>> {
        self.blocking(move |db| Self::recent(db, limit)).await
    }

    async fn is_unique(&self, text: &str) -> StorageResult<bool> {
        let text = text.to_string();
        self.blocking(move |db| Self::has_fingerprint(db, &text).map(|hit| !hit))
            .await
    }
}

impl std::fmt::Debug for DurableMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableMessageStore").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TAG_MESSAGE;
    use tempfile::TempDir;

    #[tokio::test]
    async fn add_fetch_and_uniqueness() {
        let dir = TempDir::new().unwrap();
        let store = DurableMessageStore::open(dir.path()).unwrap();

        assert!(store.fetch_recent(5).await.unwrap().is_empty());
        for text in ["one", "two", "three"] {
            store.add_message(text, TAG_MESSAGE).await.unwrap();
        }
        assert_eq!(store.fetch_recent(2).await.unwrap(), ["three", "two"]);

        assert!(store.is_unique("Hello there.").await.unwrap());
        store.store_response("Hello there.").await.unwrap();
        assert!(!store.is_unique("hello THERE").await.unwrap());
    }

    #[tokio::test]
    async fn persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        {
            let store = DurableMessageStore::open(dir.path()).unwrap();
            store.add_message("kept", TAG_MESSAGE).await.unwrap();
            store.store_response("Kept reply.").await.unwrap();
        }
        let store = DurableMessageStore::open(dir.path()).unwrap();
        assert_eq!(store.fetch_recent(10).await.unwrap(), ["kept"]);
        assert!(!store.is_unique("kept reply").await.unwrap());
    }
}
