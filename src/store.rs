use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::params;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;
use tracing::warn;

use crate::models::{PersistedTransfer, TransferId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value persistence keyed by TransferId. Production uses SQLite;
/// tests use the in-memory impl.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, key: &TransferId, record: PersistedTransfer) -> Result<(), StoreError>;
    async fn get(&self, key: &TransferId) -> Result<Option<PersistedTransfer>, StoreError>;
    async fn delete(&self, key: &TransferId) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    async fn list_all(&self) -> Result<Vec<(TransferId, PersistedTransfer)>, StoreError>;
}

/// In-memory store. Also the fallback behavior the engine degrades to
/// when a durable backend is unavailable.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<TransferId, PersistedTransfer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn put(&self, key: &TransferId, record: PersistedTransfer) -> Result<(), StoreError> {
        self.entries.lock().await.insert(key.clone(), record);
        Ok(())
    }

    async fn get(&self, key: &TransferId) -> Result<Option<PersistedTransfer>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &TransferId) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<(TransferId, PersistedTransfer)>, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Durable store over SQLite. One row per TransferId with the record
/// serialized as JSON.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (and if needed creates) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS transfers (
                    key       TEXT PRIMARY KEY,
                    record    TEXT NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn put(&self, key: &TransferId, record: PersistedTransfer) -> Result<(), StoreError> {
        let key = key.as_str().to_owned();
        let json = serde_json::to_string(&record)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO transfers (key, record) VALUES (?1, ?2)",
                    params![key, json],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, key: &TransferId) -> Result<Option<PersistedTransfer>, StoreError> {
        let key = key.as_str().to_owned();
        let json: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT record FROM transfers WHERE key = ?1")?;
                let mut rows = stmt.query(params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &TransferId) -> Result<(), StoreError> {
        let key = key.as_str().to_owned();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM transfers WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM transfers", [])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<(TransferId, PersistedTransfer)>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT key, record FROM transfers")?;
                let iter = stmt.query_map([], |row| {
                    let key: String = row.get(0)?;
                    let json: String = row.get(1)?;
                    Ok((key, json))
                })?;
                let rows: Result<Vec<(String, String)>, rusqlite::Error> = iter.collect();
                Ok(rows?)
            })
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for (key, json) in rows {
            let record: PersistedTransfer = serde_json::from_str(&json)?;
            entries.push((TransferId::from_raw(key), record));
        }
        Ok(entries)
    }
}

/// Read cache in front of a backing store. Every operation keeps cache
/// and store consistent, and a failing backend degrades to cache-only
/// operation instead of surfacing the error: persistence is best-effort
/// by contract.
pub struct CachedStore {
    inner: Arc<dyn KeyValueStore>,
    cache: Mutex<HashMap<TransferId, PersistedTransfer>>,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Preloads the cache from the backing store.
    pub async fn warm(&self) {
        match self.inner.list_all().await {
            Ok(entries) => {
                let mut cache = self.cache.lock().await;
                for (key, record) in entries {
                    cache.insert(key, record);
                }
            }
            Err(e) => warn!(error = %e, "state store unavailable; starting cold"),
        }
    }

    pub async fn put(&self, key: &TransferId, record: PersistedTransfer) {
        self.cache.lock().await.insert(key.clone(), record.clone());
        if let Err(e) = self.inner.put(key, record).await {
            warn!(key = %key, error = %e, "persist failed; continuing without durability");
        }
    }

    pub async fn get(&self, key: &TransferId) -> Option<PersistedTransfer> {
        if let Some(record) = self.cache.lock().await.get(key).cloned() {
            return Some(record);
        }
        match self.inner.get(key).await {
            Ok(Some(record)) => {
                self.cache.lock().await.insert(key.clone(), record.clone());
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "state read failed; treating as absent");
                None
            }
        }
    }

    pub async fn delete(&self, key: &TransferId) {
        self.cache.lock().await.remove(key);
        if let Err(e) = self.inner.delete(key).await {
            warn!(key = %key, error = %e, "state delete failed");
        }
    }

    pub async fn clear(&self) {
        self.cache.lock().await.clear();
        if let Err(e) = self.inner.clear().await {
            warn!(error = %e, "state clear failed");
        }
    }

    pub async fn list_all(&self) -> Vec<(TransferId, PersistedTransfer)> {
        self.cache
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
