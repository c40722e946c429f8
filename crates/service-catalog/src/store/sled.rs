//! Sled database store for the external catalog

use super::Database;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Persistent [`Database`] on an embedded sled instance.
///
/// Expiry deadlines are wall-clock milliseconds kept in a separate tree, so
/// they survive a restart; expired keys are purged when next touched.
pub struct SledDatabase {
    /// Database instance
    db: sled::Db,
    /// Key to value
    entries: sled::Tree,
    /// Key to expiry deadline (big-endian epoch millis)
    expiry: sled::Tree,
}

impl SledDatabase {
    /// Open (or create) a database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        async_fs::create_dir_all(path).await?;

        info!("Opening sled database at {:?}", path);
        Self::from_db(sled::open(path)?)
    }

    /// Create a temporary database (for testing)
    pub async fn temporary() -> Result<Self> {
        info!("Creating temporary sled database");
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let entries = db.open_tree("entries")?;
        let expiry = db.open_tree("expiry")?;
        Ok(Self {
            db,
            entries,
            expiry,
        })
    }

    fn now_millis() -> u64 {
        u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
    }

    /// Drop `key` if its deadline has passed; returns whether it is still live
    fn purge_if_expired(&self, key: &[u8], now: u64) -> Result<bool> {
        let Some(deadline) = self.expiry.get(key)? else {
            return Ok(true);
        };
        let mut raw = [0u8; 8];
        if deadline.len() == 8 {
            raw.copy_from_slice(&deadline);
        }
        if u64::from_be_bytes(raw) > now {
            return Ok(true);
        }

        debug!(key = %String::from_utf8_lossy(key), "Purging expired entry");
        self.entries.remove(key)?;
        self.expiry.remove(key)?;
        Ok(false)
    }

    fn live_entries(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let now = Self::now_millis();
        let mut live = Vec::new();
        for result in self.entries.scan_prefix(prefix.as_bytes()) {
            let (key, value) = result?;
            if self.purge_if_expired(&key, now)? {
                live.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
            }
        }
        Ok(live)
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl Database for SledDatabase {
    async fn read_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .live_entries(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn read_entry(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if !self.purge_if_expired(key.as_bytes(), Self::now_millis())? {
            return Ok(None);
        }
        Ok(self.entries.get(key.as_bytes())?.map(|value| value.to_vec()))
    }

    async fn read_all_entries(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.live_entries(prefix)
    }

    async fn insert_entry(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.as_bytes(), value)?;
        self.expiry.remove(key.as_bytes())?;
        self.flush().await
    }

    async fn delete_entry(&self, key: &str) -> Result<usize> {
        let live = self.purge_if_expired(key.as_bytes(), Self::now_millis())?;
        let removed = self.entries.remove(key.as_bytes())?.is_some() && live;
        self.expiry.remove(key.as_bytes())?;
        self.flush().await?;
        Ok(usize::from(removed))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if !self.entries.contains_key(key.as_bytes())? {
            return Ok(());
        }
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let deadline = Self::now_millis().saturating_add(ttl_ms);
        self.expiry
            .insert(key.as_bytes(), deadline.to_be_bytes().to_vec())?;
        self.flush().await
    }
}
