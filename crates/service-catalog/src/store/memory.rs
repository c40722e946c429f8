//! In-process key-value store

use super::Database;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Ordered in-memory [`Database`] with per-key expiry
#[derive(Default)]
pub struct MemoryDatabase {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryDatabase {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn read_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.with_live(|entries| {
            entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect()
        }))
    }

    async fn read_entry(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.with_live(|entries| entries.get(key).map(|entry| entry.value.clone())))
    }

    async fn read_all_entries(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self.with_live(|entries| {
            entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect()
        }))
    }

    async fn insert_entry(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete_entry(&self, key: &str) -> Result<usize> {
        Ok(self.with_live(|entries| usize::from(entries.remove(key).is_some())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let deadline = Instant::now() + ttl;
        self.with_live(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(deadline);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_prefix_scans() {
        let db = MemoryDatabase::new();
        db.insert_entry("a:1", b"1".to_vec()).await.unwrap();
        db.insert_entry("a:2", b"2".to_vec()).await.unwrap();
        db.insert_entry("b:1", b"3".to_vec()).await.unwrap();

        assert_eq!(db.read_keys("a:").await.unwrap(), vec!["a:1", "a:2"]);
        let entries = db.read_all_entries("b:").await.unwrap();
        assert_eq!(entries, vec![("b:1".to_string(), b"3".to_vec())]);
        assert_eq!(db.delete_entry("a:1").await.unwrap(), 1);
        assert_eq!(db.delete_entry("a:1").await.unwrap(), 0);
    }

    #[smol_potat::test]
    async fn test_expiry_and_reinsert() {
        let db = MemoryDatabase::new();
        db.insert_entry("k", b"v".to_vec()).await.unwrap();
        db.expire("k", Duration::from_millis(20)).await.unwrap();

        // Insert clears the expiry
        db.insert_entry("k", b"v2".to_vec()).await.unwrap();
        smol::Timer::after(Duration::from_millis(50)).await;
        assert_eq!(db.read_entry("k").await.unwrap(), Some(b"v2".to_vec()));

        db.expire("k", Duration::from_millis(20)).await.unwrap();
        smol::Timer::after(Duration::from_millis(50)).await;
        assert_eq!(db.read_entry("k").await.unwrap(), None);
        assert!(db.read_keys("").await.unwrap().is_empty());
    }
}
