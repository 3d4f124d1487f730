//! In-memory stores.
//!
//! Same semantics as the SQLite store with no persistence. Used by tests and
//! as the working copy of an unpacked legacy syncfile.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use fieldsync_core::{Entry, EntryId, LogKey, LogLengths};

use crate::error::{Result, StoreError};
use crate::now_millis;
use crate::traits::{
    validate_media_name, Appended, Fork, InsertResult, LogStore, MediaStore,
    APPEND_CHANNEL_CAPACITY,
};

/// In-memory log store. Thread-safe via RwLock.
pub struct MemoryLogStore {
    inner: RwLock<MemoryLogInner>,
    appended: broadcast::Sender<Appended>,
}

#[derive(Default)]
struct MemoryLogInner {
    /// Entries per log, keyed by seq.
    logs: HashMap<LogKey, BTreeMap<u64, StoredEntry>>,

    /// Fork evidence.
    forks: HashMap<LogKey, Vec<Fork>>,
}

struct StoredEntry {
    id: EntryId,
    entry: Entry,
}

impl MemoryLogStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        let (appended, _) = broadcast::channel(APPEND_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(MemoryLogInner::default()),
            appended,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryLogInner>> {
        self.inner.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryLogInner>> {
        self.inner.write().map_err(|_| StoreError::LockPoisoned)
    }

    /// Every stored entry, ordered by log then seq.
    pub fn all_entries(&self) -> Result<Vec<Entry>> {
        let inner = self.read()?;
        let mut keys: Vec<&LogKey> = inner.logs.keys().collect();
        keys.sort();
        Ok(keys
            .into_iter()
            .flat_map(|k| inner.logs[k].values().map(|s| s.entry.clone()))
            .collect())
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

fn contiguous_length(entries: &BTreeMap<u64, StoredEntry>) -> u64 {
    let mut length = 0;
    for &seq in entries.keys() {
        if seq != length + 1 {
            break;
        }
        length = seq;
    }
    length
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert_entry(&self, entry: &Entry) -> Result<InsertResult> {
        let id = entry.compute_id();
        let log = *entry.log();
        let seq = entry.seq();

        {
            let mut inner = self.write()?;
            let positions = inner.logs.entry(log).or_default();

            if let Some(existing) = positions.get(&seq) {
                if existing.id == id {
                    return Ok(InsertResult::AlreadyExists);
                }
                return Ok(InsertResult::Conflict {
                    existing: existing.id,
                });
            }

            positions.insert(
                seq,
                StoredEntry {
                    id,
                    entry: entry.clone(),
                },
            );
        }

        // No receivers is fine.
        let _ = self.appended.send(Appended { log, seq });
        Ok(InsertResult::Inserted)
    }

    async fn get_entry(&self, log: &LogKey, seq: u64) -> Result<Option<Entry>> {
        let inner = self.read()?;
        Ok(inner
            .logs
            .get(log)
            .and_then(|l| l.get(&seq))
            .map(|s| s.entry.clone()))
    }

    async fn get_range(&self, log: &LogKey, start: u64, end: u64) -> Result<Vec<Entry>> {
        if start > end {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        Ok(inner
            .logs
            .get(log)
            .map(|l| l.range(start..=end).map(|(_, s)| s.entry.clone()).collect())
            .unwrap_or_default())
    }

    async fn length(&self, log: &LogKey) -> Result<u64> {
        let inner = self.read()?;
        Ok(inner.logs.get(log).map(contiguous_length).unwrap_or(0))
    }

    async fn lengths(&self) -> Result<LogLengths> {
        let inner = self.read()?;
        Ok(inner
            .logs
            .iter()
            .map(|(k, l)| (*k, contiguous_length(l)))
            .collect())
    }

    async fn downloaded_count(&self, log: &LogKey, from: u64, to: u64) -> Result<u64> {
        if from >= to {
            return Ok(0);
        }
        let inner = self.read()?;
        Ok(inner
            .logs
            .get(log)
            .map(|l| l.range(from + 1..=to).count() as u64)
            .unwrap_or(0))
    }

    async fn record_fork(&self, log: &LogKey, seq: u64, entry_id: &EntryId) -> Result<()> {
        let mut inner = self.write()?;
        let forks = inner.forks.entry(*log).or_default();

        if !forks.iter().any(|f| f.seq == seq && f.entry_id == *entry_id) {
            forks.push(Fork {
                log: *log,
                seq,
                entry_id: *entry_id,
                detected_at: now_millis(),
            });
        }

        Ok(())
    }

    async fn get_forks(&self, log: &LogKey) -> Result<Vec<Fork>> {
        let inner = self.read()?;
        Ok(inner.forks.get(log).cloned().unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<Appended> {
        self.appended.subscribe()
    }
}

/// In-memory media store.
#[derive(Default)]
pub struct MemoryMediaStore {
    blobs: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn list(&self) -> Result<Vec<String>> {
        let blobs = self.blobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(blobs.keys().cloned().collect())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let blobs = self.blobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(blobs.contains_key(name))
    }

    async fn read(&self, name: &str) -> Result<Option<Bytes>> {
        let blobs = self.blobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(blobs.get(name).cloned())
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        validate_media_name(name)?;
        let mut blobs = self.blobs.write().map_err(|_| StoreError::LockPoisoned)?;
        blobs.insert(name.to_string(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::{EntryBuilder, Keypair};

    fn chain(keypair: &Keypair, name: &str, n: u64) -> Vec<Entry> {
        let author = keypair.device_id();
        let log = LogKey::derive(&author, name);
        let mut out: Vec<Entry> = Vec::new();
        for seq in 1..=n {
            let mut builder = EntryBuilder::new(author, log, seq)
                .timestamp(1_700_000_000_000 + seq as i64)
                .payload(format!("{name} {seq}"));
            if let Some(last) = out.last() {
                builder = builder.prev(last.compute_id());
            }
            out.push(builder.sign(keypair));
        }
        out
    }

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryLogStore::new();
        let keypair = Keypair::generate();
        let entries = chain(&keypair, "obs", 3);

        for e in &entries {
            assert_eq!(store.insert_entry(e).await.unwrap(), InsertResult::Inserted);
        }

        let log = *entries[0].log();
        assert_eq!(store.length(&log).await.unwrap(), 3);
        assert_eq!(store.get_entry(&log, 2).await.unwrap().unwrap(), entries[1]);
        assert_eq!(store.get_range(&log, 2, 3).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_idempotent() {
        let store = MemoryLogStore::new();
        let keypair = Keypair::generate();
        let entry = chain(&keypair, "obs", 1).remove(0);

        assert_eq!(store.insert_entry(&entry).await.unwrap(), InsertResult::Inserted);
        assert_eq!(
            store.insert_entry(&entry).await.unwrap(),
            InsertResult::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_conflict_and_fork_evidence() {
        let store = MemoryLogStore::new();
        let keypair = Keypair::generate();
        let author = keypair.device_id();
        let log = LogKey::derive(&author, "obs");
        let a = EntryBuilder::new(author, log, 1).payload("a").sign(&keypair);
        let b = EntryBuilder::new(author, log, 1).payload("b").sign(&keypair);

        store.insert_entry(&a).await.unwrap();
        let result = store.insert_entry(&b).await.unwrap();
        assert_eq!(
            result,
            InsertResult::Conflict {
                existing: a.compute_id()
            }
        );

        store.record_fork(&log, 1, &b.compute_id()).await.unwrap();
        store.record_fork(&log, 1, &b.compute_id()).await.unwrap();
        let forks = store.get_forks(&log).await.unwrap();
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].entry_id, b.compute_id());
    }

    #[tokio::test]
    async fn test_length_stops_at_gap() {
        let store = MemoryLogStore::new();
        let keypair = Keypair::generate();
        let entries = chain(&keypair, "obs", 4);
        let log = *entries[0].log();

        store.insert_entry(&entries[0]).await.unwrap();
        store.insert_entry(&entries[2]).await.unwrap();
        store.insert_entry(&entries[3]).await.unwrap();

        assert_eq!(store.length(&log).await.unwrap(), 1);
        assert_eq!(store.downloaded_count(&log, 0, 4).await.unwrap(), 3);
        assert_eq!(store.downloaded_count(&log, 1, 3).await.unwrap(), 1);

        store.insert_entry(&entries[1]).await.unwrap();
        assert_eq!(store.length(&log).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_subscribe_sees_inserts() {
        let store = MemoryLogStore::new();
        let mut rx = store.subscribe();
        let keypair = Keypair::generate();
        let entry = chain(&keypair, "obs", 1).remove(0);

        store.insert_entry(&entry).await.unwrap();
        // Duplicates are not announced.
        store.insert_entry(&entry).await.unwrap();

        let appended = rx.recv().await.unwrap();
        assert_eq!(appended, Appended { log: *entry.log(), seq: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_media_store() {
        let store = MemoryMediaStore::new();
        store
            .write("original/a.jpg", Bytes::from_static(b"jpeg"))
            .await
            .unwrap();
        assert!(store.exists("original/a.jpg").await.unwrap());
        assert_eq!(
            store.read("original/a.jpg").await.unwrap().unwrap(),
            Bytes::from_static(b"jpeg")
        );
        assert_eq!(store.list().await.unwrap(), vec!["original/a.jpg".to_string()]);
        assert!(store.write("../x", Bytes::new()).await.is_err());
    }
}
