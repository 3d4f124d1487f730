//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use bytes::Bytes;

use fieldsync_core::{
    DeviceId, DeviceType, Entry, EntryBuilder, EntryId, Keypair, LogKey, ProjectKey,
};
use fieldsync_store::{LogStore, MediaStore, MemoryLogStore, MemoryMediaStore};
use fieldsync_sync::HandshakePayload;

/// A device with a deterministic keypair and in-memory stores.
pub struct TestDevice {
    pub keypair: Keypair,
    pub device_type: DeviceType,
    pub logs: Arc<MemoryLogStore>,
    pub media: Arc<MemoryMediaStore>,
}

impl TestDevice {
    /// A desktop whose keypair is derived from `seed`.
    pub fn new(seed: u8) -> Self {
        Self::with_keypair(Keypair::from_seed(&[seed; 32]))
    }

    /// A desktop with a random keypair.
    pub fn random() -> Self {
        Self::with_keypair(Keypair::generate())
    }

    fn with_keypair(keypair: Keypair) -> Self {
        Self {
            keypair,
            device_type: DeviceType::Desktop,
            logs: Arc::new(MemoryLogStore::new()),
            media: Arc::new(MemoryMediaStore::new()),
        }
    }

    pub fn mobile(mut self) -> Self {
        self.device_type = DeviceType::Mobile;
        self
    }

    pub fn id(&self) -> DeviceId {
        self.keypair.device_id()
    }

    pub fn log_key(&self, name: &str) -> LogKey {
        LogKey::derive(&self.id(), name)
    }

    /// Handshake payload for this device in `project`.
    pub fn payload(&self, project: &ProjectKey) -> HandshakePayload {
        HandshakePayload::new(self.id(), self.device_type, format!("device {}", self.id()))
            .with_project(project.discovery_key())
    }

    /// A signed entry of log `name`.
    pub fn entry(&self, name: &str, seq: u64, prev: Option<EntryId>) -> Entry {
        let mut builder = EntryBuilder::new(self.id(), self.log_key(name), seq)
            .timestamp(seq as i64)
            .payload(format!("{name} #{seq}"));
        if let Some(prev) = prev {
            builder = builder.prev(prev);
        }
        builder.sign(&self.keypair)
    }

    /// Entries 1..=n of log `name`, correctly linked.
    pub fn chain(&self, name: &str, n: u64) -> Vec<Entry> {
        let mut entries: Vec<Entry> = Vec::with_capacity(n as usize);
        for seq in 1..=n {
            let prev = entries.last().map(Entry::compute_id);
            entries.push(self.entry(name, seq, prev));
        }
        entries
    }

    /// Append `n` entries to log `name` in this device's store.
    pub async fn append(&self, name: &str, n: u64) {
        let key = self.log_key(name);
        let start = self.logs.length(&key).await.expect("length");
        let mut prev = match start {
            0 => None,
            len => self
                .logs
                .get_entry(&key, len)
                .await
                .expect("get entry")
                .map(|e| e.compute_id()),
        };
        for seq in start + 1..=start + n {
            let entry = self.entry(name, seq, prev);
            prev = Some(entry.compute_id());
            self.logs.insert_entry(&entry).await.expect("insert");
        }
    }

    /// Store a blob whose content is derived from its name.
    pub async fn put_media(&self, name: &str) {
        self.media
            .write(name, blob(name))
            .await
            .expect("write media");
    }
}

/// Deterministic content for a media name.
pub fn blob(name: &str) -> Bytes {
    Bytes::from(format!("blob:{name}"))
}

/// Create several devices with distinct deterministic keys.
pub fn devices(count: usize) -> Vec<TestDevice> {
    (0..count).map(|i| TestDevice::new(i as u8 + 1)).collect()
}
