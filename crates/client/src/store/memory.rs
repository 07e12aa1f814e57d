use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{LocalStore, Partition, Record, StoreResult};

#[derive(Default)]
struct Inner {
    records: HashMap<String, BTreeMap<String, Record>>,
    sequences: HashMap<String, u64>,
}

/// Process-local store; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert(&self, partition: &Partition, key: String, seq: u64, value: &Value) {
        let record = Record {
            key: key.clone(),
            seq,
            value: value.clone(),
            updated_at: Utc::now(),
        };
        self.lock()
            .records
            .entry(partition.name())
            .or_default()
            .insert(key, record);
    }
}

impl core::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryStore")
            .field("partitions", &inner.records.len())
            .finish()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn put(&self, partition: &Partition, key: &str, value: &Value) -> StoreResult<()> {
        self.upsert(partition, key.to_string(), 0, value);
        Ok(())
    }

    async fn put_sequenced(&self, partition: &Partition, seq: u64, value: &Value) -> StoreResult<()> {
        self.upsert(partition, seq.to_string(), seq, value);
        Ok(())
    }

    async fn get(&self, partition: &Partition, key: &str) -> StoreResult<Option<Record>> {
        Ok(self
            .lock()
            .records
            .get(&partition.name())
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn get_all(&self, partition: &Partition) -> StoreResult<Vec<Record>> {
        let mut all: Vec<Record> = self
            .lock()
            .records
            .get(&partition.name())
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.key.cmp(&b.key)));
        Ok(all)
    }

    async fn remove(&self, partition: &Partition, key: &str) -> StoreResult<()> {
        if let Some(records) = self.lock().records.get_mut(&partition.name()) {
            records.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, partition: &Partition) -> StoreResult<()> {
        self.lock().records.remove(&partition.name());
        Ok(())
    }

    async fn next_sequence(&self, partition: &Partition) -> StoreResult<u64> {
        let mut inner = self.lock();
        let counter = inner.sequences.entry(partition.name()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}
