//! Persistent local key-value store.
//!
//! Records live in named partitions: confirmed entities (one partition per
//! entity type), pending operations, and user preferences. Every backend keeps
//! a per-partition monotonic counter next to the data so sequenced partitions
//! come back in ascending order without relying on an engine-specific
//! auto-increment.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use waybill_core::EntityType;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database could not be opened; callers fall back to
    /// "nothing persisted".
    #[error("local store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record in {partition}: {reason}")]
    Corrupt { partition: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Named group of records ("object store").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partition {
    Entities(EntityType),
    /// Single FIFO partition for every queued mutation.
    PendingOperations,
    Preferences,
}

impl Partition {
    pub fn name(&self) -> String {
        match self {
            Partition::Entities(ty) => format!("entities:{}", ty.as_str()),
            Partition::PendingOperations => "pending_operations".to_string(),
            Partition::Preferences => "preferences".to_string(),
        }
    }
}

impl core::fmt::Display for Partition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name())
    }
}

/// One stored value with its key and ordering sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    /// Sequence assigned by [`LocalStore::put_sequenced`]; `0` for keyed puts.
    pub seq: u64,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

/// Asynchronous, durable key-value storage.
///
/// A record written by `put` is only guaranteed visible to other callers once
/// the returned future has completed.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Upsert `value` under `key`.
    async fn put(&self, partition: &Partition, key: &str, value: &Value) -> StoreResult<()>;

    /// Upsert `value` under a sequence previously handed out by
    /// [`next_sequence`](Self::next_sequence); the key is the decimal sequence.
    async fn put_sequenced(&self, partition: &Partition, seq: u64, value: &Value) -> StoreResult<()>;

    /// Point lookup; `Ok(None)` when the key is absent.
    async fn get(&self, partition: &Partition, key: &str) -> StoreResult<Option<Record>>;

    /// Every record, ascending by sequence then key.
    async fn get_all(&self, partition: &Partition) -> StoreResult<Vec<Record>>;

    /// Idempotent delete.
    async fn remove(&self, partition: &Partition, key: &str) -> StoreResult<()>;

    async fn clear(&self, partition: &Partition) -> StoreResult<()>;

    /// Allocate the next value of the partition's counter (starts at 1, never reused).
    async fn next_sequence(&self, partition: &Partition) -> StoreResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_names_are_stable() {
        assert_eq!(
            Partition::Entities(EntityType::Shipment).name(),
            "entities:SHIPMENT"
        );
        assert_eq!(Partition::PendingOperations.name(), "pending_operations");
        assert_eq!(Partition::Preferences.to_string(), "preferences");
    }
}
