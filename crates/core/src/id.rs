//! Identifiers used by the offline queue and the entity cache.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;

/// Prefix carried by every client-generated temporary identifier.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Position of a pending operation in the durable queue.
///
/// Allocated from a persisted monotonic counter: ascending, gaps allowed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(u64);

impl QueueId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for QueueId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for QueueId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for QueueId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| ModelError::invalid_id(format!("QueueId: {e}")))
    }
}

/// Identifier handed to the UI for a CREATE that has not reached the server yet.
///
/// Replaced by the server-assigned id once the queued CREATE is replayed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(String);

impl TempId {
    /// Generate a fresh temporary id (`temp_<uuidv7>`).
    ///
    /// UUIDv7 keeps ids time-ordered, which makes queue dumps easier to read.
    pub fn generate() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `candidate` looks like a client-generated temporary id.
    pub fn is_temp(candidate: &str) -> bool {
        candidate.len() > TEMP_ID_PREFIX.len() && candidate.starts_with(TEMP_ID_PREFIX)
    }
}

impl core::fmt::Display for TempId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TempId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_temp(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(ModelError::invalid_id(format!(
                "TempId: expected '{TEMP_ID_PREFIX}' prefix, got '{s}'"
            )))
        }
    }
}

impl AsRef<str> for TempId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_temp_ids_are_prefixed_and_unique() {
        let a = TempId::generate();
        let b = TempId::generate();

        assert!(a.as_str().starts_with("temp_"));
        assert_ne!(a, b);
        assert!(TempId::is_temp(a.as_str()));
    }

    #[test]
    fn temp_id_parse_rejects_server_ids() {
        assert!("ship_123".parse::<TempId>().is_err());
        assert!("temp_".parse::<TempId>().is_err());
        assert_eq!(
            "temp_abc".parse::<TempId>().unwrap().as_str(),
            "temp_abc"
        );
    }

    #[test]
    fn queue_ids_order_numerically() {
        let mut ids = vec![QueueId::new(10), QueueId::new(2), QueueId::new(7)];
        ids.sort();
        assert_eq!(ids, vec![QueueId::new(2), QueueId::new(7), QueueId::new(10)]);
        assert_eq!("42".parse::<QueueId>().unwrap(), QueueId::new(42));
    }
}
