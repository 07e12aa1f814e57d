//! Typed facades over the local store: cached entities and user preferences.

use std::sync::Arc;

use serde_json::Value;

use waybill_core::{CachedEntity, EntityType};

use crate::store::{LocalStore, Partition, StoreError, StoreResult};

/// The entity object inside a response body: `data` when the server wraps it,
/// otherwise the body itself.
pub fn entity_payload(body: &Value) -> &Value {
    match body.get("data") {
        Some(inner @ Value::Object(_)) => inner,
        _ => body,
    }
}

/// Confirmed and optimistic entity snapshots, one partition per entity type.
#[derive(Clone)]
pub struct EntityCache {
    store: Arc<dyn LocalStore>,
}

impl EntityCache {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub async fn cache_entity(&self, entity: &CachedEntity) -> StoreResult<()> {
        let value = serde_json::to_value(entity)?;
        self.store
            .put(&Partition::Entities(entity.entity_type.clone()), &entity.id, &value)
            .await
    }

    pub async fn get_entity(&self, entity_type: &EntityType, id: &str) -> StoreResult<Option<CachedEntity>> {
        let partition = Partition::Entities(entity_type.clone());
        match self.store.get(&partition, id).await? {
            Some(record) => decode(&partition, record.value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn list_entities(&self, entity_type: &EntityType) -> StoreResult<Vec<CachedEntity>> {
        let partition = Partition::Entities(entity_type.clone());
        self.store
            .get_all(&partition)
            .await?
            .into_iter()
            .map(|record| decode(&partition, record.value))
            .collect()
    }

    pub async fn remove_entity(&self, entity_type: &EntityType, id: &str) -> StoreResult<()> {
        self.store.remove(&Partition::Entities(entity_type.clone()), id).await
    }

    pub async fn clear_entities(&self, entity_type: &EntityType) -> StoreResult<()> {
        self.store.clear(&Partition::Entities(entity_type.clone())).await
    }

    /// Move the snapshot stored under `temp_id` to `real_id`, marking it confirmed.
    ///
    /// `server_state` (the confirmed entity returned by the server) is merged
    /// over whatever was rendered optimistically. Returns the stored snapshot.
    pub async fn replace_id(
        &self,
        entity_type: &EntityType,
        temp_id: &str,
        real_id: &str,
        server_state: Option<&Value>,
    ) -> StoreResult<CachedEntity> {
        let optimistic = self.get_entity(entity_type, temp_id).await?;

        let mut entity = match optimistic {
            Some(mut entity) => {
                entity.id = real_id.to_string();
                entity
            }
            None => CachedEntity::optimistic(real_id, entity_type.clone(), Value::Object(Default::default())),
        };
        if let Some(state) = server_state {
            entity.merge_payload(state);
        }
        if let Some(obj) = entity.payload.as_object_mut() {
            if obj.get("id").and_then(Value::as_str) == Some(temp_id) {
                obj.insert("id".to_string(), Value::String(real_id.to_string()));
            }
        }
        entity.last_synced_at = Some(chrono::Utc::now());

        self.cache_entity(&entity).await?;
        self.remove_entity(entity_type, temp_id).await?;
        Ok(entity)
    }
}

fn decode(partition: &Partition, value: Value) -> StoreResult<CachedEntity> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        partition: partition.name(),
        reason: e.to_string(),
    })
}

impl core::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityCache").finish_non_exhaustive()
    }
}

/// Small scalar user settings (and persisted credentials).
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn LocalStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub async fn get_preference(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .store
            .get(&Partition::Preferences, key)
            .await?
            .map(|record| record.value))
    }

    pub async fn set_preference(&self, key: &str, value: Value) -> StoreResult<()> {
        self.store.put(&Partition::Preferences, key, &value).await
    }

    pub async fn remove_preference(&self, key: &str) -> StoreResult<()> {
        self.store.remove(&Partition::Preferences, key).await
    }
}

impl core::fmt::Debug for Preferences {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Preferences").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn cache() -> EntityCache {
        EntityCache::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn replace_id_moves_optimistic_snapshot_and_confirms_it() {
        let cache = cache();
        let ty = EntityType::Shipment;
        cache
            .cache_entity(&CachedEntity::optimistic(
                "temp_abc",
                ty.clone(),
                json!({"id": "temp_abc", "origin": "Jakarta"}),
            ))
            .await
            .unwrap();

        let stored = cache
            .replace_id(&ty, "temp_abc", "ship_123", Some(&json!({"status": "booked"})))
            .await
            .unwrap();

        assert!(stored.is_confirmed());
        assert_eq!(stored.payload["id"], json!("ship_123"));
        assert_eq!(stored.payload["origin"], json!("Jakarta"));
        assert_eq!(stored.payload["status"], json!("booked"));
        assert!(cache.get_entity(&ty, "temp_abc").await.unwrap().is_none());
        assert_eq!(cache.list_entities(&ty).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn entity_types_do_not_share_partitions() {
        let cache = cache();
        cache
            .cache_entity(&CachedEntity::confirmed("1", EntityType::Customer, json!({})))
            .await
            .unwrap();

        assert!(cache.get_entity(&EntityType::Invoice, "1").await.unwrap().is_none());
        cache.clear_entities(&EntityType::Customer).await.unwrap();
        assert!(cache.list_entities(&EntityType::Customer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preferences_round_trip() {
        let prefs = Preferences::new(Arc::new(MemoryStore::new()));
        prefs.set_preference("theme", json!("dark")).await.unwrap();
        assert_eq!(prefs.get_preference("theme").await.unwrap(), Some(json!("dark")));

        prefs.remove_preference("theme").await.unwrap();
        prefs.remove_preference("theme").await.unwrap();
        assert_eq!(prefs.get_preference("theme").await.unwrap(), None);
    }

    #[test]
    fn entity_payload_unwraps_data_envelope() {
        let wrapped = json!({"success": true, "data": {"id": "x"}});
        assert_eq!(entity_payload(&wrapped), &json!({"id": "x"}));
        let flat = json!({"id": "y"});
        assert_eq!(entity_payload(&flat), &flat);
    }
}
