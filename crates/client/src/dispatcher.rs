//! Connectivity-aware request entry point for the application.
//!
//! Reads go to the network and fall back to cached snapshots. Mutations go to
//! the network while online; when offline (or when the request cannot reach
//! the backend) they are queued and a deferred-success response is returned
//! right away.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use waybill_core::{CachedEntity, EntityType, HttpMethod, OperationType, QueueId, TempId, server_id_of};

use crate::api::{ApiClient, ApiError, ErrorClass};
use crate::cache::{EntityCache, entity_payload};
use crate::connectivity::{Connectivity, ConnectivityProbe};
use crate::queue::{Mutation, OfflineQueue, QueueError, entity_id_from_url};
use crate::transport::{ApiRequest, ApiResponse};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The mutation could not be queued and the direct attempt failed too.
    #[error("mutation could not be sent or queued: {source}")]
    NotQueued {
        #[source]
        source: QueueError,
        attempt: Option<ApiError>,
    },
}

impl DispatchError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            DispatchError::Api(err) => Some(err.class()),
            DispatchError::NotQueued { attempt, .. } => attempt.as_ref().map(ApiError::class),
        }
    }
}

/// Synthesized reply for a mutation that was queued instead of sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredSuccess {
    pub success: bool,
    pub offline_operation: bool,
    /// Only for creates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
    #[serde(skip)]
    pub queue_id: QueueId,
}

impl DeferredSuccess {
    fn new(queue_id: QueueId, temp_id: Option<TempId>) -> Self {
        Self {
            success: true,
            offline_operation: true,
            temp_id,
            queue_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResponse {
    /// The backend answered.
    Live(ApiResponse),
    /// Queued for replay.
    Deferred(DeferredSuccess),
    /// The backend was unreachable; this is the last known snapshot.
    Cached(CachedEntity),
}

impl DispatchResponse {
    /// JSON body as the caller would see it from the server.
    pub fn body(&self) -> Value {
        match self {
            DispatchResponse::Live(resp) => resp.body.clone(),
            DispatchResponse::Deferred(deferred) => serde_json::to_value(deferred).unwrap_or(Value::Null),
            DispatchResponse::Cached(entity) => entity.payload.clone(),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, DispatchResponse::Deferred(_))
    }

    pub fn temp_id(&self) -> Option<&TempId> {
        match self {
            DispatchResponse::Deferred(deferred) => deferred.temp_id.as_ref(),
            _ => None,
        }
    }
}

pub struct RequestDispatcher {
    api: ApiClient,
    queue: Arc<OfflineQueue>,
    cache: EntityCache,
    probe: Arc<dyn ConnectivityProbe>,
}

impl RequestDispatcher {
    pub fn new(
        api: ApiClient,
        queue: Arc<OfflineQueue>,
        cache: EntityCache,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self {
            api,
            queue,
            cache,
            probe,
        }
    }

    pub async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<Value>,
        headers: Vec<(String, String)>,
    ) -> Result<DispatchResponse, DispatchError> {
        let mut request = ApiRequest::new(method, url);
        request.body = body;
        request.headers = headers;

        if method == HttpMethod::Get {
            return self.read(&request).await;
        }

        if self.probe.check().await == Connectivity::Offline {
            tracing::debug!(%method, url, "offline; deferring mutation");
            return self.defer(&request, None).await;
        }

        if self.queued_ahead(&request).await {
            tracing::debug!(%method, url, "queued work on this entity; deferring mutation");
            return self.defer(&request, None).await;
        }

        match self.api.execute(&request).await {
            Ok(response) => {
                self.probe.report(Connectivity::Online);
                self.write_through(&request, &response).await;
                Ok(DispatchResponse::Live(response))
            }
            Err(err) if err.class() == ErrorClass::Connectivity => {
                tracing::info!(%method, url, "backend unreachable; deferring mutation: {err}");
                self.probe.report(Connectivity::Offline);
                self.defer(&request, Some(err)).await
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, url: &str) -> Result<DispatchResponse, DispatchError> {
        self.request(HttpMethod::Get, url, None, Vec::new()).await
    }

    pub async fn post(&self, url: &str, body: Value) -> Result<DispatchResponse, DispatchError> {
        self.request(HttpMethod::Post, url, Some(body), Vec::new()).await
    }

    pub async fn put(&self, url: &str, body: Value) -> Result<DispatchResponse, DispatchError> {
        self.request(HttpMethod::Put, url, Some(body), Vec::new()).await
    }

    pub async fn patch(&self, url: &str, body: Value) -> Result<DispatchResponse, DispatchError> {
        self.request(HttpMethod::Patch, url, Some(body), Vec::new()).await
    }

    pub async fn delete(&self, url: &str) -> Result<DispatchResponse, DispatchError> {
        self.request(HttpMethod::Delete, url, None, Vec::new()).await
    }

    async fn read(&self, request: &ApiRequest) -> Result<DispatchResponse, DispatchError> {
        let entity_type = EntityType::from_url(&request.path);
        let entity_id = entity_id_from_url(&request.path);

        if self.probe.check().await == Connectivity::Offline {
            if let Some(entity) = self.cached(&entity_type, entity_id.as_deref()).await {
                return Ok(DispatchResponse::Cached(entity));
            }
        }

        match self.api.execute(request).await {
            Ok(response) => {
                self.probe.report(Connectivity::Online);
                self.cache_read(&entity_type, &response.body).await;
                Ok(DispatchResponse::Live(response))
            }
            Err(err) if err.class() == ErrorClass::Connectivity => {
                self.probe.report(Connectivity::Offline);
                match self.cached(&entity_type, entity_id.as_deref()).await {
                    Some(entity) => {
                        tracing::debug!(url = %request.path, "serving cached snapshot");
                        Ok(DispatchResponse::Cached(entity))
                    }
                    None => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn cached(&self, entity_type: &EntityType, id: Option<&str>) -> Option<CachedEntity> {
        let id = id?;
        match self.cache.get_entity(entity_type, id).await {
            Ok(entity) => entity,
            Err(err) => {
                tracing::warn!("entity cache unavailable: {err}");
                None
            }
        }
    }

    /// Queue `request` and answer with a deferred success.
    ///
    /// `attempt` is the connectivity error that sent us here, if the network
    /// was already tried.
    /// Whether the queue holds work this mutation must not overtake.
    async fn queued_ahead(&self, request: &ApiRequest) -> bool {
        let payload = request.body.clone().unwrap_or(Value::Null);
        let mutation = Mutation::new(request.method, request.path.clone(), payload);
        match self.queue.blocks_live(&mutation).await {
            Ok(blocked) => blocked,
            Err(err) => {
                tracing::warn!(url = %request.path, "could not inspect offline queue: {err}");
                false
            }
        }
    }

    async fn defer(
        &self,
        request: &ApiRequest,
        attempt: Option<ApiError>,
    ) -> Result<DispatchResponse, DispatchError> {
        let payload = request.body.clone().unwrap_or(Value::Null);
        let mut mutation = Mutation::new(request.method, request.path.clone(), payload.clone());
        let temp_id = (request.method.operation_type() == Some(OperationType::Create)).then(TempId::generate);
        if let Some(temp_id) = &temp_id {
            mutation = mutation.temp_id(temp_id.clone());
        }
        let entity_type = EntityType::from_url(&request.path);

        let queue_id = match self.queue.enqueue(mutation).await {
            Ok(id) => id,
            Err(source) => {
                tracing::warn!(url = %request.path, "failed to queue mutation: {source}");
                // Without a working store the mutation has to go out directly.
                let attempt = match attempt {
                    Some(err) => Some(err),
                    None => match self.api.execute(request).await {
                        Ok(response) => return Ok(DispatchResponse::Live(response)),
                        Err(err) => Some(err),
                    },
                };
                return Err(DispatchError::NotQueued { source, attempt });
            }
        };

        self.optimistic_write(&entity_type, request, temp_id.as_ref(), &payload).await;
        Ok(DispatchResponse::Deferred(DeferredSuccess::new(queue_id, temp_id)))
    }

    async fn optimistic_write(
        &self,
        entity_type: &EntityType,
        request: &ApiRequest,
        temp_id: Option<&TempId>,
        payload: &Value,
    ) {
        let result = match (request.method.operation_type(), temp_id) {
            (Some(OperationType::Create), Some(temp_id)) => {
                let mut snapshot = payload.clone();
                if let Some(obj) = snapshot.as_object_mut() {
                    obj.insert("id".to_string(), Value::String(temp_id.to_string()));
                }
                let entity = CachedEntity::optimistic(temp_id.as_str(), entity_type.clone(), snapshot);
                self.cache.cache_entity(&entity).await
            }
            (Some(OperationType::Update), _) => {
                let Some(id) = entity_id_from_url(&request.path) else {
                    return;
                };
                match self.cache.get_entity(entity_type, &id).await {
                    Ok(Some(mut entity)) => {
                        entity.merge_payload(payload);
                        entity.last_synced_at = None;
                        self.cache.cache_entity(&entity).await
                    }
                    other => other.map(|_| ()),
                }
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::warn!("optimistic cache write failed: {err}");
        }
    }

    async fn write_through(&self, request: &ApiRequest, response: &ApiResponse) {
        let entity_type = EntityType::from_url(&request.path);
        let result = match request.method {
            HttpMethod::Delete => match entity_id_from_url(&request.path) {
                Some(id) => self.cache.remove_entity(&entity_type, &id).await,
                None => Ok(()),
            },
            _ => {
                self.cache_read(&entity_type, &response.body).await;
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::warn!("cache write-through failed: {err}");
        }
    }

    /// Cache every entity with an id found in `body` (single object or list).
    async fn cache_read(&self, entity_type: &EntityType, body: &Value) {
        let payload = entity_payload(body);
        let items: Vec<&Value> = if let Some(items) = payload.as_array() {
            items.iter().collect()
        } else if let Some(items) = body.get("data").and_then(Value::as_array) {
            items.iter().collect()
        } else if payload.is_object() {
            vec![payload]
        } else {
            Vec::new()
        };

        for item in items {
            let Some(id) = server_id_of(item) else {
                continue;
            };
            let entity = CachedEntity::confirmed(id, entity_type.clone(), item.clone());
            if let Err(err) = self.cache.cache_entity(&entity).await {
                tracing::warn!("read-through cache write failed: {err}");
                return;
            }
        }
    }
}

impl core::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RequestDispatcher").finish_non_exhaustive()
    }
}
