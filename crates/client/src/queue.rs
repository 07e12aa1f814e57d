//! Durable queue of mutations waiting for the network.
//!
//! Every queued operation lives in the single pending-operations partition,
//! keyed by a persisted monotonic sequence, so a drain replays them in global
//! enqueue order.
//!
//! Drain rules:
//! - connectivity or authentication failure: stop, everything left stays queued
//! - 4xx rejection: flag the operation `NeedsAttention`, continue
//! - 5xx / undecodable reply: count an attempt (flag once the cap is reached),
//!   hold back later operations on the same entity, continue
//! - an operation that references a temporary id whose CREATE has not been
//!   confirmed is deferred
//!
//! A drain that runs while an `enqueue` is still persisting may or may not see
//! the new record; the next drain picks it up.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use waybill_core::{
    CachedEntity, EntityType, HttpMethod, ModelError, OperationStatus, OperationType,
    PendingOperation, QueueId, TempId, server_id_of,
};
use waybill_events::SyncEvent;

use crate::SyncBus;
use crate::api::{ApiClient, ApiError, ErrorClass};
use crate::cache::{EntityCache, entity_payload};
use crate::store::{LocalStore, Partition, Record, StoreError};
use crate::transport::{ApiRequest, ApiResponse};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("queued operation {0} not found")]
    NotFound(QueueId),

    #[error("failed to encode operation: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A mutation to defer.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub method: HttpMethod,
    pub url: String,
    /// Derived from the URL when absent.
    pub entity_type: Option<EntityType>,
    /// Derived from the URL for updates and deletes when absent.
    pub entity_id: Option<String>,
    pub payload: Value,
    pub temp_id: Option<TempId>,
}

impl Mutation {
    pub fn new(method: HttpMethod, url: impl Into<String>, payload: Value) -> Self {
        Self {
            method,
            url: url.into(),
            entity_type: None,
            entity_id: None,
            payload,
            temp_id: None,
        }
    }

    pub fn entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn temp_id(mut self, temp_id: TempId) -> Self {
        self.temp_id = Some(temp_id);
        self
    }
}

/// Id segment following the entity segment of `url` (`/shipments/42/cancel` → `42`).
pub fn entity_id_from_url(url: &str) -> Option<String> {
    let segments = waybill_core::entity::path_segments(url);
    let known = segments
        .iter()
        .rposition(|s| !matches!(EntityType::parse(s), EntityType::Other(_)));

    match known {
        Some(idx) => segments.get(idx + 1).cloned(),
        None if segments.len() >= 2 => segments.last().cloned(),
        None => None,
    }
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: Vec<QueueId>,
    /// `(temporary id, server id)` for every confirmed deferred create.
    pub reconciled: Vec<(TempId, String)>,
    pub flagged: Vec<QueueId>,
    pub deferred: Vec<QueueId>,
    /// Why the drain stopped early, if it did.
    pub aborted: Option<String>,
    /// Another drain was already running; nothing was attempted.
    pub skipped: bool,
    /// Operations still queued afterwards (flagged ones included).
    pub remaining: usize,
}

impl DrainReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    fn to_event(&self) -> SyncEvent {
        SyncEvent::DrainCompleted {
            replayed: self.replayed.len(),
            flagged: self.flagged.len(),
            deferred: self.deferred.len(),
            remaining: self.remaining,
            aborted: self.is_aborted(),
        }
    }
}

enum Replay {
    Abort(String),
    Flag(String),
    Transient(String),
}

pub struct OfflineQueue {
    store: Arc<dyn LocalStore>,
    cache: EntityCache,
    api: ApiClient,
    events: SyncBus,
    max_attempts: u32,
    /// Serializes sequence allocation with the write, so records become durable in id order.
    enqueue_lock: Mutex<()>,
    drain_lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(
        store: Arc<dyn LocalStore>,
        cache: EntityCache,
        api: ApiClient,
        events: SyncBus,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            cache,
            api,
            events,
            max_attempts: max_attempts.max(1),
            enqueue_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
        }
    }

    /// Persist `mutation`; the returned id orders it after everything queued before.
    pub async fn enqueue(&self, mutation: Mutation) -> Result<QueueId, QueueError> {
        let op = {
            let _guard = self.enqueue_lock.lock().await;
            let seq = self.store.next_sequence(&Partition::PendingOperations).await?;
            let op = build_operation(QueueId::new(seq), mutation)?;
            self.save(&op).await?;
            op
        };

        tracing::info!(
            queue_id = %op.queue_id,
            entity_type = %op.entity_type,
            operation_type = %op.operation_type,
            "mutation queued for replay"
        );
        crate::publish(
            &self.events,
            SyncEvent::OperationQueued {
                queue_id: op.queue_id,
                entity_type: op.entity_type.clone(),
                operation_type: op.operation_type,
                temp_id: op.temp_id.clone(),
            },
        );

        Ok(op.queue_id)
    }

    /// Whether sending `mutation` live would overtake queued work.
    ///
    /// True when it mentions a temporary id (its CREATE has not been confirmed
    /// by a drain yet) or when its entity still has queued operations.
    pub async fn blocks_live(&self, mutation: &Mutation) -> Result<bool, QueueError> {
        let candidate = build_operation(QueueId::new(0), mutation.clone())?;
        if !candidate.temp_dependencies().is_empty() {
            return Ok(true);
        }
        let key = entity_key(&candidate);
        Ok(self.operations().await?.iter().any(|op| entity_key(op) == key))
    }

    /// Every queued operation, oldest first.
    pub async fn operations(&self) -> Result<Vec<PendingOperation>, QueueError> {
        let records = self.store.get_all(&Partition::PendingOperations).await?;
        Ok(records.into_iter().filter_map(decode).collect())
    }

    /// Operations that the next drain will attempt.
    pub async fn pending(&self) -> Result<Vec<PendingOperation>, QueueError> {
        Ok(self
            .operations()
            .await?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .collect())
    }

    /// Operations parked until someone calls [`retry`](Self::retry) or [`discard`](Self::discard).
    pub async fn needs_attention(&self) -> Result<Vec<PendingOperation>, QueueError> {
        Ok(self
            .operations()
            .await?
            .into_iter()
            .filter(PendingOperation::needs_attention)
            .collect())
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.store.get_all(&Partition::PendingOperations).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    pub async fn get(&self, queue_id: QueueId) -> Result<Option<PendingOperation>, QueueError> {
        let record = self
            .store
            .get(&Partition::PendingOperations, &queue_id.to_string())
            .await?;
        Ok(record.and_then(decode))
    }

    /// Put a flagged operation back in line with a fresh attempt budget.
    pub async fn retry(&self, queue_id: QueueId) -> Result<PendingOperation, QueueError> {
        let mut op = self.get(queue_id).await?.ok_or(QueueError::NotFound(queue_id))?;
        op.status = OperationStatus::Pending;
        op.attempts = 0;
        op.last_error = None;
        self.save(&op).await?;
        tracing::info!(queue_id = %queue_id, "operation re-queued");
        Ok(op)
    }

    /// Drop an operation for good, along with its optimistic cache entry.
    pub async fn discard(&self, queue_id: QueueId) -> Result<PendingOperation, QueueError> {
        let op = self.get(queue_id).await?.ok_or(QueueError::NotFound(queue_id))?;
        self.store
            .remove(&Partition::PendingOperations, &queue_id.to_string())
            .await?;
        if let Some(temp_id) = &op.temp_id {
            self.cache.remove_entity(&op.entity_type, temp_id.as_str()).await?;
        }
        tracing::info!(queue_id = %queue_id, "operation discarded");
        Ok(op)
    }

    /// Replay queued operations in order.
    ///
    /// Returns immediately with [`DrainReport::skipped`] when another drain holds the queue.
    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            tracing::debug!("drain already running");
            return Ok(DrainReport::skipped());
        };

        let mut ops = self.operations().await?;
        tracing::info!(queued = ops.len(), "drain started");

        // Temp ids whose CREATE is still queued.
        let mut unresolved: HashSet<String> = ops
            .iter()
            .filter_map(|op| op.temp_id.as_ref().map(|t| t.as_str().to_string()))
            .collect();
        let mut held_back: HashSet<String> = HashSet::new();
        let mut report = DrainReport::default();

        for idx in 0..ops.len() {
            let op = ops[idx].clone();
            if op.needs_attention() {
                continue;
            }

            let key = entity_key(&op);
            let deps = op.temp_dependencies();
            if held_back.contains(&key) || deps.iter().any(|d| unresolved.contains(d)) {
                tracing::debug!(queue_id = %op.queue_id, "deferred behind an unconfirmed operation");
                held_back.insert(key);
                report.deferred.push(op.queue_id);
                continue;
            }
            if let Some(orphan) = deps.first() {
                let reason = format!("references unknown temporary id {orphan}");
                self.flag(&mut ops[idx], reason, &mut report).await?;
                continue;
            }

            match self.replay(&op).await {
                Ok(response) if op.temp_id.is_some() && server_id_of(&response.body).is_none() => {
                    // Dependents keep waiting on the temp id until this is retried or discarded.
                    let reason = "create confirmed without a server id".to_string();
                    self.flag(&mut ops[idx], reason, &mut report).await?;
                }
                Ok(response) => {
                    self.store
                        .remove(&Partition::PendingOperations, &op.queue_id.to_string())
                        .await?;
                    self.apply_confirmation(&op, &response, &mut ops[idx + 1..], &mut unresolved, &mut report)
                        .await?;
                    report.replayed.push(op.queue_id);
                    crate::publish(
                        &self.events,
                        SyncEvent::OperationReplayed {
                            queue_id: op.queue_id,
                            entity_type: op.entity_type.clone(),
                            operation_type: op.operation_type,
                        },
                    );
                }
                Err(outcome) => match outcome {
                    Replay::Abort(reason) => {
                        tracing::warn!(queue_id = %op.queue_id, "drain aborted: {reason}");
                        report.aborted = Some(reason);
                        break;
                    }
                    Replay::Flag(reason) => {
                        self.flag(&mut ops[idx], reason, &mut report).await?;
                    }
                    Replay::Transient(reason) => {
                        held_back.insert(key);
                        let current = &mut ops[idx];
                        current.attempts += 1;
                        if current.attempts >= self.max_attempts {
                            self.flag(current, reason, &mut report).await?;
                        } else {
                            current.last_error = Some(reason);
                            self.save(current).await?;
                            report.deferred.push(current.queue_id);
                        }
                    }
                },
            }
        }

        report.remaining = self.len().await?;
        tracing::info!(
            replayed = report.replayed.len(),
            reconciled = report.reconciled.len(),
            flagged = report.flagged.len(),
            deferred = report.deferred.len(),
            remaining = report.remaining,
            aborted = report.is_aborted(),
            "drain finished"
        );
        crate::publish(&self.events, report.to_event());
        Ok(report)
    }

    async fn replay(&self, op: &PendingOperation) -> Result<ApiResponse, Replay> {
        let mut request = ApiRequest::new(op.http_method, op.url.clone());
        if !(op.payload.is_null() && op.http_method == HttpMethod::Delete) {
            request = request.with_body(op.payload.clone());
        }

        self.api.execute(&request).await.map_err(|err: ApiError| {
            let class = err.class();
            tracing::warn!(queue_id = %op.queue_id, ?class, "replay failed: {err}");
            match class {
                ErrorClass::Connectivity | ErrorClass::Authentication => Replay::Abort(err.to_string()),
                ErrorClass::Rejected => Replay::Flag(err.to_string()),
                ErrorClass::Server | ErrorClass::Decode => Replay::Transient(err.to_string()),
            }
        })
    }

    async fn apply_confirmation(
        &self,
        op: &PendingOperation,
        response: &ApiResponse,
        later: &mut [PendingOperation],
        unresolved: &mut HashSet<String>,
        report: &mut DrainReport,
    ) -> Result<(), QueueError> {
        let server_state = entity_payload(&response.body);

        match op.operation_type {
            OperationType::Create => {
                let real_id = server_id_of(&response.body);
                match (&op.temp_id, real_id) {
                    (Some(temp_id), Some(real_id)) => {
                        for pending in later.iter_mut() {
                            if pending.rewrite_id(temp_id.as_str(), &real_id) {
                                self.save(pending).await?;
                            }
                        }
                        self.cache_update(
                            self.cache
                                .replace_id(&op.entity_type, temp_id.as_str(), &real_id, Some(server_state))
                                .await
                                .map(|_| ()),
                        );
                        unresolved.remove(temp_id.as_str());

                        tracing::info!(temp_id = %temp_id, real_id = %real_id, "temporary id reconciled");
                        crate::publish(
                            &self.events,
                            SyncEvent::IdReconciled {
                                temp_id: temp_id.clone(),
                                real_id: real_id.clone(),
                                entity_type: op.entity_type.clone(),
                            },
                        );
                        report.reconciled.push((temp_id.clone(), real_id));
                    }
                    (None, Some(real_id)) => {
                        let entity = CachedEntity::confirmed(real_id, op.entity_type.clone(), server_state.clone());
                        self.cache_update(self.cache.cache_entity(&entity).await);
                    }
                    (_, None) => {
                        tracing::warn!(queue_id = %op.queue_id, "create confirmed without a server id; nothing cached");
                    }
                }
            }
            OperationType::Update => {
                if let Some(id) = &op.entity_id {
                    let confirmed = if server_id_of(&response.body).is_some() {
                        CachedEntity::confirmed(id.clone(), op.entity_type.clone(), server_state.clone())
                    } else {
                        let mut entity = match self.cache.get_entity(&op.entity_type, id).await {
                            Ok(Some(entity)) => entity,
                            _ => CachedEntity::optimistic(id.clone(), op.entity_type.clone(), Value::Object(Default::default())),
                        };
                        entity.merge_payload(&op.payload);
                        entity.last_synced_at = Some(chrono::Utc::now());
                        entity
                    };
                    self.cache_update(self.cache.cache_entity(&confirmed).await);
                }
            }
            OperationType::Delete => {
                if let Some(id) = &op.entity_id {
                    self.cache_update(self.cache.remove_entity(&op.entity_type, id).await);
                }
            }
        }
        Ok(())
    }

    /// Cache writes after a confirmed replay are best-effort.
    fn cache_update(&self, result: Result<(), StoreError>) {
        if let Err(err) = result {
            tracing::warn!("failed to update entity cache after replay: {err}");
        }
    }

    async fn flag(
        &self,
        op: &mut PendingOperation,
        reason: String,
        report: &mut DrainReport,
    ) -> Result<(), QueueError> {
        op.status = OperationStatus::NeedsAttention;
        op.last_error = Some(reason.clone());
        self.save(op).await?;

        tracing::warn!(queue_id = %op.queue_id, attempts = op.attempts, "operation needs attention: {reason}");
        crate::publish(
            &self.events,
            SyncEvent::NeedsAttention {
                queue_id: op.queue_id,
                error: reason,
                attempts: op.attempts,
            },
        );
        report.flagged.push(op.queue_id);
        Ok(())
    }

    async fn save(&self, op: &PendingOperation) -> Result<(), QueueError> {
        let value = serde_json::to_value(op)?;
        self.store
            .put_sequenced(&Partition::PendingOperations, op.queue_id.value(), &value)
            .await?;
        Ok(())
    }
}

impl core::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

fn build_operation(queue_id: QueueId, mutation: Mutation) -> Result<PendingOperation, QueueError> {
    let entity_type = mutation
        .entity_type
        .unwrap_or_else(|| EntityType::from_url(&mutation.url));
    let entity_id = match (mutation.entity_id, mutation.method) {
        (Some(id), _) => Some(id),
        (None, HttpMethod::Post) => None,
        (None, _) => entity_id_from_url(&mutation.url),
    };

    let op = PendingOperation::new(
        queue_id,
        mutation.method,
        mutation.url,
        entity_type,
        entity_id,
        mutation.payload,
    )?;
    Ok(match mutation.temp_id {
        Some(temp_id) => op.with_temp_id(temp_id),
        None => op,
    })
}

fn entity_key(op: &PendingOperation) -> String {
    let id = op
        .entity_id
        .as_deref()
        .or(op.temp_id.as_ref().map(TempId::as_str))
        .unwrap_or(op.url.as_str());
    format!("{}:{id}", op.entity_type)
}

fn decode(record: Record) -> Option<PendingOperation> {
    match serde_json::from_value(record.value) {
        Ok(op) => Some(op),
        Err(err) => {
            tracing::error!(key = %record.key, "skipping undecodable queued operation: {err}");
            None
        }
    }
}
