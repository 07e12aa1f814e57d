//! Notifications published by the sync machinery.

use serde::{Deserialize, Serialize};

use waybill_core::{EntityType, OperationType, QueueId, TempId};

/// What the offline queue, API client and sync worker tell the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A mutation was deferred into the durable queue.
    OperationQueued {
        queue_id: QueueId,
        entity_type: EntityType,
        operation_type: OperationType,
        temp_id: Option<TempId>,
    },
    /// A queued mutation was confirmed by the server and removed.
    OperationReplayed {
        queue_id: QueueId,
        entity_type: EntityType,
        operation_type: OperationType,
    },
    /// A deferred CREATE received its server id; references to `temp_id`
    /// must now use `real_id`.
    IdReconciled {
        temp_id: TempId,
        real_id: String,
        entity_type: EntityType,
    },
    /// A queued mutation stopped being replayed automatically.
    NeedsAttention {
        queue_id: QueueId,
        error: String,
        attempts: u32,
    },
    DrainCompleted {
        replayed: usize,
        flagged: usize,
        deferred: usize,
        remaining: usize,
        aborted: bool,
    },
    /// Token refresh failed; credentials were cleared.
    ReauthenticationRequired,
    ConnectivityChanged { online: bool },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::OperationQueued { .. } => "operation_queued",
            SyncEvent::OperationReplayed { .. } => "operation_replayed",
            SyncEvent::IdReconciled { .. } => "id_reconciled",
            SyncEvent::NeedsAttention { .. } => "needs_attention",
            SyncEvent::DrainCompleted { .. } => "drain_completed",
            SyncEvent::ReauthenticationRequired => "reauthentication_required",
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reconciliation_event_wire_shape() {
        let ev = SyncEvent::IdReconciled {
            temp_id: "temp_1".parse().unwrap(),
            real_id: "ship_123".to_string(),
            entity_type: EntityType::Shipment,
        };

        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({
                "kind": "id_reconciled",
                "temp_id": "temp_1",
                "real_id": "ship_123",
                "entity_type": "SHIPMENT",
            })
        );
        assert_eq!(ev.route(), "id_reconciled");
    }
}
