//! Pending mutation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{EntityType, path_segments};
use crate::error::ModelError;
use crate::id::{QueueId, TempId};

/// HTTP verbs the client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }

    /// `POST → CREATE`, `PUT/PATCH → UPDATE`, `DELETE → DELETE`.
    pub fn operation_type(&self) -> Option<OperationType> {
        match self {
            HttpMethod::Get => None,
            HttpMethod::Post => Some(OperationType::Create),
            HttpMethod::Put | HttpMethod::Patch => Some(OperationType::Update),
            HttpMethod::Delete => Some(OperationType::Delete),
        }
    }
}

impl core::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for HttpMethod {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(ModelError::unsupported_method(other)),
        }
    }
}

/// Kind of mutation a pending operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl core::fmt::Display for OperationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replay status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for the next drain.
    Pending,
    /// Replay failed permanently or too often; skipped until retried by hand.
    NeedsAttention,
}

/// A single not-yet-confirmed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub queue_id: QueueId,
    pub operation_type: OperationType,
    pub entity_type: EntityType,
    /// `None` for creates: the server assigns the id.
    pub entity_id: Option<String>,
    /// Temporary id handed to the UI for a deferred create.
    #[serde(default)]
    pub temp_id: Option<TempId>,
    #[serde(default)]
    pub payload: Value,
    pub url: String,
    pub http_method: HttpMethod,
    pub enqueued_at: DateTime<Utc>,
    pub status: OperationStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Build a pending record for a mutating request.
    ///
    /// Fails for `GET`: reads are never queued.
    pub fn new(
        queue_id: QueueId,
        http_method: HttpMethod,
        url: impl Into<String>,
        entity_type: EntityType,
        entity_id: Option<String>,
        payload: Value,
    ) -> Result<Self, ModelError> {
        let operation_type = http_method
            .operation_type()
            .ok_or_else(|| ModelError::not_mutating(http_method.as_str()))?;

        Ok(Self {
            queue_id,
            operation_type,
            entity_type,
            entity_id,
            temp_id: None,
            payload,
            url: url.into(),
            http_method,
            enqueued_at: Utc::now(),
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
        })
    }

    pub fn with_temp_id(mut self, temp_id: TempId) -> Self {
        self.temp_id = Some(temp_id);
        self
    }

    pub fn needs_attention(&self) -> bool {
        self.status == OperationStatus::NeedsAttention
    }

    /// Whether this operation addresses `id` (by entity id or URL path segment).
    pub fn references(&self, id: &str) -> bool {
        self.entity_id.as_deref() == Some(id) || path_segments(&self.url).iter().any(|s| s == id)
    }

    /// Every temporary id this operation depends on, excluding the one it creates.
    pub fn temp_dependencies(&self) -> Vec<String> {
        let own = self.temp_id.as_ref().map(TempId::as_str);
        let mut deps: Vec<String> = path_segments(&self.url)
            .into_iter()
            .chain(self.entity_id.clone())
            .filter(|s| TempId::is_temp(s) && Some(s.as_str()) != own)
            .collect();
        collect_temp_strings(&self.payload, own, &mut deps);
        deps.sort();
        deps.dedup();
        deps
    }

    /// Replace every reference to `from` with `to`.
    ///
    /// Touches the entity id, matching URL path segments and string values in
    /// the payload. Returns whether anything changed.
    pub fn rewrite_id(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;

        if self.entity_id.as_deref() == Some(from) {
            self.entity_id = Some(to.to_string());
            changed = true;
        }

        let rewritten = rewrite_url(&self.url, from, to);
        if rewritten != self.url {
            self.url = rewritten;
            changed = true;
        }

        changed |= rewrite_strings(&mut self.payload, from, to);
        changed
    }
}

fn rewrite_url(url: &str, from: &str, to: &str) -> String {
    let (base, suffix) = match url.find(['?', '#']) {
        Some(idx) => url.split_at(idx),
        None => (url, ""),
    };

    let rebuilt: Vec<&str> = base
        .split('/')
        .map(|seg| if seg == from { to } else { seg })
        .collect();

    format!("{}{}", rebuilt.join("/"), suffix)
}

fn rewrite_strings(value: &mut Value, from: &str, to: &str) -> bool {
    match value {
        Value::String(s) if s.as_str() == from => {
            *s = to.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, v| rewrite_strings(v, from, to) | acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, v| rewrite_strings(v, from, to) | acc),
        _ => false,
    }
}

fn collect_temp_strings(value: &Value, own: Option<&str>, out: &mut Vec<String>) {
    match value {
        Value::String(s) if TempId::is_temp(s) && Some(s.as_str()) != own => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_temp_strings(v, own, out)),
        Value::Object(map) => map.values().for_each(|v| collect_temp_strings(v, own, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(method: HttpMethod, url: &str, entity_id: Option<&str>, payload: Value) -> PendingOperation {
        PendingOperation::new(
            QueueId::new(1),
            method,
            url,
            EntityType::from_url(url),
            entity_id.map(str::to_string),
            payload,
        )
        .unwrap()
    }

    #[test]
    fn methods_classify_into_operation_types() {
        assert_eq!(HttpMethod::Post.operation_type(), Some(OperationType::Create));
        assert_eq!(HttpMethod::Put.operation_type(), Some(OperationType::Update));
        assert_eq!(HttpMethod::Patch.operation_type(), Some(OperationType::Update));
        assert_eq!(HttpMethod::Delete.operation_type(), Some(OperationType::Delete));
        assert_eq!(HttpMethod::Get.operation_type(), None);
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn get_cannot_become_a_pending_operation() {
        let err = PendingOperation::new(
            QueueId::new(1),
            HttpMethod::Get,
            "/shipments",
            EntityType::Shipment,
            None,
            Value::Null,
        )
        .unwrap_err();
        assert_eq!(err, ModelError::not_mutating("GET"));
    }

    #[test]
    fn rewrite_id_touches_url_entity_and_payload() {
        let mut update = op(
            HttpMethod::Put,
            "/shipments/temp_1?notify=true",
            Some("temp_1"),
            json!({"status": "picked", "refs": ["temp_1", "other"]}),
        );

        assert!(update.references("temp_1"));
        assert!(update.rewrite_id("temp_1", "ship_9"));

        assert_eq!(update.url, "/shipments/ship_9?notify=true");
        assert_eq!(update.entity_id.as_deref(), Some("ship_9"));
        assert_eq!(update.payload, json!({"status": "picked", "refs": ["ship_9", "other"]}));
        assert!(!update.rewrite_id("temp_1", "ship_9"));
    }

    #[test]
    fn temp_dependencies_exclude_own_temp_id() {
        let create = op(HttpMethod::Post, "/deliveries", None, json!({"shipment": "temp_a"}))
            .with_temp_id("temp_b".parse().unwrap());
        assert_eq!(create.temp_dependencies(), vec!["temp_a".to_string()]);

        let plain = op(HttpMethod::Delete, "/shipments/ship_1", Some("ship_1"), Value::Null);
        assert!(plain.temp_dependencies().is_empty());
    }

    #[test]
    fn pending_operation_serializes_camel_case() {
        let create = op(HttpMethod::Post, "/shipments", None, json!({"origin": "Jakarta"}));
        let v = serde_json::to_value(&create).unwrap();
        assert_eq!(v["operationType"], json!("CREATE"));
        assert_eq!(v["entityType"], json!("SHIPMENT"));
        assert_eq!(v["httpMethod"], json!("POST"));
        assert_eq!(v["status"], json!("pending"));

        let back: PendingOperation = serde_json::from_value(v).unwrap();
        assert_eq!(back, create);
    }

    proptest::proptest! {
        #[test]
        fn rewrite_replaces_every_reference_and_nothing_else(
            segments in proptest::collection::vec("[a-z0-9]{1,8}", 1..6),
            at in 0usize..6,
        ) {
            let mut parts = segments.clone();
            let at = at.min(parts.len());
            parts.insert(at, "temp_q1".to_string());
            let url = format!("/{}", parts.join("/"));

            let mut update = op(HttpMethod::Patch, &url, None, json!({"ref": "temp_q1"}));
            proptest::prop_assert!(update.rewrite_id("temp_q1", "ship_42"));
            proptest::prop_assert!(!update.references("temp_q1"));
            proptest::prop_assert!(update.temp_dependencies().is_empty());

            parts[at] = "ship_42".to_string();
            proptest::prop_assert_eq!(update.url, format!("/{}", parts.join("/")));
            proptest::prop_assert_eq!(update.payload, json!({"ref": "ship_42"}));
        }
    }
}
