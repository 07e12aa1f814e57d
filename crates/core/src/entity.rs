//! Cached entity snapshots and entity-type classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of domain object the client caches and mutates.
///
/// Serialized as an upper-case tag (`"SHIPMENT"`); unknown resources keep
/// their path segment, upper-cased, in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Shipment,
    Customer,
    Payment,
    Delivery,
    Pickup,
    Invoice,
    Branch,
    Other(String),
}

/// Known REST path segments and the entity type they address.
const KNOWN_SEGMENTS: &[(&str, EntityType)] = &[
    ("shipments", EntityType::Shipment),
    ("shipment", EntityType::Shipment),
    ("customers", EntityType::Customer),
    ("customer", EntityType::Customer),
    ("payments", EntityType::Payment),
    ("payment", EntityType::Payment),
    ("deliveries", EntityType::Delivery),
    ("delivery", EntityType::Delivery),
    ("pickups", EntityType::Pickup),
    ("pickup", EntityType::Pickup),
    ("invoices", EntityType::Invoice),
    ("invoice", EntityType::Invoice),
    ("branches", EntityType::Branch),
    ("branch", EntityType::Branch),
];

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Shipment => "SHIPMENT",
            EntityType::Customer => "CUSTOMER",
            EntityType::Payment => "PAYMENT",
            EntityType::Delivery => "DELIVERY",
            EntityType::Pickup => "PICKUP",
            EntityType::Invoice => "INVOICE",
            EntityType::Branch => "BRANCH",
            EntityType::Other(name) => name,
        }
    }

    /// Parse a tag or resource name, case-insensitively.
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        KNOWN_SEGMENTS
            .iter()
            .find(|(segment, _)| *segment == lowered)
            .map(|(_, ty)| ty.clone())
            .unwrap_or_else(|| EntityType::Other(lowered.to_ascii_uppercase()))
    }

    /// Derive the entity type addressed by a request URL.
    ///
    /// Picks the longest known segment present in the path; when none is
    /// known, the last path segment names the type.
    pub fn from_url(url: &str) -> Self {
        let segments = path_segments(url);

        let best = segments
            .iter()
            .filter_map(|seg| {
                let lowered = seg.to_ascii_lowercase();
                KNOWN_SEGMENTS
                    .iter()
                    .find(|(known, _)| *known == lowered)
                    .map(|(known, ty)| (known.len(), ty))
            })
            .fold(None::<(usize, &EntityType)>, |acc, (len, ty)| match acc {
                Some((best_len, _)) if best_len >= len => acc,
                _ => Some((len, ty)),
            });

        match (best, segments.last()) {
            (Some((_, ty)), _) => ty.clone(),
            (None, Some(last)) => EntityType::Other(last.to_ascii_uppercase()),
            (None, None) => EntityType::Other("UNKNOWN".to_string()),
        }
    }
}

impl core::fmt::Display for EntityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        EntityType::parse(&value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.as_str().to_string()
    }
}

/// Split a relative or absolute URL into its non-empty path segments.
///
/// Query string and fragment are ignored.
pub fn path_segments(url: &str) -> Vec<String> {
    let without_fragment = url.split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();

    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or_default(),
        None => without_query,
    };

    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Snapshot of a domain object keyed by `(entity_type, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
    pub id: String,
    pub entity_type: EntityType,
    pub payload: Value,
    /// `None` until the server has confirmed this state.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl CachedEntity {
    /// A snapshot confirmed by the server just now.
    pub fn confirmed(id: impl Into<String>, entity_type: EntityType, payload: Value) -> Self {
        Self {
            id: id.into(),
            entity_type,
            payload,
            last_synced_at: Some(Utc::now()),
        }
    }

    /// A locally written snapshot the server has not seen yet.
    pub fn optimistic(id: impl Into<String>, entity_type: EntityType, payload: Value) -> Self {
        Self {
            id: id.into(),
            entity_type,
            payload,
            last_synced_at: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.last_synced_at.is_some()
    }

    /// Shallow-merge `patch` into the payload (object keys overwrite).
    pub fn merge_payload(&mut self, patch: &Value) {
        match (self.payload.as_object_mut(), patch.as_object()) {
            (Some(current), Some(changes)) => {
                for (k, v) in changes {
                    current.insert(k.clone(), v.clone());
                }
            }
            _ => self.payload = patch.clone(),
        }
    }
}

/// Extract the server identifier from a response body.
///
/// Accepts `id`, `_id`, and the same keys nested under `data`; numeric ids are
/// rendered as strings.
pub fn server_id_of(body: &Value) -> Option<String> {
    fn direct(v: &Value) -> Option<String> {
        ["id", "_id"].iter().find_map(|key| match v.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    direct(body).or_else(|| body.get("data").and_then(direct))
}
