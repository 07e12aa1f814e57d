//! Fakes shared by unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use waybill_events::{EventBus, InMemoryEventBus, Subscription, SyncEvent};

use crate::SyncBus;
use crate::api::ApiClient;
use crate::auth::TokenStore;
use crate::cache::EntityCache;
use crate::store::{LocalStore, MemoryStore};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, TransportError};

type Responder = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync;

/// Transport answering every request through a closure and recording it.
pub struct FnTransport {
    respond: Box<Responder>,
    seen: Mutex<Vec<ApiRequest>>,
}

impl FnTransport {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Always answers `200` with `body`.
    pub fn ok(body: Value) -> Arc<Self> {
        Self::new(move |_| Ok(ApiResponse::new(200, body.clone())))
    }

    pub fn offline() -> Arc<Self> {
        Self::new(|_| Err(TransportError::Unreachable("connection refused".into())))
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// `"METHOD path"` for every request seen so far.
    pub fn calls(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for FnTransport {
    async fn send(&self, request: &ApiRequest, _bearer: Option<&str>) -> Result<ApiResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        (self.respond)(request)
    }
}

/// Store, cache, bus and API client wired around one fake transport.
pub struct Harness {
    pub store: Arc<dyn LocalStore>,
    pub cache: EntityCache,
    pub bus: SyncBus,
    pub api: ApiClient,
    pub events: Subscription<SyncEvent>,
}

impl Harness {
    pub fn new(transport: Arc<FnTransport>) -> Self {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let bus: SyncBus = Arc::new(InMemoryEventBus::new());
        let events = bus.subscribe();
        Self {
            cache: EntityCache::new(store.clone()),
            api: ApiClient::new(transport, TokenStore::in_memory(), bus.clone()),
            store,
            bus,
            events,
        }
    }
}
