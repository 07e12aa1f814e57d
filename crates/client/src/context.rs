//! Explicitly constructed client state.

use std::sync::Arc;

use anyhow::Context;

use waybill_events::InMemoryEventBus;

use crate::SyncBus;
use crate::api::ApiClient;
use crate::auth::{HttpTokenRefresher, TokenStore};
use crate::cache::{EntityCache, Preferences};
use crate::config::ClientConfig;
use crate::connectivity::{ConnectivityMonitor, HealthCheckProbe};
use crate::dispatcher::RequestDispatcher;
use crate::queue::OfflineQueue;
use crate::realtime::{RealtimeChannel, RealtimeConnector, WebSocketConnector};
use crate::store::{LocalStore, SqliteStore};
use crate::sync_worker::SyncWorker;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Everything the sync core needs, wired once from a [`ClientConfig`].
///
/// Cheap to clone; clones share the same store, queue and channel.
#[derive(Clone)]
pub struct SyncContext {
    pub config: ClientConfig,
    pub store: Arc<dyn LocalStore>,
    pub cache: EntityCache,
    pub preferences: Preferences,
    pub tokens: TokenStore,
    pub events: SyncBus,
    pub api: ApiClient,
    pub monitor: ConnectivityMonitor,
    pub health: Arc<HealthCheckProbe>,
    pub queue: Arc<OfflineQueue>,
    pub dispatcher: Arc<RequestDispatcher>,
    pub realtime: RealtimeChannel,
}

impl SyncContext {
    /// Build with the production stack: SQLite store, `reqwest` transport and WebSocket connector.
    ///
    /// The store opens lazily; an unavailable store surfaces on first use, not here.
    pub async fn build(config: ClientConfig) -> anyhow::Result<Self> {
        validate_url(&config.api_base_url, &["http://", "https://"])
            .with_context(|| format!("invalid API base URL '{}'", config.api_base_url))?;
        validate_url(&config.realtime_url, &["ws://", "wss://"])
            .with_context(|| format!("invalid realtime URL '{}'", config.realtime_url))?;

        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::new(config.store.clone()));
        let transport: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(config.api_root(), config.request_timeout));
        let connector = Arc::new(WebSocketConnector::new(config.request_timeout));
        Self::with_parts(config, store, transport, connector).await
    }

    /// Build around caller-supplied store, transport and realtime connector.
    pub async fn with_parts(
        config: ClientConfig,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn HttpTransport>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> anyhow::Result<Self> {
        let events: SyncBus = Arc::new(InMemoryEventBus::new());
        let cache = EntityCache::new(store.clone());
        let preferences = Preferences::new(store.clone());

        let tokens = TokenStore::persisted(preferences.clone());
        match tokens.load().await {
            Ok(Some(_)) => tracing::info!("restored persisted credentials"),
            Ok(None) => tracing::debug!("no persisted credentials"),
            Err(err) => tracing::warn!("could not restore credentials: {err}"),
        }

        let api = ApiClient::new(transport.clone(), tokens.clone(), events.clone())
            .with_refresher(Arc::new(HttpTokenRefresher::new(transport.clone())));
        let monitor = ConnectivityMonitor::default();
        let health = Arc::new(HealthCheckProbe::new(transport, &config.api_base_url));

        let queue = Arc::new(OfflineQueue::new(
            store.clone(),
            cache.clone(),
            api.clone(),
            events.clone(),
            config.max_replay_attempts,
        ));
        let dispatcher = Arc::new(RequestDispatcher::new(
            api.clone(),
            queue.clone(),
            cache.clone(),
            Arc::new(monitor.clone()),
        ));
        let realtime = RealtimeChannel::new(config.realtime_url.clone(), connector, config.reconnect.clone());

        tracing::info!(
            api_root = %config.api_root(),
            realtime_url = %config.realtime_url,
            store = ?config.store,
            "sync context ready"
        );

        Ok(Self {
            config,
            store,
            cache,
            preferences,
            tokens,
            events,
            api,
            monitor,
            health,
            queue,
            dispatcher,
            realtime,
        })
    }

    /// A worker that drains this context's queue and polls the health endpoint.
    pub fn sync_worker(&self) -> SyncWorker {
        SyncWorker::new(
            self.queue.clone(),
            self.monitor.clone(),
            self.events.clone(),
            self.config.drain_interval,
        )
        .with_probe(self.health.clone())
    }
}

impl core::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncContext")
            .field("api_root", &self.config.api_root())
            .field("store", &self.config.store)
            .field("connectivity", &self.monitor.current())
            .field("realtime", &self.realtime.status())
            .finish()
    }
}

fn validate_url(url: &str, schemes: &[&str]) -> anyhow::Result<()> {
    let Some(scheme) = schemes.iter().find(|s| url.starts_with(**s)) else {
        anyhow::bail!("expected a URL starting with one of {schemes:?}");
    };
    if url.len() == scheme.len() {
        anyhow::bail!("URL has no host");
    }
    Ok(())
}
