//! Online/offline detection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::transport::{ApiRequest, HttpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connectivity {
    Online,
    Offline,
    /// Not observed yet.
    Unknown,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

/// Answers "can we reach the backend right now?".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> Connectivity;

    /// Feed back what a real request just observed. Ignored by default.
    fn report(&self, _observed: Connectivity) {}
}

/// Settable connectivity state that broadcasts transitions.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Unknown)
    }
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Record a new state; returns whether it changed.
    pub fn set(&self, state: Connectivity) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!(?state, "connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    /// Ask `probe` and record the answer. `Unknown` answers leave the state alone.
    pub async fn poll(&self, probe: &dyn ConnectivityProbe) -> Connectivity {
        match probe.check().await {
            Connectivity::Unknown => self.current(),
            observed => {
                self.set(observed);
                observed
            }
        }
    }
}

#[async_trait]
impl ConnectivityProbe for ConnectivityMonitor {
    async fn check(&self) -> Connectivity {
        self.current()
    }

    fn report(&self, observed: Connectivity) {
        if observed != Connectivity::Unknown {
            self.set(observed);
        }
    }
}

/// Probes `GET {base}/health`; any HTTP response means the backend is reachable.
pub struct HealthCheckProbe {
    transport: Arc<dyn HttpTransport>,
    health_url: String,
}

impl HealthCheckProbe {
    pub fn new(transport: Arc<dyn HttpTransport>, api_base_url: &str) -> Self {
        Self {
            transport,
            health_url: format!("{}/health", api_base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HealthCheckProbe {
    async fn check(&self) -> Connectivity {
        match self.transport.send(&ApiRequest::get(&self.health_url), None).await {
            Ok(_) => Connectivity::Online,
            Err(err) if err.is_connectivity() => {
                tracing::debug!("health check failed: {err}");
                Connectivity::Offline
            }
            Err(err) => {
                tracing::debug!("health check inconclusive: {err}");
                Connectivity::Unknown
            }
        }
    }
}
