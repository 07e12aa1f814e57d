//! Connection state machine for the realtime channel.
//!
//! ```text
//! Disconnected --initialize--> Connecting --open--> Connected
//! Connected --drop--> Disconnected --(backoff)--> Connecting ...
//! any --disconnect()--> Disconnected (no reconnect)
//! ```
//!
//! Each connection attempt carries a generation number. `disconnect()` and
//! `initialize()` bump it, so close notifications and reconnect timers that
//! belong to an older connection are ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use waybill_events::{
    ConnectMessage, EventRegistry, InboundEvent, OutboundMessage, SubscriptionHandle, kinds,
};

use super::RealtimeError;
use super::link::{LinkEvent, RealtimeConnector, RealtimeLink};
use super::policy::ReconnectPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, PartialEq, Eq)]
struct Identity {
    user_id: String,
    auth_token: String,
}

#[derive(Default)]
struct State {
    identity: Option<Identity>,
    /// Present only while connected.
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Serialized messages issued while not connected, oldest first.
    pending: VecDeque<String>,
    authenticated: bool,
    generation: u64,
    reconnect_attempts: u32,
    reconnect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
}

struct Shared {
    url: String,
    connector: Arc<dyn RealtimeConnector>,
    policy: ReconnectPolicy,
    registry: EventRegistry<InboundEvent>,
    state: Mutex<State>,
    status: watch::Sender<ConnectionStatus>,
}

/// Live server-to-client event channel.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct RealtimeChannel {
    shared: Arc<Shared>,
}

impl RealtimeChannel {
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn RealtimeConnector>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (status, _rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                connector,
                policy,
                registry: EventRegistry::new(),
                state: Mutex::new(State::default()),
                status,
            }),
        }
    }

    /// Open the channel and identify as `user_id`.
    ///
    /// Resolves `true` once the transport is open and the connect frame is
    /// sent. Server-side authentication arrives later as an ordinary event;
    /// see [`is_authenticated`](Self::is_authenticated).
    pub async fn initialize(&self, user_id: impl Into<String>, auth_token: impl Into<String>) -> bool {
        let identity = Identity {
            user_id: user_id.into(),
            auth_token: auth_token.into(),
        };

        let generation = {
            let mut state = self.shared.lock();
            if self.status() == ConnectionStatus::Connected && state.identity.as_ref() == Some(&identity) {
                return true;
            }

            state.identity = Some(identity);
            state.generation += 1;
            state.reconnect_attempts = 0;
            state.authenticated = false;
            state.outbound = None;
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            if let Some(task) = state.reader_task.take() {
                task.abort();
            }
            self.shared.set_status(ConnectionStatus::Connecting);
            state.generation
        };

        self.shared.open(generation, false).await
    }

    /// Register `callback` for `event_type`; `"*"` receives every event.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.registry.subscribe(event_type, callback)
    }

    /// Send now if connected (`true`), otherwise buffer for the next connection (`false`).
    pub fn send_message(&self, message_type: impl Into<String>, data: Value) -> bool {
        let frame = match encode(OutboundMessage::new(message_type, data).to_json()) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!("dropping realtime message: {err}");
                return false;
            }
        };

        let mut state = self.shared.lock();
        let frame = match state.outbound.as_ref() {
            Some(outbound) => match outbound.send(frame) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        state.pending.push_back(frame);
        false
    }

    /// Close deliberately; no reconnect follows.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.reconnect_attempts = 0;
            state.authenticated = false;
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            if let Some(task) = state.reader_task.take() {
                task.abort();
            }
            let was_connected = state.outbound.take().is_some();
            self.shared.set_status(ConnectionStatus::Disconnected);
            was_connected
        };

        if was_connected {
            tracing::info!(url = %self.shared.url, "realtime channel closed by client");
            self.shared
                .dispatch_local(kinds::DISCONNECT, json!({ "reason": "client" }));
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Transport is open.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Server accepted the identity sent in the connect frame.
    pub fn is_authenticated(&self) -> bool {
        self.is_connected() && self.shared.lock().authenticated
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempts
    }

    pub fn pending_outbound(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn registry(&self) -> &EventRegistry<InboundEvent> {
        &self.shared.registry
    }
}

impl core::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("url", &self.shared.url)
            .field("status", &self.status())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::debug!(?previous, ?status, "realtime status changed");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn dispatch_local(&self, kind: &str, data: Value) {
        self.registry.dispatch(&InboundEvent::new(kind, data));
    }

    async fn open(self: &Arc<Self>, generation: u64, reconnecting: bool) -> bool {
        let link = match self.connector.connect(&self.url).await {
            Ok(link) => link,
            Err(err) => {
                tracing::warn!(url = %self.url, "realtime connect failed: {err}");
                if self.is_current(generation) {
                    self.set_status(ConnectionStatus::Disconnected);
                    self.schedule_reconnect(generation);
                }
                return false;
            }
        };
        let RealtimeLink { outbound, inbound } = link;

        let (reconnected, flushed) = {
            let mut state = self.lock();
            if state.generation != generation {
                // Superseded while connecting; dropping the link closes it.
                return false;
            }

            let connect_frame = state
                .identity
                .as_ref()
                .map(|id| encode(ConnectMessage::new(id.user_id.clone(), id.auth_token.clone()).to_json()));
            match connect_frame {
                Some(Ok(frame)) => {
                    let _ = outbound.send(frame);
                }
                Some(Err(err)) => tracing::error!("connect frame not sent: {err}"),
                None => tracing::warn!("opening realtime channel without an identity"),
            }

            // Buffered messages go out before anything sent after this point.
            let mut flushed = 0;
            while let Some(frame) = state.pending.pop_front() {
                if let Err(mpsc::error::SendError(frame)) = outbound.send(frame) {
                    state.pending.push_front(frame);
                    break;
                }
                flushed += 1;
            }

            let reconnected = reconnecting || state.reconnect_attempts > 0;
            state.outbound = Some(outbound);
            state.authenticated = false;
            state.reconnect_attempts = 0;
            state.reconnect_task = None;
            state.reader_task = Some(tokio::spawn(read_loop(self.clone(), generation, inbound)));
            self.set_status(ConnectionStatus::Connected);
            (reconnected, flushed)
        };

        tracing::info!(url = %self.url, reconnected, flushed, "realtime channel connected");
        self.dispatch_local(kinds::CONNECT, json!({ "url": self.url }));
        if reconnected {
            self.dispatch_local(kinds::RECONNECT, json!({ "url": self.url }));
        }
        true
    }

    fn handle_frame(&self, generation: u64, raw: &str) {
        let event = match InboundEvent::parse(raw) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("dropping malformed realtime message: {err}");
                return;
            }
        };

        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            if kinds::is_auth_success(&event.event_type) {
                state.authenticated = true;
            } else if kinds::is_auth_failure(&event.event_type) {
                tracing::warn!(event_type = %event.event_type, "realtime authentication rejected");
                state.authenticated = false;
            }
        }

        self.registry.dispatch(&event);
    }

    fn on_closed(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.outbound = None;
            state.authenticated = false;
            state.reader_task = None;
            self.set_status(ConnectionStatus::Disconnected);
        }

        tracing::warn!(url = %self.url, reason = reason.as_deref().unwrap_or(""), "realtime connection lost");
        self.dispatch_local(kinds::DISCONNECT, json!({ "reason": reason }));
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }

        let attempt = state.reconnect_attempts + 1;
        if !self.policy.allows(attempt) {
            let attempts = state.reconnect_attempts;
            drop(state);
            tracing::error!(attempts, "giving up on realtime reconnect");
            self.dispatch_local(kinds::RECONNECT_FAILED, json!({ "attempts": attempts }));
            return;
        }

        state.reconnect_attempts = attempt;
        let delay = self.policy.delay_for_attempt(attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling realtime reconnect");

        let shared = self.clone();
        state.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let state = shared.lock();
                if state.generation != generation {
                    return;
                }
                shared.set_status(ConnectionStatus::Connecting);
            }
            shared.open(generation, true).await;
        }));
    }
}

async fn read_loop(shared: Arc<Shared>, generation: u64, mut inbound: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = inbound.recv().await {
        match event {
            LinkEvent::Text(raw) => shared.handle_frame(generation, &raw),
            LinkEvent::Closed { reason } => {
                shared.on_closed(generation, reason);
                return;
            }
        }
    }
    shared.on_closed(generation, None);
}

fn encode(frame: Result<String, serde_json::Error>) -> Result<String, RealtimeError> {
    frame.map_err(|err| RealtimeError::Encode(err.to_string()))
}
