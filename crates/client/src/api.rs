//! Authenticated REST client with the refresh-once rule for 401s.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use waybill_events::SyncEvent;

use crate::SyncBus;
use crate::auth::{AuthError, TokenRefresher, TokenStore};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, TransportError};

/// Failure taxonomy shared by the dispatcher and the queue drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No response: treat as still offline.
    Connectivity,
    /// 401 that a token refresh could not fix.
    Authentication,
    /// 4xx other than 401; never retried automatically.
    Rejected,
    /// 5xx; transient.
    Server,
    /// A response arrived but could not be understood.
    Decode,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("re-authentication required")]
    Unauthorized,

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String, body: Value },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String, body: Value },
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Transport(TransportError::Unreachable(_) | TransportError::Timeout(_)) => {
                ErrorClass::Connectivity
            }
            ApiError::Transport(TransportError::Decode(_)) => ErrorClass::Decode,
            ApiError::Transport(TransportError::InvalidRequest(_)) => ErrorClass::Rejected,
            ApiError::Unauthorized => ErrorClass::Authentication,
            ApiError::Rejected { .. } => ErrorClass::Rejected,
            ApiError::Server { .. } => ErrorClass::Server,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized => Some(401),
            ApiError::Rejected { status, .. } | ApiError::Server { status, .. } => Some(*status),
            ApiError::Transport(_) => None,
        }
    }

    fn from_response(response: ApiResponse) -> Self {
        let message = ["message", "error"]
            .iter()
            .find_map(|k| response.body.get(k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", response.status));

        if response.status >= 500 {
            ApiError::Server {
                status: response.status,
                message,
                body: response.body,
            }
        } else {
            ApiError::Rejected {
                status: response.status,
                message,
                body: response.body,
            }
        }
    }
}

enum Refresh {
    Renewed,
    Denied,
    Unreachable(TransportError),
}

/// Sends requests with the current bearer token attached.
///
/// A 401 triggers exactly one refresh and one retry. When refresh fails the
/// stored credentials are cleared and [`SyncEvent::ReauthenticationRequired`]
/// is published.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    tokens: TokenStore,
    refresher: Option<Arc<dyn TokenRefresher>>,
    events: SyncBus,
    refresh_lock: Arc<Mutex<()>>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn HttpTransport>, tokens: TokenStore, events: SyncBus) -> Self {
        Self {
            transport,
            tokens,
            refresher: None,
            events,
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Send `request`; non-2xx statuses become [`ApiError`]s.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let bearer = self.tokens.access_token();
        let response = self.transport.send(request, bearer.as_deref()).await?;

        let response = if response.status == 401 {
            tracing::info!(path = %request.path, "401 received; refreshing token");
            match self.refresh(bearer.as_deref()).await {
                Refresh::Renewed => {}
                Refresh::Denied => return Err(ApiError::Unauthorized),
                Refresh::Unreachable(err) => return Err(ApiError::Transport(err)),
            }
            let retried = self
                .transport
                .send(request, self.tokens.access_token().as_deref())
                .await?;
            if retried.status == 401 {
                self.require_reauthentication().await;
                return Err(ApiError::Unauthorized);
            }
            retried
        } else {
            response
        };

        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_response(response))
        }
    }

    async fn refresh(&self, stale: Option<&str>) -> Refresh {
        let _guard = self.refresh_lock.lock().await;

        // Someone else refreshed while we waited.
        let current = self.tokens.access_token();
        if current.is_some() && current.as_deref() != stale {
            return Refresh::Renewed;
        }

        let Some(refresher) = self.refresher.as_ref() else {
            tracing::warn!("no token refresher configured");
            self.require_reauthentication().await;
            return Refresh::Denied;
        };
        let Some(refresh_token) = self.tokens.refresh_token() else {
            tracing::warn!("no refresh token stored");
            self.require_reauthentication().await;
            return Refresh::Denied;
        };

        match refresher.refresh(&refresh_token).await {
            Ok(credentials) => match self.tokens.set(credentials).await {
                Ok(()) => Refresh::Renewed,
                Err(err) => {
                    // The new token is still live in memory.
                    tracing::warn!("failed to persist refreshed credentials: {err}");
                    if self.tokens.access_token().is_some() {
                        Refresh::Renewed
                    } else {
                        Refresh::Denied
                    }
                }
            },
            // Could not reach the auth endpoint; keep the credentials for later.
            Err(AuthError::Transport(err)) if err.is_connectivity() => {
                tracing::warn!("token refresh unreachable: {err}");
                Refresh::Unreachable(err)
            }
            Err(err) => {
                tracing::warn!("token refresh failed: {err}");
                self.require_reauthentication().await;
                Refresh::Denied
            }
        }
    }

    async fn require_reauthentication(&self) {
        if let Err(err) = self.tokens.clear().await {
            tracing::error!("failed to clear stored credentials: {err}");
        }
        crate::publish(&self.events, SyncEvent::ReauthenticationRequired);
    }
}

impl core::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ApiClient")
            .field("has_refresher", &self.refresher.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use waybill_events::{EventBus, InMemoryEventBus};

    #[derive(Default)]
    struct Scripted {
        replies: StdMutex<VecDeque<ApiResponse>>,
        bearers: StdMutex<Vec<Option<String>>>,
    }

    impl Scripted {
        fn new(replies: Vec<ApiResponse>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies.into()),
                bearers: StdMutex::default(),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn send(&self, _request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, TransportError> {
            self.bearers.lock().unwrap().push(bearer.map(str::to_string));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Unreachable("script exhausted".into()))
        }
    }

    struct FixedRefresher(Result<&'static str, u16>);

    #[async_trait]
    impl TokenRefresher for FixedRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<Credentials, AuthError> {
            match self.0 {
                Ok(token) => Ok(Credentials::new(token, Some("r2".into()))),
                Err(status) => Err(AuthError::Rejected(status)),
            }
        }
    }

    struct OfflineRefresher;

    #[async_trait]
    impl TokenRefresher for OfflineRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<Credentials, AuthError> {
            Err(AuthError::Transport(TransportError::Unreachable("connection refused".into())))
        }
    }

    async fn client(transport: Arc<Scripted>, refresher: impl TokenRefresher + 'static) -> (ApiClient, SyncBus) {
        let bus: SyncBus = Arc::new(InMemoryEventBus::new());
        let tokens = TokenStore::in_memory();
        tokens.set(Credentials::new("old", Some("r1".into()))).await.unwrap();
        let client = ApiClient::new(transport, tokens, bus.clone()).with_refresher(Arc::new(refresher));
        (client, bus)
    }

    #[tokio::test]
    async fn refreshes_once_and_retries_with_the_new_token() {
        let transport = Scripted::new(vec![
            ApiResponse::new(401, Value::Null),
            ApiResponse::new(200, json!({"id": "ship_1"})),
        ]);
        let (client, _bus) = client(transport.clone(), FixedRefresher(Ok("fresh"))).await;

        let resp = client.execute(&ApiRequest::get("/shipments/ship_1")).await.unwrap();

        assert_eq!(resp.body["id"], json!("ship_1"));
        assert_eq!(
            *transport.bearers.lock().unwrap(),
            vec![Some("old".to_string()), Some("fresh".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_refresh_clears_credentials_and_signals_reauth() {
        let transport = Scripted::new(vec![ApiResponse::new(401, Value::Null)]);
        let (client, bus) = client(transport.clone(), FixedRefresher(Err(401))).await;
        let sub = bus.subscribe();

        let err = client.execute(&ApiRequest::get("/shipments")).await.unwrap_err();

        assert_eq!(err.class(), ErrorClass::Authentication);
        assert!(client.tokens().get().is_none());
        assert_eq!(sub.drain(), vec![SyncEvent::ReauthenticationRequired]);
        assert_eq!(transport.bearers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_refresh_is_a_connectivity_failure_and_keeps_credentials() {
        let transport = Scripted::new(vec![ApiResponse::new(401, Value::Null)]);
        let (client, bus) = client(transport.clone(), OfflineRefresher).await;
        let sub = bus.subscribe();

        let err = client.execute(&ApiRequest::get("/shipments")).await.unwrap_err();

        assert_eq!(err.class(), ErrorClass::Connectivity);
        assert_eq!(client.tokens().access_token().as_deref(), Some("old"));
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn second_401_after_refresh_is_not_retried_again() {
        let transport = Scripted::new(vec![
            ApiResponse::new(401, Value::Null),
            ApiResponse::new(401, Value::Null),
            ApiResponse::new(200, Value::Null),
        ]);
        let (client, _bus) = client(transport.clone(), FixedRefresher(Ok("fresh"))).await;

        let err = client.execute(&ApiRequest::get("/shipments")).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert_eq!(transport.bearers.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn statuses_map_onto_error_classes() {
        let transport = Scripted::new(vec![
            ApiResponse::new(422, json!({"message": "origin is required"})),
            ApiResponse::new(503, Value::Null),
        ]);
        let (client, _bus) = client(transport, FixedRefresher(Ok("x"))).await;

        let rejected = client.execute(&ApiRequest::post("/shipments", json!({}))).await.unwrap_err();
        assert_eq!(rejected.class(), ErrorClass::Rejected);
        assert_eq!(rejected.to_string(), "request rejected (422): origin is required");

        let server = client.execute(&ApiRequest::get("/shipments")).await.unwrap_err();
        assert_eq!(server.class(), ErrorClass::Server);

        let offline = client.execute(&ApiRequest::get("/shipments")).await.unwrap_err();
        assert_eq!(offline.class(), ErrorClass::Connectivity);
    }
}
