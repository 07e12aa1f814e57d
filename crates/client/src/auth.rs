//! Bearer credentials and token refresh.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::cache::{Preferences, entity_payload};
use crate::store::StoreError;
use crate::transport::{ApiRequest, HttpTransport, TransportError};

const CREDENTIALS_KEY: &str = "auth.credentials";
const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("refresh rejected with status {0}")]
    Rejected(u16),

    #[error("refresh response carries no access token")]
    MissingToken,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// Current credentials, mirrored into the preferences partition when one is attached.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    current: Arc<RwLock<Option<Credentials>>>,
    persisted: Option<Preferences>,
}

impl TokenStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persisted(preferences: Preferences) -> Self {
        Self {
            current: Arc::default(),
            persisted: Some(preferences),
        }
    }

    /// Restore previously persisted credentials, if any.
    pub async fn load(&self) -> Result<Option<Credentials>, AuthError> {
        let Some(prefs) = &self.persisted else {
            return Ok(self.get());
        };
        let restored = match prefs.get_preference(CREDENTIALS_KEY).await? {
            Some(value) => serde_json::from_value::<Credentials>(value).ok(),
            None => None,
        };
        if restored.is_some() {
            *self.write() = restored.clone();
        }
        Ok(restored)
    }

    pub async fn set(&self, credentials: Credentials) -> Result<(), AuthError> {
        if let Some(prefs) = &self.persisted {
            let value = serde_json::to_value(&credentials).map_err(StoreError::from)?;
            prefs.set_preference(CREDENTIALS_KEY, value).await?;
        }
        *self.write() = Some(credentials);
        Ok(())
    }

    /// Forget credentials in memory and on disk.
    pub async fn clear(&self) -> Result<(), AuthError> {
        *self.write() = None;
        if let Some(prefs) = &self.persisted {
            prefs.remove_preference(CREDENTIALS_KEY).await?;
        }
        Ok(())
    }

    pub fn get(&self) -> Option<Credentials> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.get().map(|c| c.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.get().and_then(|c| c.refresh_token)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credentials>> {
        self.current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Exchanges a refresh token for fresh credentials.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, AuthError>;
}

/// POSTs `{ "refreshToken": ... }` to `/auth/refresh`.
pub struct HttpTokenRefresher {
    transport: Arc<dyn HttpTransport>,
}

impl HttpTokenRefresher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, AuthError> {
        let request = ApiRequest::post(REFRESH_PATH, json!({ "refreshToken": refresh_token }));
        let response = self.transport.send(&request, None).await?;
        if !response.is_success() {
            return Err(AuthError::Rejected(response.status));
        }

        let body = entity_payload(&response.body);
        let access = ["accessToken", "token"]
            .iter()
            .find_map(|k| body.get(k).and_then(Value::as_str))
            .ok_or(AuthError::MissingToken)?;
        let refresh = body
            .get("refreshToken")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(refresh_token.to_string()));

        Ok(Credentials::new(access, refresh))
    }
}
