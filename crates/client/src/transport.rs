//! Raw HTTP exchange with the REST backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use waybill_core::HttpMethod;

/// Failures where no usable response came back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, DNS failure, reset: the backend is out of reach.
    #[error("network error: {0}")]
    Unreachable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A response arrived but its body is not JSON.
    #[error("response body is not valid JSON: {0}")]
    Decode(String),

    /// The request could not be built (bad URL, invalid header).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Whether the failure means "still offline".
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Timeout(_))
    }
}

/// One REST call. `path` is relative to the API root unless it is absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// `Null` for empty bodies.
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests; any status code is a response, not an error.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, TransportError>;
}

/// `reqwest`-backed transport for `{base}/{version}/{resource}` URLs.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    api_root: String,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(api_root: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_root: api_root.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.api_root, path)
        } else {
            format!("{}/{}", self.api_root, path)
        }
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Unreachable(err.to_string())
        }
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.path);
        let mut req = self
            .client
            .request(reqwest_method(request.method), &url)
            .timeout(self.timeout);

        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| self.classify(e))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| self.classify(e))?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))?
        };

        tracing::debug!(method = %request.method, %url, status, "api response");
        Ok(ApiResponse { status, body })
    }
}
