//! API client layer for the REST backend and the confirmation WebSocket.

use crate::config::{ClientConfig, ReconnectConfig};
use async_trait::async_trait;
use plantwatch_core::{ApiError, ApiRequest, Credential, CredentialProvider, Method, TenantId, Transport};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ApiClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// reqwest-backed [`Transport`].
#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl RestClient {
    pub fn new(
        config: &ClientConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ApiClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn parse_response(response: reqwest::Response) -> Result<serde_json::Value, ApiError> {
        let status = response.status();
        let text = response.text().await.map_err(|e| ApiError::Network {
            reason: e.to_string(),
        })?;
        if status.is_success() {
            // 204 and other empty bodies
            if text.trim().is_empty() {
                return Ok(serde_json::Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| ApiError::InvalidBody {
                reason: e.to_string(),
            });
        }
        Err(ApiError::Status {
            status: status.as_u16(),
            detail: error_detail(&text),
        })
    }
}

#[async_trait]
impl Transport for RestClient {
    async fn send(&self, request: ApiRequest) -> Result<serde_json::Value, ApiError> {
        let credential = self
            .credentials
            .current_credential()
            .ok_or_else(|| ApiError::Status {
                status: 401,
                detail: "No credential available".to_string(),
            })?;

        let url = format!("{}{}", self.base_url, request.path);
        let builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Patch => self.client.patch(&url),
            Method::Delete => self.client.delete(&url),
        };
        let builder = builder.query(&request.query);
        let builder = match credential {
            Credential::ApiKey(key) => builder.header("x-api-key", key),
            Credential::Bearer(token) => builder.bearer_auth(token),
        };
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| ApiError::Network {
            reason: e.to_string(),
        })?;
        tracing::debug!(
            method = %request.method,
            path = %request.path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend request"
        );
        Self::parse_response(response).await
    }
}

/// Pull the `detail` field out of an error body, falling back to the raw text.
fn error_detail(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(body)) => match body.get("detail") {
            Some(serde_json::Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => text.to_string(),
        },
        _ => text.to_string(),
    }
}

/// Connects to the per-tenant confirmation socket.
#[derive(Clone)]
pub struct WsClient {
    endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
    reconnect: ReconnectConfig,
}

impl WsClient {
    pub fn new(config: &ClientConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            endpoint: config.ws_endpoint.trim_end_matches('/').to_string(),
            credentials,
            reconnect: config.reconnect.clone(),
        }
    }

    pub fn url(&self, tenant_id: TenantId) -> String {
        format!("{}/{}", self.endpoint, tenant_id)
    }

    pub async fn connect(
        &self,
        tenant_id: TenantId,
    ) -> Result<WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, ApiClientError>
    {
        let mut request = self.url(tenant_id).into_client_request()?;
        let headers = request.headers_mut();
        for (name, value) in auth_headers(self.credentials.current_credential())?.iter() {
            headers.insert(name, value.clone());
        }
        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(stream)
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect
    }
}

fn auth_headers(credential: Option<Credential>) -> Result<HeaderMap, ApiClientError> {
    let mut headers = HeaderMap::new();
    match credential {
        Some(Credential::ApiKey(key)) => {
            headers.insert(
                HeaderName::from_static("x-api-key"),
                HeaderValue::from_str(&key).map_err(|e| ApiClientError::Config(e.to_string()))?,
            );
        }
        Some(Credential::Bearer(token)) => {
            let value = format!("Bearer {}", token);
            headers.insert(
                HeaderName::from_static("authorization"),
                HeaderValue::from_str(&value).map_err(|e| ApiClientError::Config(e.to_string()))?,
            );
        }
        None => {}
    }
    Ok(headers)
}
