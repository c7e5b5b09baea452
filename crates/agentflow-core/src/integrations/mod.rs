//! Integration broker and adapter contract.
//!
//! Integration kinds form a sealed set with exhaustive dispatch; the
//! untyped string keys arriving from user-configured workflows are parsed
//! exactly once, at the broker boundary. Per-service request payloads are
//! an adapter concern and stay behind [`IntegrationAdapter`].
//!
//! The broker owns every write to the credential records. Expiry is
//! checked on every access, with no in-memory validity cache, so tokens
//! revoked or rotated externally are detected promptly.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ServerError, StepError};
use crate::models::connection::{ConnectionStatus, IntegrationConnection};
use crate::store::ConnectionStore;

/// The closed set of supported integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    Mail,
    Sheets,
    Chat,
    Crm,
    Calendar,
}

impl IntegrationKind {
    pub const ALL: [IntegrationKind; 5] = [
        IntegrationKind::Mail,
        IntegrationKind::Sheets,
        IntegrationKind::Chat,
        IntegrationKind::Crm,
        IntegrationKind::Calendar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::Mail => "mail",
            IntegrationKind::Sheets => "sheets",
            IntegrationKind::Chat => "chat",
            IntegrationKind::Crm => "crm",
            IntegrationKind::Calendar => "calendar",
        }
    }
}

impl FromStr for IntegrationKind {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mail" => Ok(IntegrationKind::Mail),
            "sheets" => Ok(IntegrationKind::Sheets),
            "chat" => Ok(IntegrationKind::Chat),
            "crm" => Ok(IntegrationKind::Crm),
            "calendar" => Ok(IntegrationKind::Calendar),
            other => Err(StepError::Validation(format!(
                "unknown integration key '{}'",
                other
            ))),
        }
    }
}

/// Token set returned by a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Contract every integration adapter implements. What an action does
/// against the third-party API is the adapter's business; the engine only
/// relies on the error classification coming back.
#[async_trait]
pub trait IntegrationAdapter: Send + Sync {
    fn kind(&self) -> IntegrationKind;

    fn supports_refresh(&self) -> bool {
        false
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedCredential, StepError>;

    async fn invoke(
        &self,
        connection: &IntegrationConnection,
        action: &str,
        params: &Value,
    ) -> Result<Value, StepError>;
}

/// Compile-time-checked adapter registry keyed by the sealed kind enum.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<IntegrationKind, Arc<dyn IntegrationAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn IntegrationAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: IntegrationKind) -> Option<Arc<dyn IntegrationAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Build HTTP adapters for every kind configured via environment:
    /// `AGENTFLOW_<KIND>_BASE_URL` (required per kind), plus optional
    /// `AGENTFLOW_<KIND>_TOKEN_URL`, `_CLIENT_ID`, `_CLIENT_SECRET` for
    /// OAuth refresh support.
    pub fn from_env() -> Self {
        let mut registry = Self::new();
        for kind in IntegrationKind::ALL {
            let prefix = format!("AGENTFLOW_{}", kind.as_str().to_uppercase());
            let Ok(base_url) = std::env::var(format!("{}_BASE_URL", prefix)) else {
                continue;
            };
            let adapter = HttpAdapter::new(
                kind,
                base_url,
                std::env::var(format!("{}_TOKEN_URL", prefix)).ok(),
                std::env::var(format!("{}_CLIENT_ID", prefix)).ok(),
                std::env::var(format!("{}_CLIENT_SECRET", prefix)).ok(),
            );
            tracing::info!("Registered HTTP adapter for integration '{}'", kind.as_str());
            registry.register(Arc::new(adapter));
        }
        registry
    }
}

/// Generic HTTP-backed adapter: actions map to `POST {base}/actions/{name}`
/// with a bearer token, refresh to the standard OAuth refresh-token grant.
pub struct HttpAdapter {
    kind: IntegrationKind,
    base_url: String,
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(
        kind: IntegrationKind,
        base_url: String,
        token_url: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            kind,
            base_url,
            token_url,
            client_id,
            client_secret,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn classify_status(&self, status: reqwest::StatusCode, body: String) -> StepError {
        if status.as_u16() == 429 || status.is_server_error() {
            StepError::Transient(format!("{} returned {}: {}", self.kind.as_str(), status, body))
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            StepError::ReauthorizationRequired(self.kind.as_str().to_string())
        } else {
            StepError::Terminal(format!("{} returned {}: {}", self.kind.as_str(), status, body))
        }
    }
}

#[async_trait]
impl IntegrationAdapter for HttpAdapter {
    fn kind(&self) -> IntegrationKind {
        self.kind
    }

    fn supports_refresh(&self) -> bool {
        self.token_url.is_some()
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedCredential, StepError> {
        let token_url = self
            .token_url
            .as_deref()
            .ok_or_else(|| StepError::ReauthorizationRequired(self.kind.as_str().to_string()))?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(id) = &self.client_id {
            form.push(("client_id", id.clone()));
        }
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .client
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| StepError::Transient(format!("token refresh request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StepError::Transient(format!("token refresh read failed: {}", e)))?;
        if !status.is_success() {
            // A rejected refresh token means the user must reconnect.
            return Err(StepError::ReauthorizationRequired(self.kind.as_str().to_string()));
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| StepError::Terminal(format!("token refresh parse failed: {}", e)))?;
        let access_token = json
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StepError::Terminal("token response missing access_token".into()))?
            .to_string();
        let expires_at = json
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .map(|secs| Utc::now() + Duration::seconds(secs));

        Ok(RefreshedCredential {
            access_token,
            refresh_token: json
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            expires_at,
        })
    }

    async fn invoke(
        &self,
        connection: &IntegrationConnection,
        action: &str,
        params: &Value,
    ) -> Result<Value, StepError> {
        let url = format!("{}/actions/{}", self.base_url.trim_end_matches('/'), action);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&connection.access_token)
            .json(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StepError::Transient(format!("{} request timed out", self.kind.as_str()))
                } else {
                    StepError::Transient(format!("{} request failed: {}", self.kind.as_str(), e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StepError::Transient(format!("response read failed: {}", e)))?;
        if !status.is_success() {
            return Err(self.classify_status(status, truncate(&body, 400)));
        }

        serde_json::from_str(&body).or(Ok(Value::String(body)))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Owns credential lifecycle for every integration access.
#[derive(Clone)]
pub struct IntegrationBroker {
    store: ConnectionStore,
    registry: Arc<AdapterRegistry>,
}

impl IntegrationBroker {
    pub fn new(store: ConnectionStore, registry: Arc<AdapterRegistry>) -> Self {
        Self { store, registry }
    }

    /// Return a live credential for (user, integration key).
    ///
    /// Expiry is checked against the current time on every call; an
    /// expired credential is refreshed through the adapter and persisted
    /// before being returned. Refresh being unsupported or failing
    /// surfaces as `ReauthorizationRequired`.
    pub async fn get_connection(
        &self,
        user_id: &str,
        integration_key: &str,
    ) -> Result<IntegrationConnection, StepError> {
        let kind: IntegrationKind = integration_key.parse()?;

        let connection = self
            .store
            .get(user_id, kind.as_str())
            .await
            .map_err(|e| StepError::Terminal(e.to_string()))?
            .filter(|c| c.status == ConnectionStatus::Active)
            .ok_or_else(|| StepError::NotConnected(kind.as_str().to_string()))?;

        if !connection.is_expired_at(Utc::now()) {
            return Ok(connection);
        }

        let adapter = self
            .registry
            .get(kind)
            .ok_or_else(|| StepError::ReauthorizationRequired(kind.as_str().to_string()))?;
        let refresh_token = connection
            .refresh_token
            .as_deref()
            .filter(|_| adapter.supports_refresh())
            .ok_or_else(|| StepError::ReauthorizationRequired(kind.as_str().to_string()))?;

        tracing::debug!(
            user_id,
            integration = kind.as_str(),
            "access token expired, refreshing"
        );
        let refreshed = adapter.refresh(refresh_token).await?;

        self.store
            .update_tokens(
                user_id,
                kind.as_str(),
                &refreshed.access_token,
                refreshed.refresh_token.clone(),
                refreshed.expires_at,
            )
            .await
            .map_err(|e| StepError::Terminal(e.to_string()))?;

        self.store
            .get(user_id, kind.as_str())
            .await
            .map_err(|e| StepError::Terminal(e.to_string()))?
            .ok_or_else(|| StepError::NotConnected(kind.as_str().to_string()))
    }

    /// Invoke one integration action with a live credential.
    pub async fn invoke(
        &self,
        user_id: &str,
        integration_key: &str,
        action: &str,
        params: &Value,
    ) -> Result<Value, StepError> {
        let connection = self.get_connection(user_id, integration_key).await?;
        let kind: IntegrationKind = integration_key.parse()?;
        let adapter = self
            .registry
            .get(kind)
            .ok_or_else(|| StepError::NotConnected(kind.as_str().to_string()))?;
        adapter.invoke(&connection, action, params).await
    }

    /// Connect (or reconnect) an integration for a user.
    pub async fn connect(
        &self,
        user_id: &str,
        integration_key: &str,
        access_token: &str,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IntegrationConnection, ServerError> {
        let kind: IntegrationKind = integration_key
            .parse()
            .map_err(|e: StepError| ServerError::BadRequest(e.to_string()))?;
        self.store
            .upsert(user_id, kind.as_str(), access_token, refresh_token, expires_at)
            .await
    }

    pub async fn disconnect(
        &self,
        user_id: &str,
        integration_key: &str,
    ) -> Result<bool, ServerError> {
        let kind: IntegrationKind = integration_key
            .parse()
            .map_err(|e: StepError| ServerError::BadRequest(e.to_string()))?;
        self.store.disconnect(user_id, kind.as_str()).await
    }
}
