//! HTTP adapters for agents, side-effect services and the entity store.
//!
//! Every outbound call carries the work item's idempotency key in the
//! `Idempotency-Key` header so that receivers can drop duplicates.

use crate::error::DaemonError;
use async_trait::async_trait;
use dealflow_agent::{Agent, AgentCallError, AgentRequest};
use dealflow_core::{IdempotencyKey, WorkflowInstanceId};
use dealflow_integration::{HandlerError, SideEffectHandler, SideEffectKind, SideEffectRequest};
use dealflow_workflow::{EntityRepository, EntityType, RepositoryError};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Builds the client shared by every adapter.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn client(timeout: Duration) -> Result<Client, DaemonError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DaemonError::HttpClient {
            reason: e.to_string(),
        })
}

/// An agent reached by POSTing its request to an endpoint.
#[derive(Clone)]
pub struct HttpAgent {
    name: String,
    endpoint: String,
    client: Client,
}

impl HttpAgent {
    /// Creates an agent that posts requests to `endpoint`.
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, request), fields(agent = %self.name, key = %request.idempotency_key, attempt = request.attempt))]
    async fn invoke(&self, request: &AgentRequest) -> Result<JsonValue, AgentCallError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key.as_str())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentCallError::Timeout
                } else {
                    AgentCallError::Unavailable {
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Agent returned an error status");
            return Err(agent_error(status, body));
        }

        let result = response
            .json::<JsonValue>()
            .await
            .map_err(|e| AgentCallError::Failed {
                reason: format!("invalid response body: {e}"),
            })?;
        debug!("Agent answered");
        Ok(result)
    }
}

/// Maps a non-success status from an agent endpoint.
#[must_use]
pub fn agent_error(status: StatusCode, body: String) -> AgentCallError {
    let reason = format!("{status}: {body}");
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AgentCallError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => AgentCallError::Unavailable { reason },
        s if s.is_client_error() => AgentCallError::Rejected { reason },
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            AgentCallError::Unavailable { reason }
        }
        _ => AgentCallError::Failed { reason },
    }
}

/// Body POSTed to a side-effect endpoint. Credentials travel in headers.
#[derive(Debug, Serialize)]
struct SideEffectCall<'a> {
    kind: SideEffectKind,
    label: &'a str,
    instance_id: WorkflowInstanceId,
    payload: &'a JsonValue,
    idempotency_key: &'a IdempotencyKey,
    attempt: u32,
}

/// Delivers one kind of side effect to an HTTP endpoint.
#[derive(Clone)]
pub struct HttpSideEffectHandler {
    kind: SideEffectKind,
    endpoint: String,
    client: Client,
}

impl HttpSideEffectHandler {
    /// Creates a handler that posts `kind` tasks to `endpoint`.
    #[must_use]
    pub fn new(kind: SideEffectKind, endpoint: impl Into<String>, client: Client) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl SideEffectHandler for HttpSideEffectHandler {
    fn kind(&self) -> SideEffectKind {
        self.kind
    }

    #[instrument(skip(self, request), fields(kind = %self.kind.as_str(), key = %request.idempotency_key))]
    async fn execute(&self, request: &SideEffectRequest) -> Result<(), HandlerError> {
        let body = SideEffectCall {
            kind: request.kind,
            label: &request.label,
            instance_id: request.instance_id,
            payload: &request.payload,
            idempotency_key: &request.idempotency_key,
            attempt: request.attempt,
        };
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key.as_str())
            .json(&body);
        if let Some(credential) = &request.credential {
            let (name, value) = credential.authorization_header();
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HandlerError::Timeout
            } else {
                HandlerError::ConnectionFailed {
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        warn!(%status, "Side-effect endpoint returned an error status");
        Err(handler_error(status, body))
    }
}

/// Maps a non-success status from a side-effect endpoint.
#[must_use]
pub fn handler_error(status: StatusCode, body: String) -> HandlerError {
    let reason = format!("{status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            HandlerError::AuthenticationFailed { reason }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => HandlerError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => HandlerError::Failed { reason },
        s if s.is_client_error() => HandlerError::Rejected { reason },
        _ => HandlerError::Failed { reason },
    }
}

/// Reads entity records from `GET {base_url}/{entity_type}/{entity_id}`.
#[derive(Clone)]
pub struct HttpEntityRepository {
    base_url: String,
    client: Client,
}

impl HttpEntityRepository {
    /// Creates a repository that reads entities under `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn record_url(&self, entity_type: EntityType, entity_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, entity_type, entity_id)
    }
}

#[async_trait]
impl EntityRepository for HttpEntityRepository {
    #[instrument(skip(self), fields(entity_type = %entity_type))]
    async fn load(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<JsonValue>, RepositoryError> {
        let response = self
            .client
            .get(self.record_url(entity_type, entity_id))
            .send()
            .await
            .map_err(|e| RepositoryError::Unavailable {
                reason: e.to_string(),
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<JsonValue>()
                .await
                .map(Some)
                .map_err(|e| RepositoryError::Malformed {
                    reason: e.to_string(),
                }),
            status => Err(RepositoryError::Unavailable {
                reason: format!("entity store returned {status}"),
            }),
        }
    }
}
