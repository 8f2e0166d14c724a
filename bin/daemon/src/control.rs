//! NATS request/reply control surface.
//!
//! Requests arrive on `{prefix}.start`, `{prefix}.advance`, `{prefix}.cancel`,
//! `{prefix}.status` and `{prefix}.transitions` with a JSON body. Every
//! request with a reply subject gets a [`ControlReply`].

use crate::error::DaemonError;
use async_nats::{Client, Message};
use dealflow_core::WorkflowInstanceId;
use dealflow_engine::{EngineError, ExternalEvent, WorkflowEngine};
use dealflow_workflow::{EntityType, ErrorKind};
use futures::StreamExt;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// The operations served on the control subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOperation {
    Start,
    Advance,
    Cancel,
    Status,
    Transitions,
}

impl ControlOperation {
    /// Returns the subject suffix for the operation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Advance => "advance",
            Self::Cancel => "cancel",
            Self::Status => "status",
            Self::Transitions => "transitions",
        }
    }

    /// Resolves the operation a subject addresses under `prefix`.
    #[must_use]
    pub fn from_subject(prefix: &str, subject: &str) -> Option<Self> {
        let operation = subject.strip_prefix(prefix)?.strip_prefix('.')?;
        match operation {
            "start" => Some(Self::Start),
            "advance" => Some(Self::Advance),
            "cancel" => Some(Self::Cancel),
            "status" => Some(Self::Status),
            "transitions" => Some(Self::Transitions),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    entity_type: EntityType,
    entity_id: String,
}

#[derive(Debug, Deserialize)]
struct AdvanceRequest {
    instance_id: WorkflowInstanceId,
    event: ExternalEvent,
}

#[derive(Debug, Deserialize)]
struct InstanceRequest {
    instance_id: WorkflowInstanceId,
}

/// The body of every control reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlReply {
    Ok { result: JsonValue },
    Error { kind: ErrorKind, message: String },
}

impl ControlReply {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Error {
            kind: ErrorKind::Validation,
            message: message.into(),
        }
    }

    fn from_engine(err: &Report<EngineError>) -> Self {
        let context = err.current_context();
        Self::Error {
            kind: context.kind(),
            message: context.to_string(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","kind":"validation","message":"{e}"}}"#).into_bytes()
        })
    }
}

/// Runs control operations against an engine.
#[derive(Clone)]
pub struct ControlHandler {
    engine: Arc<WorkflowEngine>,
}

impl ControlHandler {
    /// Creates a handler for `engine`.
    #[must_use]
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Decodes `payload` for `operation` and runs it.
    #[instrument(skip(self, payload), fields(operation = operation.as_str()))]
    pub async fn handle(&self, operation: ControlOperation, payload: &[u8]) -> ControlReply {
        match operation {
            ControlOperation::Start => {
                let request: StartRequest = match decode(payload) {
                    Ok(request) => request,
                    Err(reply) => return reply,
                };
                match self
                    .engine
                    .start(&request.entity_id, request.entity_type)
                    .await
                {
                    Ok(instance_id) => ControlReply::Ok {
                        result: json!({ "instance_id": instance_id }),
                    },
                    Err(e) => ControlReply::from_engine(&e),
                }
            }
            ControlOperation::Advance => {
                let request: AdvanceRequest = match decode(payload) {
                    Ok(request) => request,
                    Err(reply) => return reply,
                };
                match self
                    .engine
                    .advance(request.instance_id, request.event)
                    .await
                {
                    Ok(()) => ControlReply::Ok {
                        result: json!({ "instance_id": request.instance_id }),
                    },
                    Err(e) => ControlReply::from_engine(&e),
                }
            }
            ControlOperation::Cancel => {
                let request: InstanceRequest = match decode(payload) {
                    Ok(request) => request,
                    Err(reply) => return reply,
                };
                json_reply(self.engine.cancel(request.instance_id).await)
            }
            ControlOperation::Status => {
                let request: InstanceRequest = match decode(payload) {
                    Ok(request) => request,
                    Err(reply) => return reply,
                };
                json_reply(self.engine.get_status(request.instance_id).await)
            }
            ControlOperation::Transitions => {
                let request: InstanceRequest = match decode(payload) {
                    Ok(request) => request,
                    Err(reply) => return reply,
                };
                json_reply(self.engine.available_transitions(request.instance_id).await)
            }
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, ControlReply> {
    serde_json::from_slice(payload)
        .map_err(|e| ControlReply::invalid(format!("malformed request: {e}")))
}

fn json_reply<T: Serialize>(outcome: Result<T, Report<EngineError>>) -> ControlReply {
    match outcome {
        Ok(instance) => match serde_json::to_value(instance) {
            Ok(result) => ControlReply::Ok { result },
            Err(e) => ControlReply::invalid(format!("failed to encode reply: {e}")),
        },
        Err(e) => ControlReply::from_engine(&e),
    }
}

/// Serves [`ControlHandler`] on NATS.
pub struct ControlServer {
    handler: ControlHandler,
    client: Client,
    prefix: String,
}

impl ControlServer {
    /// Creates a server answering on `{prefix}.*`.
    #[must_use]
    pub fn new(engine: Arc<WorkflowEngine>, client: Client, prefix: impl Into<String>) -> Self {
        Self {
            handler: ControlHandler::new(engine),
            client,
            prefix: prefix.into(),
        }
    }

    /// Answers control requests until `shutdown` flips to true.
    ///
    /// # Errors
    ///
    /// Returns an error if the control subjects cannot be subscribed to.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DaemonError> {
        let subject = format!("{}.*", self.prefix);
        let mut subscriber =
            self.client
                .subscribe(subject.clone())
                .await
                .map_err(|e| DaemonError::Subscribe {
                    subject: subject.clone(),
                    reason: e.to_string(),
                })?;
        info!(subject = %subject, "Serving control requests");

        loop {
            tokio::select! {
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    let handler = self.handler.clone();
                    let client = self.client.clone();
                    let prefix = self.prefix.clone();
                    tokio::spawn(async move {
                        if let Err(e) = respond(&handler, &client, &prefix, message).await {
                            warn!(error = %e, "Failed to answer control request");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = subscriber.unsubscribe().await {
            debug!(error = %e, "Unsubscribe after shutdown failed");
        }
        info!("Control server stopped");
        Ok(())
    }
}

async fn respond(
    handler: &ControlHandler,
    client: &Client,
    prefix: &str,
    message: Message,
) -> Result<(), DaemonError> {
    let subject = message.subject.to_string();
    let reply = match ControlOperation::from_subject(prefix, &subject) {
        Some(operation) => handler.handle(operation, &message.payload).await,
        None => ControlReply::invalid(format!("unknown control subject {subject}")),
    };

    let Some(reply_to) = message.reply else {
        debug!(subject = %subject, "Control request without reply subject");
        return Ok(());
    };
    client
        .publish(reply_to.clone(), reply.encode().into())
        .await
        .map_err(|e| DaemonError::Reply {
            subject: reply_to.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealflow_engine::EngineConfig;
    use dealflow_workflow::InMemoryEntityRepository;

    async fn handler() -> ControlHandler {
        let entities = InMemoryEntityRepository::new();
        entities
            .upsert(EntityType::Deal, "deal-1", json!({ "irr": 0.1 }))
            .await;
        let engine = WorkflowEngine::builder(EngineConfig::default())
            .with_entity_repository(Arc::new(entities))
            .build()
            .unwrap();
        ControlHandler::new(Arc::new(engine))
    }

    fn ok_result(reply: ControlReply) -> JsonValue {
        match reply {
            ControlReply::Ok { result } => result,
            ControlReply::Error { message, .. } => panic!("unexpected error: {message}"),
        }
    }

    #[test]
    fn subjects_resolve_under_the_prefix() {
        assert_eq!(
            ControlOperation::from_subject("dealflow.control", "dealflow.control.advance"),
            Some(ControlOperation::Advance)
        );
        assert_eq!(
            ControlOperation::from_subject("dealflow.control", "dealflow.controlx.start"),
            None
        );
        assert_eq!(
            ControlOperation::from_subject("dealflow.control", "dealflow.control.delete"),
            None
        );
        assert_eq!(
            ControlOperation::from_subject("dealflow.control", "dealflow.control.transitions"),
            Some(ControlOperation::Transitions)
        );
    }

    #[test]
    fn reply_wire_format() {
        let reply = ControlReply::Error {
            kind: ErrorKind::Validation,
            message: "nope".to_string(),
        };
        let value: JsonValue = serde_json::from_slice(&reply.encode()).unwrap();
        assert_eq!(
            value,
            json!({ "status": "error", "kind": "validation", "message": "nope" })
        );
    }

    #[tokio::test]
    async fn start_then_status_then_cancel() {
        let handler = handler().await;

        let started = ok_result(
            handler
                .handle(
                    ControlOperation::Start,
                    br#"{"entity_type":"deal","entity_id":"deal-1"}"#,
                )
                .await,
        );
        let instance_id = started["instance_id"].clone();
        let by_id = serde_json::to_vec(&json!({ "instance_id": instance_id })).unwrap();

        let status = ok_result(handler.handle(ControlOperation::Status, &by_id).await);
        assert_eq!(status["entity_id"], "deal-1");
        assert_eq!(status["status"], "running");

        let transitions = ok_result(handler.handle(ControlOperation::Transitions, &by_id).await);
        assert_eq!(transitions[0]["to_state"], "NEGOTIATION");
        assert_eq!(transitions[0]["available"], false);
        assert_eq!(
            transitions[0]["requirements"][1]["description"],
            "entity.deal_lead is present"
        );

        let cancelled = ok_result(handler.handle(ControlOperation::Cancel, &by_id).await);
        assert_eq!(cancelled["status"], "cancelled");

        let advance = serde_json::to_vec(&json!({
            "instance_id": instance_id,
            "event": { "type": "entity_updated" },
        }))
        .unwrap();
        let reply = handler.handle(ControlOperation::Advance, &advance).await;
        assert!(
            matches!(reply, ControlReply::Error { kind: ErrorKind::Validation, .. }),
            "{reply:?}"
        );
    }

    #[tokio::test]
    async fn malformed_requests_are_validation_errors() {
        let handler = handler().await;
        let reply = handler
            .handle(ControlOperation::Start, br#"{"entity_type":"yacht"}"#)
            .await;
        match reply {
            ControlReply::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::Validation);
                assert!(message.starts_with("malformed request"), "{message}");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_instances_are_reported() {
        let handler = handler().await;
        let body = serde_json::to_vec(&json!({ "instance_id": WorkflowInstanceId::new() })).unwrap();
        let reply = handler.handle(ControlOperation::Status, &body).await;
        match reply {
            ControlReply::Error { message, .. } => assert!(message.contains("not found"), "{message}"),
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
