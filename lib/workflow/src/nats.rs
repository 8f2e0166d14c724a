//! Lifecycle events on NATS JetStream.
//!
//! Events are published to `dealflow.instance.<instance_id>`, one subject
//! per instance, so consumers can filter a single instance's timeline.

use crate::envelope::Envelope;
use crate::error::EventSinkError;
use crate::event::{EventSink, LifecycleEvent};
use async_nats::jetstream;
use async_trait::async_trait;
use dealflow_core::WorkflowInstanceId;

/// Subject prefix for instance lifecycle events.
const INSTANCE_EVENTS_SUBJECT_PREFIX: &str = "dealflow.instance";

/// Default stream name for lifecycle events.
const EVENTS_STREAM_NAME: &str = "DEALFLOW_EVENTS";

/// Where lifecycle events are published.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    /// Defaults to `DEALFLOW_EVENTS`.
    pub events_stream_name: Option<String>,
}

impl NatsConfig {
    /// Creates a config using the default stream name.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events_stream_name: None,
        }
    }

    fn events_stream(&self) -> &str {
        self.events_stream_name
            .as_deref()
            .unwrap_or(EVENTS_STREAM_NAME)
    }
}

/// JetStream-backed event sink.
pub struct NatsEventSink {
    jetstream: jetstream::Context,
}

impl NatsEventSink {
    /// Connects to NATS and ensures the events stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn connect(config: NatsConfig) -> Result<Self, EventSinkError> {
        let client = async_nats::connect(&config.url).await.map_err(|e| {
            EventSinkError::ConnectionFailed {
                message: e.to_string(),
            }
        })?;
        Self::with_client(client, config).await
    }

    /// Uses an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be created.
    pub async fn with_client(
        client: async_nats::Client,
        config: NatsConfig,
    ) -> Result<Self, EventSinkError> {
        let jetstream = jetstream::new(client);
        let stream_config = jetstream::stream::Config {
            name: config.events_stream().to_string(),
            subjects: vec![format!("{INSTANCE_EVENTS_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };
        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| EventSinkError::ConnectionFailed {
                message: format!("failed to create events stream: {e}"),
            })?;
        Ok(Self { jetstream })
    }

    fn instance_subject(instance_id: WorkflowInstanceId) -> String {
        format!("{INSTANCE_EVENTS_SUBJECT_PREFIX}.{instance_id}")
    }
}

#[async_trait]
impl EventSink for NatsEventSink {
    async fn publish(&self, event: &Envelope<LifecycleEvent>) -> Result<(), EventSinkError> {
        let subject = Self::instance_subject(event.payload.instance_id());
        let bytes = event
            .to_json_bytes()
            .map_err(|e| EventSinkError::PublishFailed {
                message: format!("failed to serialize event: {e}"),
            })?;

        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| EventSinkError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| EventSinkError::PublishFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }
}
