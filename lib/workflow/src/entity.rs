//! Business entities the workflows track, and read access to their data.

use crate::error::RepositoryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The kinds of entity that have a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Lead,
    Assessment,
    Deal,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [Self::Lead, Self::Assessment, Self::Deal];

    /// Wire name of the entity type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Assessment => "assessment",
            Self::Deal => "deal",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown entity type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEntityTypeError {
    pub input: String,
}

impl fmt::Display for ParseEntityTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown entity type '{}'", self.input)
    }
}

impl std::error::Error for ParseEntityTypeError {}

impl FromStr for EntityType {
    type Err = ParseEntityTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lead" => Ok(Self::Lead),
            "assessment" => Ok(Self::Assessment),
            "deal" => Ok(Self::Deal),
            _ => Err(ParseEntityTypeError {
                input: s.to_string(),
            }),
        }
    }
}

/// Read access to entity records owned by the host platform.
///
/// The engine never writes entity records.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Loads the record for an entity, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be reached or the record
    /// cannot be decoded.
    async fn load(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<JsonValue>, RepositoryError>;
}

/// Entity records held in memory. Used by tests and embedded hosts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEntityRepository {
    records: Arc<RwLock<HashMap<(EntityType, String), JsonValue>>>,
}

impl InMemoryEntityRepository {
    /// An empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record.
    pub async fn upsert(&self, entity_type: EntityType, entity_id: impl Into<String>, data: JsonValue) {
        self.records
            .write()
            .await
            .insert((entity_type, entity_id.into()), data);
    }

    /// Sets one top-level field of an existing record. Returns false if the
    /// record does not exist or is not an object.
    pub async fn set_field(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        field: &str,
        value: JsonValue,
    ) -> bool {
        let mut records = self.records.write().await;
        match records
            .get_mut(&(entity_type, entity_id.to_string()))
            .and_then(JsonValue::as_object_mut)
        {
            Some(object) => {
                object.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl EntityRepository for InMemoryEntityRepository {
    async fn load(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<JsonValue>, RepositoryError> {
        Ok(self
            .records
            .read()
            .await
            .get(&(entity_type, entity_id.to_string()))
            .cloned())
    }
}
