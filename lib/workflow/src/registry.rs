//! The process-wide table of workflow definitions.

use crate::builtin::{RegistrySettings, assessment_workflow, deal_workflow, lead_workflow};
use crate::definition::WorkflowDefinition;
use crate::entity::EntityType;
use crate::error::DefinitionError;
use std::collections::HashMap;
use std::sync::Arc;

/// Workflow definitions keyed by entity type.
///
/// Built once and read-only afterwards; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<EntityType, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    /// Builds a registry from explicit definitions, validating each one.
    ///
    /// # Errors
    ///
    /// Returns an error if a definition is invalid or two definitions share
    /// an entity type.
    pub fn new(
        definitions: impl IntoIterator<Item = WorkflowDefinition>,
    ) -> Result<Self, DefinitionError> {
        let mut map = HashMap::new();
        for definition in definitions {
            definition.validate()?;
            let entity_type = definition.entity_type();
            if map.insert(entity_type, Arc::new(definition)).is_some() {
                return Err(DefinitionError::DuplicateDefinition {
                    entity_type: entity_type.to_string(),
                });
            }
        }
        Ok(Self { definitions: map })
    }

    /// Builds the built-in workflows enabled by `settings`. The Deal
    /// workflow is always registered.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in definition fails validation.
    pub fn from_settings(settings: &RegistrySettings) -> Result<Self, DefinitionError> {
        let mut definitions = Vec::with_capacity(3);
        if settings.enable_lead_scoring {
            definitions.push(lead_workflow(&settings.thresholds, settings.timeouts)?);
        }
        if settings.assessment_workflow_enabled {
            definitions.push(assessment_workflow(&settings.thresholds, settings.timeouts)?);
        }
        definitions.push(deal_workflow(&settings.thresholds, settings.timeouts)?);
        for definition in &mut definitions {
            let names: Vec<String> = definition.states().map(|s| s.name.clone()).collect();
            for name in names {
                if let Some(duration) = settings.stage_duration(&name) {
                    definition.set_stage_duration(&name, duration)?;
                }
            }
        }
        Self::new(definitions)
    }

    /// Returns the definition for `entity_type`, if registered.
    #[must_use]
    pub fn get(&self, entity_type: EntityType) -> Option<&Arc<WorkflowDefinition>> {
        self.definitions.get(&entity_type)
    }

    /// Returns true if `entity_type` has a workflow.
    #[must_use]
    pub fn is_enabled(&self, entity_type: EntityType) -> bool {
        self.definitions.contains_key(&entity_type)
    }

    /// Returns the registered entity types in a stable order.
    #[must_use]
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<_> = self.definitions.keys().copied().collect();
        types.sort();
        types
    }
}
