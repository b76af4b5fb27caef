//! Builds the new database model from the concept model.
//!
//! Every (concept, plugin) pair becomes one [`NewConceptApplication`]. Create
//! scripts are generated into a shared [`CodeBuilder`] so that plugins can
//! extend structures created by other applications, then split back into
//! one script per application.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::application::{ConceptApplicationKey, NewConceptApplication};
use crate::code_builder::{CodeBuilder, application_marker};
use crate::concept::{ConceptId, ConceptModel};
use crate::error::{GeneratorError, Result};
use crate::model_dependencies::DatabaseModelDependencies;
use crate::plugins::{
    ConceptDatabaseDefinition, ExtraDependency, PluginRegistry, qualified_implementation_name,
};

struct PendingApplication {
    concept: ConceptId,
    concept_info_type_name: String,
    key: ConceptApplicationKey,
    definition: Arc<dyn ConceptDatabaseDefinition>,
}

impl PendingApplication {
    fn wrap_error(&self, error: GeneratorError) -> GeneratorError {
        match error {
            GeneratorError::CodeGeneration { .. } => error,
            other => GeneratorError::CodeGeneration {
                implementation: self.key.implementation_type_name.clone(),
                concept: self.key.concept_info_key.clone(),
                message: other.to_string(),
            },
        }
    }
}

/// Produces the new concept applications for a concept model.
#[derive(Debug)]
pub struct DatabaseModelBuilder<'a> {
    plugins: &'a PluginRegistry,
}

impl<'a> DatabaseModelBuilder<'a> {
    /// Creates a builder over a plugin registry.
    #[must_use]
    pub fn new(plugins: &'a PluginRegistry) -> Self {
        Self { plugins }
    }

    /// Builds the new concept applications, in model declaration order.
    ///
    /// Fails if two applications share a key, if a plugin fails, or if the
    /// shared code buffer cannot be split back into per-application scripts.
    pub fn build(&self, model: &ConceptModel) -> Result<Vec<NewConceptApplication>> {
        let pending = self.pending_applications(model)?;
        let (create_queries, extra_dependencies) = generate_create_queries(model, &pending)?;

        let mut applications = Vec::with_capacity(pending.len());
        for (application, create_query) in pending.iter().zip(create_queries) {
            let remove_query = application
                .definition
                .remove_database_structure(application.concept, model)
                .map_err(|e| application.wrap_error(e))?;
            applications.push(NewConceptApplication {
                id: Uuid::new_v4(),
                concept: application.concept,
                concept_info_type_name: application.concept_info_type_name.clone(),
                concept_info_key: application.key.concept_info_key.clone(),
                implementation_type_name: application.key.implementation_type_name.clone(),
                create_query,
                remove_query,
                depends_on: Vec::new(),
            });
        }

        check_duplicate_keys(&applications)?;

        let dependencies =
            DatabaseModelDependencies::new(model, &applications).dependencies(&extra_dependencies)?;
        for (depends_on, dependent) in dependencies {
            let key = applications[depends_on].key();
            applications[dependent].depends_on.push(key);
        }

        info!(
            concepts = model.len(),
            applications = applications.len(),
            "Built new database model"
        );
        Ok(applications)
    }

    fn pending_applications(&self, model: &ConceptModel) -> Result<Vec<PendingApplication>> {
        let mut pending = Vec::new();
        for (concept, info) in model.iter() {
            let definitions = self.plugins.definitions_for(model.types(), &info.type_name)?;
            if definitions.is_empty() {
                continue;
            }
            let concept_key = model.key(concept)?;
            for definition in definitions {
                pending.push(PendingApplication {
                    concept,
                    concept_info_type_name: info.type_name.clone(),
                    key: ConceptApplicationKey::new(
                        concept_key.clone(),
                        qualified_implementation_name(definition.as_ref()),
                    ),
                    definition,
                });
            }
        }
        Ok(pending)
    }
}

fn generate_create_queries(
    model: &ConceptModel,
    pending: &[PendingApplication],
) -> Result<(Vec<String>, Vec<ExtraDependency>)> {
    let mut code = CodeBuilder::new();
    for (index, application) in pending.iter().enumerate() {
        let create = application
            .definition
            .create_database_structure(application.concept, model)
            .map_err(|e| application.wrap_error(e))?;
        code.append(&application_marker(index));
        code.append(&create);
    }

    let mut extra_dependencies = Vec::new();
    for application in pending {
        let created = application
            .definition
            .extend_database_structure(application.concept, model, &mut code)
            .map_err(|e| application.wrap_error(e))?;
        extra_dependencies.extend(created);
    }

    let owners: Vec<String> = pending.iter().map(|a| a.key.to_string()).collect();
    let create_queries = code.split_by_markers(&owners)?;
    debug!(
        length = code.as_str().len(),
        extra_dependencies = extra_dependencies.len(),
        "Split generated code into application scripts"
    );
    Ok((create_queries, extra_dependencies))
}

fn check_duplicate_keys(applications: &[NewConceptApplication]) -> Result<()> {
    let mut ids: HashMap<ConceptApplicationKey, Uuid> = HashMap::with_capacity(applications.len());
    for application in applications {
        if let Some(first_id) = ids.insert(application.key(), application.id) {
            return Err(GeneratorError::DuplicateApplication {
                key: application.key().to_string(),
                first_id,
                second_id: application.id,
            });
        }
    }
    Ok(())
}
