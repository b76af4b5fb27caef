//! Code generator plugins and their registry.
//!
//! A plugin turns one concept into a pair of create/remove SQL scripts. The
//! registry maps concept types to their plugins; a plugin registered for a
//! base type also applies to every derived type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::code_builder::CodeBuilder;
use crate::concept::{ConceptId, ConceptModel, ConceptTypeRegistry};
use crate::error::Result;

/// A dependency between two concepts that cannot be derived from concept
/// references, declared by a plugin while extending the database structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtraDependency {
    /// The concept that must be created first.
    pub depends_on: ConceptId,
    /// The concept that requires it.
    pub dependent: ConceptId,
}

impl ExtraDependency {
    /// Creates a new extra dependency.
    #[must_use]
    pub fn new(depends_on: ConceptId, dependent: ConceptId) -> Self {
        Self {
            depends_on,
            dependent,
        }
    }
}

/// Generates the database structure for one concept type.
pub trait ConceptDatabaseDefinition: Send + Sync {
    /// Implementation type name, recorded with every application.
    fn implementation_type_name(&self) -> &str;

    /// Implementation version. Changing it recreates every application of
    /// this plugin.
    fn implementation_version(&self) -> &str {
        "1"
    }

    /// Returns the SQL that creates the database object for `concept`.
    fn create_database_structure(
        &self,
        concept: ConceptId,
        model: &ConceptModel,
    ) -> Result<String>;

    /// Returns the SQL that removes the database object for `concept`.
    fn remove_database_structure(
        &self,
        concept: ConceptId,
        model: &ConceptModel,
    ) -> Result<String>;

    /// Inserts code into structures created by other applications.
    ///
    /// Called after every application has written its create script to
    /// `code`. Returns dependencies that the inserted code introduces.
    fn extend_database_structure(
        &self,
        _concept: ConceptId,
        _model: &ConceptModel,
        _code: &mut CodeBuilder,
    ) -> Result<Vec<ExtraDependency>> {
        Ok(Vec::new())
    }
}

/// Returns the qualified implementation type name stored in the metadata,
/// e.g. `"EntityTable, Version=2"`.
#[must_use]
pub fn qualified_implementation_name(definition: &dyn ConceptDatabaseDefinition) -> String {
    format!(
        "{}, Version={}",
        definition.implementation_type_name(),
        definition.implementation_version()
    )
}

/// Registry of code generator plugins by concept type.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    definitions: HashMap<String, Vec<Arc<dyn ConceptDatabaseDefinition>>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin for a concept type.
    pub fn register<D>(&mut self, concept_type: impl Into<String>, definition: D) -> &mut Self
    where
        D: ConceptDatabaseDefinition + 'static,
    {
        self.definitions
            .entry(concept_type.into())
            .or_default()
            .push(Arc::new(definition));
        self
    }

    /// Returns the plugins that apply to `type_name`: those registered for
    /// the type itself, then those registered for each base type.
    pub fn definitions_for(
        &self,
        types: &ConceptTypeRegistry,
        type_name: &str,
    ) -> Result<Vec<Arc<dyn ConceptDatabaseDefinition>>> {
        let mut result = Vec::new();
        for name in types.type_chain(type_name)? {
            if let Some(definitions) = self.definitions.get(name) {
                result.extend(definitions.iter().cloned());
            }
        }
        Ok(result)
    }

    /// Returns the total number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.values().map(Vec::len).sum()
    }

    /// Returns whether no plugin is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (concept_type, definitions) in &self.definitions {
            let names: Vec<String> = definitions
                .iter()
                .map(|d| qualified_implementation_name(d.as_ref()))
                .collect();
            map.entry(concept_type, &names);
        }
        map.finish()
    }
}
