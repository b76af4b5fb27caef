//! JSON model files.
//!
//! A model file declares concept types, concepts and template code
//! generators:
//!
//! ```json
//! {
//!   "concept_types": [
//!     { "name": "EntityInfo", "members": [{ "name": "Name", "key": true }] }
//!   ],
//!   "concepts": [
//!     { "type": "EntityInfo", "values": { "Name": "Invoice" } }
//!   ],
//!   "definitions": [
//!     {
//!       "concept_type": "EntityInfo",
//!       "implementation": "EntityTable",
//!       "create": "CREATE TABLE {Name} (ID TEXT PRIMARY KEY)",
//!       "remove": "DROP TABLE {Name}"
//!     }
//!   ]
//! }
//! ```
//!
//! Concept values are keyed by member name; a reference is written as
//! `{ "ref": n }` where `n` is the index of an earlier concept in the file.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::concept::{ConceptInfo, ConceptModel, ConceptType, ConceptTypeRegistry, MemberValue};
use crate::error::{GeneratorError, Result};
use crate::plugins::PluginRegistry;
use crate::template::SqlTemplateDefinition;

/// A concept as written in a model file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptEntry {
    /// Concept type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Member values by member name.
    #[serde(default)]
    pub values: BTreeMap<String, MemberValue>,
}

/// A template code generator bound to a concept type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionEntry {
    /// Concept type the generator applies to (and to its derived types).
    pub concept_type: String,
    /// The generator.
    #[serde(flatten)]
    pub definition: SqlTemplateDefinition,
}

/// Contents of a model file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    /// Concept types, bases before derived types.
    #[serde(default)]
    pub concept_types: Vec<ConceptType>,
    /// Concepts in declaration order.
    #[serde(default)]
    pub concepts: Vec<ConceptEntry>,
    /// Code generators.
    #[serde(default)]
    pub definitions: Vec<DefinitionEntry>,
}

impl ModelFile {
    /// Reads and parses a model file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let file: Self = serde_json::from_str(&content).map_err(|source| {
            GeneratorError::ModelFile {
                path: path.to_path_buf(),
                source,
            }
        })?;
        debug!(
            path = %path.display(),
            concepts = file.concepts.len(),
            definitions = file.definitions.len(),
            "Loaded model file"
        );
        Ok(file)
    }

    /// Parses a model from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds the concept model and the plugin registry.
    pub fn into_model(self) -> Result<(ConceptModel, PluginRegistry)> {
        let mut types = ConceptTypeRegistry::new();
        for concept_type in self.concept_types {
            types.register(concept_type)?;
        }

        let mut model = ConceptModel::new(types);
        for (index, mut entry) in self.concepts.into_iter().enumerate() {
            let members = model.types().members(&entry.type_name)?;
            let mut values = Vec::with_capacity(members.len());
            for member in members {
                let value = entry.values.remove(&member.name).ok_or_else(|| {
                    GeneratorError::InvalidModel(format!(
                        "Concept {index} of type '{}' has no value for '{}'",
                        entry.type_name, member.name
                    ))
                })?;
                values.push(value);
            }
            if let Some(unknown) = entry.values.keys().next() {
                return Err(GeneratorError::InvalidModel(format!(
                    "Concept {index} of type '{}' has unknown member '{unknown}'",
                    entry.type_name
                )));
            }
            model.add(ConceptInfo::new(entry.type_name, values))?;
        }

        let mut plugins = PluginRegistry::new();
        for entry in self.definitions {
            model.types().members(&entry.concept_type)?;
            plugins.register(entry.concept_type, entry.definition);
        }
        Ok((model, plugins))
    }
}
