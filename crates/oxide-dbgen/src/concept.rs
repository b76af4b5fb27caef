//! Concept model representation.
//!
//! A concept is one declared feature of the application model (a module, an
//! entity, a property, ...). Concept types are declared up front with their
//! members, so keys and references are known without any runtime reflection.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GeneratorError, Result};

/// A member (field) of a concept type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptMember {
    /// Member name.
    pub name: String,
    /// Whether the member is part of the concept key.
    #[serde(default)]
    pub key: bool,
    /// Whether the member references another concept.
    #[serde(default)]
    pub reference: bool,
}

impl ConceptMember {
    /// Creates a non-key value member.
    #[must_use]
    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: false,
            reference: false,
        }
    }

    /// Creates a non-key reference member.
    #[must_use]
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: false,
            reference: true,
        }
    }

    /// Marks this member as part of the key.
    #[must_use]
    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }
}

/// Declaration of a concept type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptType {
    /// Type name (e.g. "EntityInfo").
    pub name: String,
    /// Base type this type derives from, if any.
    #[serde(default)]
    pub base: Option<String>,
    /// Members declared by this type (in addition to inherited ones).
    #[serde(default)]
    pub members: Vec<ConceptMember>,
}

impl ConceptType {
    /// Creates a new concept type without members.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            members: Vec::new(),
        }
    }

    /// Sets the base type.
    #[must_use]
    pub fn derives_from(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Adds a member.
    #[must_use]
    pub fn member(mut self, member: ConceptMember) -> Self {
        self.members.push(member);
        self
    }
}

#[derive(Debug, Clone)]
struct RegisteredType {
    base: Option<String>,
    members: Vec<ConceptMember>,
}

/// Registry of concept types and their effective (inherited) members.
#[derive(Debug, Clone, Default)]
pub struct ConceptTypeRegistry {
    types: HashMap<String, RegisteredType>,
}

impl ConceptTypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a concept type. The base type must already be registered.
    pub fn register(&mut self, concept_type: ConceptType) -> Result<()> {
        if self.types.contains_key(&concept_type.name) {
            return Err(GeneratorError::InvalidModel(format!(
                "Concept type '{}' is registered twice",
                concept_type.name
            )));
        }

        let mut members = match &concept_type.base {
            Some(base) => self
                .types
                .get(base)
                .ok_or_else(|| GeneratorError::UnknownConceptType(base.clone()))?
                .members
                .clone(),
            None => Vec::new(),
        };
        for member in concept_type.members {
            if members.iter().any(|m| m.name == member.name) {
                return Err(GeneratorError::InvalidModel(format!(
                    "Member '{}' is declared twice on concept type '{}'",
                    member.name, concept_type.name
                )));
            }
            members.push(member);
        }
        if !members.iter().any(|m| m.key) {
            return Err(GeneratorError::InvalidModel(format!(
                "Concept type '{}' has no key member",
                concept_type.name
            )));
        }

        self.types.insert(
            concept_type.name,
            RegisteredType {
                base: concept_type.base,
                members,
            },
        );
        Ok(())
    }

    /// Returns the effective members of a type, inherited ones first.
    pub fn members(&self, type_name: &str) -> Result<&[ConceptMember]> {
        self.types
            .get(type_name)
            .map(|t| t.members.as_slice())
            .ok_or_else(|| GeneratorError::UnknownConceptType(type_name.to_string()))
    }

    /// Returns the type followed by all of its base types.
    pub fn type_chain(&self, type_name: &str) -> Result<Vec<&str>> {
        let mut chain = Vec::new();
        let mut current = Some(type_name);
        while let Some(name) = current {
            let (name, registered) = self
                .types
                .get_key_value(name)
                .ok_or_else(|| GeneratorError::UnknownConceptType(name.to_string()))?;
            chain.push(name.as_str());
            current = registered.base.as_deref();
        }
        Ok(chain)
    }

    /// Returns the root base type, used to normalize concept keys.
    pub fn root_type<'a>(&'a self, type_name: &str) -> Result<&'a str> {
        let chain = self.type_chain(type_name)?;
        chain
            .last()
            .copied()
            .ok_or_else(|| GeneratorError::UnknownConceptType(type_name.to_string()))
    }
}

/// Index of a concept within its [`ConceptModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConceptId(pub usize);

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Value of one concept member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemberValue {
    /// Plain text value.
    Text(String),
    /// Reference to another concept.
    Reference {
        /// The referenced concept.
        #[serde(rename = "ref")]
        concept: ConceptId,
    },
}

impl MemberValue {
    /// Creates a reference value.
    #[must_use]
    pub fn reference(concept: ConceptId) -> Self {
        Self::Reference { concept }
    }
}

impl From<&str> for MemberValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MemberValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<ConceptId> for MemberValue {
    fn from(concept: ConceptId) -> Self {
        Self::Reference { concept }
    }
}

/// One declared concept: a type name and positional member values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptInfo {
    /// Concept type name.
    pub type_name: String,
    /// Member values, in the order of the type's effective members.
    pub values: Vec<MemberValue>,
}

impl ConceptInfo {
    /// Creates a new concept.
    #[must_use]
    pub fn new(type_name: impl Into<String>, values: Vec<MemberValue>) -> Self {
        Self {
            type_name: type_name.into(),
            values,
        }
    }
}

/// An ordered, validated collection of concepts.
#[derive(Debug, Clone, Default)]
pub struct ConceptModel {
    types: ConceptTypeRegistry,
    concepts: Vec<ConceptInfo>,
}

impl ConceptModel {
    /// Creates an empty model over the given type registry.
    #[must_use]
    pub fn new(types: ConceptTypeRegistry) -> Self {
        Self {
            types,
            concepts: Vec::new(),
        }
    }

    /// Returns the type registry.
    #[must_use]
    pub fn types(&self) -> &ConceptTypeRegistry {
        &self.types
    }

    /// Adds a concept. References must point to concepts added earlier.
    pub fn add(&mut self, concept: ConceptInfo) -> Result<ConceptId> {
        let members = self.types.members(&concept.type_name)?;
        if members.len() != concept.values.len() {
            return Err(GeneratorError::InvalidModel(format!(
                "Concept of type '{}' has {} value(s), expected {}",
                concept.type_name,
                concept.values.len(),
                members.len()
            )));
        }

        for (member, value) in members.iter().zip(&concept.values) {
            match value {
                MemberValue::Reference { concept: target } if member.reference => {
                    if target.0 >= self.concepts.len() {
                        return Err(GeneratorError::InvalidModel(format!(
                            "Member '{}' of '{}' references unknown concept {}",
                            member.name, concept.type_name, target
                        )));
                    }
                }
                MemberValue::Text(_) if !member.reference => {}
                _ => {
                    return Err(GeneratorError::InvalidModel(format!(
                        "Member '{}' of '{}' has a value of the wrong kind",
                        member.name, concept.type_name
                    )));
                }
            }
        }

        let id = ConceptId(self.concepts.len());
        self.concepts.push(concept);
        Ok(id)
    }

    /// Returns a concept by id.
    pub fn get(&self, id: ConceptId) -> Result<&ConceptInfo> {
        self.concepts
            .get(id.0)
            .ok_or_else(|| GeneratorError::InvalidModel(format!("Unknown concept {id}")))
    }

    /// Returns the number of concepts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    /// Returns whether the model has no concepts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }

    /// Iterates over concepts in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (ConceptId, &ConceptInfo)> {
        self.concepts
            .iter()
            .enumerate()
            .map(|(index, concept)| (ConceptId(index), concept))
    }

    /// Returns the unique key of a concept, e.g. `"DataStructureInfo Sales.Invoice"`.
    ///
    /// Derived concepts are keyed by their root base type.
    pub fn key(&self, id: ConceptId) -> Result<String> {
        let concept = self.get(id)?;
        let root = self.types.root_type(&concept.type_name)?;
        Ok(format!("{} {}", root, self.key_values(id)?))
    }

    /// Returns the key member values joined with `.`.
    pub fn key_values(&self, id: ConceptId) -> Result<String> {
        let concept = self.get(id)?;
        let members = self.types.members(&concept.type_name)?;
        let mut parts = Vec::new();
        for (member, value) in members.iter().zip(&concept.values) {
            if !member.key {
                continue;
            }
            parts.push(self.display_value(value)?);
        }
        Ok(parts.join("."))
    }

    /// Returns the value of a member as text. References render as the
    /// referenced concept's key values.
    pub fn value(&self, id: ConceptId, member_name: &str) -> Result<String> {
        let concept = self.get(id)?;
        let members = self.types.members(&concept.type_name)?;
        let index = members
            .iter()
            .position(|m| m.name == member_name)
            .ok_or_else(|| {
                GeneratorError::InvalidModel(format!(
                    "Concept type '{}' has no member '{}'",
                    concept.type_name, member_name
                ))
            })?;
        self.display_value(&concept.values[index])
    }

    /// Returns the concept referenced by a member, if the member is a reference.
    pub fn referenced(&self, id: ConceptId, member_name: &str) -> Result<Option<ConceptId>> {
        let concept = self.get(id)?;
        let members = self.types.members(&concept.type_name)?;
        Ok(members
            .iter()
            .zip(&concept.values)
            .find(|(m, _)| m.name == member_name)
            .and_then(|(_, v)| match v {
                MemberValue::Reference { concept } => Some(*concept),
                MemberValue::Text(_) => None,
            }))
    }

    /// Returns the concepts directly referenced by a concept, deduplicated,
    /// in member order.
    pub fn dependencies(&self, id: ConceptId) -> Result<Vec<ConceptId>> {
        let concept = self.get(id)?;
        let mut result = Vec::new();
        for value in &concept.values {
            if let MemberValue::Reference { concept } = value {
                if !result.contains(concept) {
                    result.push(*concept);
                }
            }
        }
        Ok(result)
    }

    fn display_value(&self, value: &MemberValue) -> Result<String> {
        match value {
            MemberValue::Text(text) => Ok(text.clone()),
            MemberValue::Reference { concept } => self.key_values(*concept),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConceptTypeRegistry {
        let mut types = ConceptTypeRegistry::new();
        types
            .register(ConceptType::new("ModuleInfo").member(ConceptMember::value("Name").key()))
            .unwrap();
        types
            .register(
                ConceptType::new("DataStructureInfo")
                    .member(ConceptMember::reference("Module").key())
                    .member(ConceptMember::value("Name").key()),
            )
            .unwrap();
        types
            .register(ConceptType::new("EntityInfo").derives_from("DataStructureInfo"))
            .unwrap();
        types
            .register(
                ConceptType::new("PropertyInfo")
                    .member(ConceptMember::reference("DataStructure").key())
                    .member(ConceptMember::value("Name").key())
                    .member(ConceptMember::value("SqlType")),
            )
            .unwrap();
        types
    }

    #[test]
    fn test_keys_use_root_type() {
        let mut model = ConceptModel::new(registry());
        let module = model
            .add(ConceptInfo::new("ModuleInfo", vec!["Sales".into()]))
            .unwrap();
        let entity = model
            .add(ConceptInfo::new(
                "EntityInfo",
                vec![module.into(), "Invoice".into()],
            ))
            .unwrap();
        let property = model
            .add(ConceptInfo::new(
                "PropertyInfo",
                vec![entity.into(), "Total".into(), "NUMERIC".into()],
            ))
            .unwrap();

        assert_eq!(model.key(module).unwrap(), "ModuleInfo Sales");
        assert_eq!(model.key(entity).unwrap(), "DataStructureInfo Sales.Invoice");
        assert_eq!(model.key(property).unwrap(), "PropertyInfo Sales.Invoice.Total");
        assert_eq!(model.value(property, "SqlType").unwrap(), "NUMERIC");
        assert_eq!(model.value(property, "DataStructure").unwrap(), "Sales.Invoice");
        assert_eq!(model.referenced(property, "DataStructure").unwrap(), Some(entity));
        assert_eq!(model.dependencies(property).unwrap(), vec![entity]);
    }

    #[test]
    fn test_type_chain() {
        let types = registry();
        assert_eq!(
            types.type_chain("EntityInfo").unwrap(),
            vec!["EntityInfo", "DataStructureInfo"]
        );
        assert_eq!(types.root_type("EntityInfo").unwrap(), "DataStructureInfo");
        assert!(matches!(
            types.type_chain("Missing"),
            Err(GeneratorError::UnknownConceptType(_))
        ));
    }

    #[test]
    fn test_register_rejects_invalid_types() {
        let mut types = registry();
        assert!(types.register(ConceptType::new("ModuleInfo")).is_err());
        assert!(matches!(
            types.register(ConceptType::new("NoKey").member(ConceptMember::value("Name"))),
            Err(GeneratorError::InvalidModel(_))
        ));
        assert!(matches!(
            types.register(ConceptType::new("Orphan").derives_from("Unknown")),
            Err(GeneratorError::UnknownConceptType(_))
        ));
    }

    #[test]
    fn test_add_validates_values() {
        let mut model = ConceptModel::new(registry());

        // Forward reference.
        let result = model.add(ConceptInfo::new(
            "EntityInfo",
            vec![ConceptId(5).into(), "Invoice".into()],
        ));
        assert!(matches!(result, Err(GeneratorError::InvalidModel(_))));

        // Wrong value count.
        let result = model.add(ConceptInfo::new("ModuleInfo", vec![]));
        assert!(matches!(result, Err(GeneratorError::InvalidModel(_))));

        // Text where a reference is expected.
        let result = model.add(ConceptInfo::new(
            "EntityInfo",
            vec!["Sales".into(), "Invoice".into()],
        ));
        assert!(matches!(result, Err(GeneratorError::InvalidModel(_))));

        assert!(model.is_empty());
    }
}
