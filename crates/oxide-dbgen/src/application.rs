//! Concept application types.
//!
//! A concept application is one database object generated from one concept
//! by one code generator. Applied ones are persisted in the metadata tables;
//! new ones are computed from the current concept model on every run.

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::concept::ConceptId;

/// Identity of a concept application within one model snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConceptApplicationKey {
    /// Key of the concept, e.g. `"DataStructureInfo Sales.Invoice"`.
    pub concept_info_key: String,
    /// Qualified implementation type name of the code generator.
    pub implementation_type_name: String,
}

impl ConceptApplicationKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(
        concept_info_key: impl Into<String>,
        implementation_type_name: impl Into<String>,
    ) -> Self {
        Self {
            concept_info_key: concept_info_key.into(),
            implementation_type_name: implementation_type_name.into(),
        }
    }
}

impl fmt::Display for ConceptApplicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {}",
            self.concept_info_key, self.implementation_type_name
        )
    }
}

/// A concept application as stored in the metadata tables.
#[derive(Debug, Clone, PartialEq)]
pub struct ConceptApplication {
    /// Stable identity, preserved while the object is not recreated with a
    /// different definition.
    pub id: Uuid,
    /// Type name of the concept that produced this application.
    pub concept_info_type_name: String,
    /// Key of the concept that produced this application.
    pub concept_info_key: String,
    /// Qualified implementation type name of the code generator.
    pub implementation_type_name: String,
    /// SQL that creates the database object.
    pub create_query: String,
    /// SQL that removes the database object.
    pub remove_query: String,
    /// Ids of the applications this one directly depends on.
    pub depends_on: Vec<Uuid>,
    /// Ordering hint among applications without an explicit dependency.
    pub creation_order: i64,
    /// When the application was recorded, if loaded from the database.
    pub applied_at: Option<DateTime<Utc>>,
}

impl ConceptApplication {
    /// Returns the application key.
    #[must_use]
    pub fn key(&self) -> ConceptApplicationKey {
        ConceptApplicationKey::new(&self.concept_info_key, &self.implementation_type_name)
    }
}

/// A concept application computed from the current concept model.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConceptApplication {
    /// Freshly generated id; replaced by the old id when the application is
    /// matched to an unchanged applied one.
    pub id: Uuid,
    /// The concept this application was generated from.
    pub concept: ConceptId,
    /// Type name of the concept.
    pub concept_info_type_name: String,
    /// Key of the concept.
    pub concept_info_key: String,
    /// Qualified implementation type name of the code generator.
    pub implementation_type_name: String,
    /// SQL that creates the database object.
    pub create_query: String,
    /// SQL that removes the database object.
    pub remove_query: String,
    /// Keys of the applications this one directly depends on.
    pub depends_on: Vec<ConceptApplicationKey>,
}

impl NewConceptApplication {
    /// Returns the application key.
    #[must_use]
    pub fn key(&self) -> ConceptApplicationKey {
        ConceptApplicationKey::new(&self.concept_info_key, &self.implementation_type_name)
    }

    /// Returns whether the applied object can be kept as is: same create
    /// script and same implementation.
    #[must_use]
    pub fn same_definition(&self, applied: &ConceptApplication) -> bool {
        self.create_query == applied.create_query
            && self.implementation_type_name == applied.implementation_type_name
    }
}
