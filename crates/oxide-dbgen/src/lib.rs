//! Incremental database schema generator.
//!
//! `oxide-dbgen` keeps a database schema in line with a declarative concept
//! model. Every run:
//! - builds one concept application (a create/remove SQL pair) per concept
//!   and code generator plugin
//! - loads the applications recorded by previous runs
//! - drops and recreates only what changed, together with everything that
//!   depends on it
//! - records the applied state in metadata tables for the next run
//!
//! # Architecture
//!
//! - **Concept model** - Concept types with explicit members, and concepts
//! - **Plugins** - Code generators registered per concept type
//! - **Model builder** - Builds the new concept applications and their dependencies
//! - **Repository** - Loads applied applications and produces metadata SQL
//! - **Diff** - Computes removals and insertions, propagated through dependencies
//! - **Batches** - Executes scripts in transaction batches
//! - **Generator** - Orchestrates one run under a database lock
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oxide_dbgen::prelude::*;
//!
//! let mut types = ConceptTypeRegistry::new();
//! types.register(ConceptType::new("EntityInfo").member(ConceptMember::value("Name").key()))?;
//! let mut model = ConceptModel::new(types);
//! model.add(ConceptInfo::new("EntityInfo", vec!["Invoice".into()]))?;
//!
//! let mut plugins = PluginRegistry::new();
//! plugins.register(
//!     "EntityInfo",
//!     SqlTemplateDefinition::new(
//!         "EntityTable",
//!         "CREATE TABLE {Name} (ID TEXT PRIMARY KEY)",
//!         "DROP TABLE {Name}",
//!     ),
//! );
//!
//! let dialect: Arc<dyn SqlDialect> = Arc::new(SqliteDialect::new());
//! let generator = DatabaseGenerator::new(
//!     SqliteExecutor::new(pool.clone()),
//!     SqliteConceptApplicationRepository::new(pool, Arc::clone(&dialect)),
//!     dialect,
//! );
//! let report = generator.update_database_structure(&model, &plugins).await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Create the metadata tables
//! oxide-dbgen init
//!
//! # Update the database to match a model file
//! oxide-dbgen generate --model model.json
//!
//! # Print the scripts without executing them
//! oxide-dbgen generate --model model.json --dry-run
//!
//! # List applied concept applications
//! oxide-dbgen show
//! ```

pub mod application;
pub mod batches;
pub mod code_builder;
pub mod concept;
pub mod dialect;
pub mod diff;
pub mod error;
pub mod generator;
pub mod graph;
pub mod model_builder;
pub mod model_dependencies;
pub mod model_file;
pub mod plugins;
pub mod repository;
pub mod sql_executor;
pub mod template;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::application::{ConceptApplication, ConceptApplicationKey, NewConceptApplication};
    pub use crate::batches::{
        BatchOptions, SqlBatch, SqlScript, SqlTransactionBatches, NO_TRANSACTION_TAG,
    };
    pub use crate::code_builder::CodeBuilder;
    pub use crate::concept::{
        ConceptId, ConceptInfo, ConceptMember, ConceptModel, ConceptType, ConceptTypeRegistry,
        MemberValue,
    };
    pub use crate::dialect::{SqlDialect, SqliteDialect};
    pub use crate::diff::MigrationPlan;
    pub use crate::error::{GeneratorError, Result};
    pub use crate::generator::{
        DatabaseGenerator, GenerationPlan, GenerationReport, GeneratorOptions,
    };
    pub use crate::model_builder::DatabaseModelBuilder;
    pub use crate::model_file::ModelFile;
    pub use crate::plugins::{ConceptDatabaseDefinition, ExtraDependency, PluginRegistry};
    pub use crate::repository::{ConceptApplicationRepository, SqliteConceptApplicationRepository};
    pub use crate::sql_executor::{SqlExecutor, SqlSession, SqliteExecutor};
    pub use crate::template::SqlTemplateDefinition;
}
