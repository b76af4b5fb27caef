//! Applied concept metadata.
//!
//! This module manages the `oxide_applied_concepts` and
//! `oxide_applied_concept_dependencies` tables that record which concept
//! applications exist in the database and how they depend on each other.
//! Metadata changes are returned as SQL scripts so that they run in the same
//! transaction batches as the DDL they describe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::application::ConceptApplication;
use crate::batches::SqlScript;
use crate::dialect::SqlDialect;
use crate::error::{GeneratorError, Result};

/// SQL to create the applied concepts table (SQLite).
pub const CREATE_APPLIED_CONCEPTS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS oxide_applied_concepts (
    id TEXT PRIMARY KEY,
    concept_info_type_name TEXT NOT NULL,
    concept_info_key TEXT NOT NULL,
    implementation_type_name TEXT NOT NULL,
    create_query TEXT NOT NULL,
    remove_query TEXT NOT NULL,
    creation_order INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)
"#;

/// SQL to create the applied concept dependencies table (SQLite).
pub const CREATE_DEPENDENCIES_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS oxide_applied_concept_dependencies (
    dependent_id TEXT NOT NULL,
    depends_on_id TEXT NOT NULL,
    PRIMARY KEY (dependent_id, depends_on_id)
)
"#;

/// Loads applied concept applications and produces their metadata SQL.
#[async_trait]
pub trait ConceptApplicationRepository: Send + Sync {
    /// Creates the metadata tables if they do not exist.
    async fn ensure_tables(&self) -> Result<()>;

    /// Loads every applied concept application with its dependencies.
    async fn load(&self) -> Result<Vec<ConceptApplication>>;

    /// Returns the SQL that records a newly created application.
    fn insert_metadata_sql(&self, application: &ConceptApplication) -> Vec<SqlScript>;

    /// Returns the SQL that updates an unchanged application's auxiliary
    /// fields, or nothing if they are equal.
    fn update_metadata_sql(
        &self,
        application: &ConceptApplication,
        old: &ConceptApplication,
    ) -> Vec<SqlScript>;

    /// Returns the SQL that forgets a removed application.
    fn delete_metadata_sql(&self, application: &ConceptApplication) -> Vec<SqlScript>;
}

/// Rebuilds the dependency lists of loaded applications from their edges.
///
/// `edges` are `(dependent_id, depends_on_id)` pairs. Fails on two
/// applications with the same key and on edges that reference an unknown id.
pub fn reconstruct(
    mut applications: Vec<ConceptApplication>,
    edges: &[(Uuid, Uuid)],
) -> Result<Vec<ConceptApplication>> {
    let mut by_key = HashMap::new();
    let mut by_id = HashMap::new();
    for (index, application) in applications.iter().enumerate() {
        if let Some(first) = by_key.insert(application.key(), index) {
            return Err(GeneratorError::DuplicateApplication {
                key: application.key().to_string(),
                first_id: applications[first].id,
                second_id: application.id,
            });
        }
        by_id.insert(application.id, index);
    }

    let mut seen = HashSet::new();
    for &(dependent_id, depends_on_id) in edges {
        let dependent = by_id
            .get(&dependent_id)
            .filter(|_| by_id.contains_key(&depends_on_id));
        let Some(&dependent) = dependent else {
            return Err(GeneratorError::DanglingDependency {
                dependent_id,
                depends_on_id,
            });
        };
        if seen.insert((dependent_id, depends_on_id)) {
            applications[dependent].depends_on.push(depends_on_id);
        }
    }
    Ok(applications)
}

fn parse_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        GeneratorError::InvalidState(format!("Invalid concept application id '{value}': {e}"))
    })
}

fn parse_applied_at(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite datetime format fallback
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .ok()
}

type AppliedConceptRow = (String, String, String, String, String, String, i64, String);

/// [`ConceptApplicationRepository`] stored in SQLite.
pub struct SqliteConceptApplicationRepository {
    pool: SqlitePool,
    dialect: Arc<dyn SqlDialect>,
}

impl SqliteConceptApplicationRepository {
    /// Creates a new repository.
    pub fn new(pool: SqlitePool, dialect: Arc<dyn SqlDialect>) -> Self {
        Self { pool, dialect }
    }

    async fn tables_exist(&self) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('oxide_applied_concepts', 'oxide_applied_concept_dependencies')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 == 2)
    }

    fn text(&self, value: &str) -> String {
        self.dialect.quote_text(value)
    }
}

#[async_trait]
impl ConceptApplicationRepository for SqliteConceptApplicationRepository {
    async fn ensure_tables(&self) -> Result<()> {
        sqlx::query(CREATE_APPLIED_CONCEPTS_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_DEPENDENCIES_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<ConceptApplication>> {
        if !self.tables_exist().await? {
            debug!("Metadata tables do not exist yet");
            return Ok(Vec::new());
        }

        let rows: Vec<AppliedConceptRow> = sqlx::query_as(
            "SELECT id, concept_info_type_name, concept_info_key, implementation_type_name, create_query, remove_query, creation_order, applied_at FROM oxide_applied_concepts ORDER BY creation_order, id",
        )
        .fetch_all(&self.pool)
        .await?;
        let edge_rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT dependent_id, depends_on_id FROM oxide_applied_concept_dependencies ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut applications = Vec::with_capacity(rows.len());
        for (id, type_name, key, implementation, create_query, remove_query, order, applied_at) in
            rows
        {
            applications.push(ConceptApplication {
                id: parse_id(&id)?,
                concept_info_type_name: type_name,
                concept_info_key: key,
                implementation_type_name: implementation,
                create_query,
                remove_query,
                depends_on: Vec::new(),
                creation_order: order,
                applied_at: parse_applied_at(&applied_at),
            });
        }

        let mut edges = Vec::with_capacity(edge_rows.len());
        for (dependent, depends_on) in edge_rows {
            edges.push((parse_id(&dependent)?, parse_id(&depends_on)?));
        }

        let applications = reconstruct(applications, &edges)?;
        debug!(
            applications = applications.len(),
            dependencies = edges.len(),
            "Loaded applied concepts"
        );
        Ok(applications)
    }

    fn insert_metadata_sql(&self, application: &ConceptApplication) -> Vec<SqlScript> {
        let id = self.text(&application.id.to_string());
        let mut scripts = vec![SqlScript::new(format!(
            "INSERT INTO oxide_applied_concepts (id, concept_info_type_name, concept_info_key, implementation_type_name, create_query, remove_query, creation_order) VALUES ({id}, {}, {}, {}, {}, {}, {})",
            self.text(&application.concept_info_type_name),
            self.text(&application.concept_info_key),
            self.text(&application.implementation_type_name),
            self.text(&application.create_query),
            self.text(&application.remove_query),
            application.creation_order,
        ))
        .with_expected_rows(1)];

        for depends_on in &application.depends_on {
            scripts.push(
                SqlScript::new(format!(
                    "INSERT INTO oxide_applied_concept_dependencies (dependent_id, depends_on_id) VALUES ({id}, {})",
                    self.text(&depends_on.to_string())
                ))
                .with_expected_rows(1),
            );
        }
        scripts
    }

    fn update_metadata_sql(
        &self,
        application: &ConceptApplication,
        old: &ConceptApplication,
    ) -> Vec<SqlScript> {
        if application.remove_query == old.remove_query
            && application.concept_info_type_name == old.concept_info_type_name
        {
            return Vec::new();
        }

        vec![SqlScript::new(format!(
            "UPDATE oxide_applied_concepts SET concept_info_type_name = {}, remove_query = {} WHERE id = {}",
            self.text(&application.concept_info_type_name),
            self.text(&application.remove_query),
            self.text(&old.id.to_string()),
        ))
        .with_expected_rows(1)]
    }

    fn delete_metadata_sql(&self, application: &ConceptApplication) -> Vec<SqlScript> {
        let id = self.text(&application.id.to_string());
        vec![
            SqlScript::new(format!(
                "DELETE FROM oxide_applied_concept_dependencies WHERE dependent_id = {id}"
            )),
            SqlScript::new(format!("DELETE FROM oxide_applied_concepts WHERE id = {id}"))
                .with_expected_rows(1),
        ]
    }
}
