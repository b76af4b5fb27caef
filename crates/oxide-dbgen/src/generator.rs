//! Database structure generator.
//!
//! [`DatabaseGenerator`] brings the database in line with a concept model:
//! it builds the new concept applications, loads the applied ones, computes
//! the [`MigrationPlan`] and executes the resulting scripts. Metadata changes
//! are interleaved with the DDL of each application so that a failed run
//! leaves metadata that matches exactly what was committed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::application::NewConceptApplication;
use crate::batches::{BatchOptions, SqlScript, SqlTransactionBatches};
use crate::concept::ConceptModel;
use crate::dialect::SqlDialect;
use crate::diff::MigrationPlan;
use crate::error::Result;
use crate::model_builder::DatabaseModelBuilder;
use crate::plugins::PluginRegistry;
use crate::repository::ConceptApplicationRepository;
use crate::sql_executor::SqlExecutor;

/// Generator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOptions {
    /// Compute the scripts without executing them.
    pub dry_run: bool,
    /// Name of the database lock held while the database is updated.
    pub lock_name: String,
    /// Batch execution limits.
    pub batches: BatchOptions,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            lock_name: "oxide_dbgen".to_string(),
            batches: BatchOptions::default(),
        }
    }
}

/// Planned changes with the scripts that apply them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationPlan {
    /// Application-level changes.
    pub changes: MigrationPlan,
    /// Scripts in execution order, DDL interleaved with metadata.
    pub scripts: Vec<SqlScript>,
    /// Number of unchanged applications whose metadata is updated.
    pub updated: usize,
}

impl GenerationPlan {
    /// Returns a report of this plan after `executed_scripts` were run.
    #[must_use]
    pub fn report(&self, executed_scripts: usize) -> GenerationReport {
        GenerationReport {
            removed: self.changes.removed.len(),
            inserted: self.changes.inserted.len(),
            updated: self.updated,
            unchanged: self.changes.unchanged.len(),
            executed_scripts,
        }
    }
}

/// Summary of one generator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    /// Removed applications.
    pub removed: usize,
    /// Inserted applications.
    pub inserted: usize,
    /// Unchanged applications with updated metadata.
    pub updated: usize,
    /// Applications kept in the database.
    pub unchanged: usize,
    /// Executed scripts; zero in a dry run.
    pub executed_scripts: usize,
}

/// Updates the database structure to match a concept model.
pub struct DatabaseGenerator<E: SqlExecutor, R: ConceptApplicationRepository> {
    executor: E,
    repository: R,
    dialect: Arc<dyn SqlDialect>,
    options: GeneratorOptions,
}

impl<E: SqlExecutor, R: ConceptApplicationRepository> DatabaseGenerator<E, R> {
    /// Creates a new generator.
    pub fn new(executor: E, repository: R, dialect: Arc<dyn SqlDialect>) -> Self {
        Self {
            executor,
            repository,
            dialect,
            options: GeneratorOptions::default(),
        }
    }

    /// Sets the generator options.
    #[must_use]
    pub fn options(mut self, options: GeneratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Enables dry-run mode (scripts are planned but not executed).
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.options.dry_run = enabled;
        self
    }

    /// Returns the executor.
    #[must_use]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Returns the repository.
    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Computes the scripts that would update the database, without taking
    /// the lock or executing anything.
    pub async fn plan(
        &self,
        model: &ConceptModel,
        plugins: &PluginRegistry,
    ) -> Result<GenerationPlan> {
        let applications = DatabaseModelBuilder::new(plugins).build(model)?;
        self.plan_applications(&applications).await
    }

    /// Updates the database structure to match `model`.
    ///
    /// Holds the configured database lock from loading the applied metadata
    /// until the last batch is committed. In dry-run mode only plans.
    pub async fn update_database_structure(
        &self,
        model: &ConceptModel,
        plugins: &PluginRegistry,
    ) -> Result<GenerationReport> {
        let applications = DatabaseModelBuilder::new(plugins).build(model)?;

        if self.options.dry_run {
            let plan = self.plan_applications(&applications).await?;
            info!(
                scripts = plan.scripts.len(),
                removed = plan.changes.removed.len(),
                inserted = plan.changes.inserted.len(),
                "Dry run: no SQL executed"
            );
            return Ok(plan.report(0));
        }

        let lock_name = &self.options.lock_name;
        self.executor.acquire_lock(lock_name).await?;
        let result = self.apply(&applications).await;
        let released = self.executor.release_lock(lock_name).await;

        match (result, released) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                warn!(lock = %lock_name, error = %release_error, "Failed to release database lock");
                Err(e)
            }
        }
    }

    async fn apply(&self, applications: &[NewConceptApplication]) -> Result<GenerationReport> {
        self.repository.ensure_tables().await?;
        let plan = self.plan_applications(applications).await?;
        if plan.scripts.is_empty() {
            info!(
                unchanged = plan.changes.unchanged.len(),
                "Database structure is up to date"
            );
            return Ok(plan.report(0));
        }

        let batches = SqlTransactionBatches::new(
            &self.executor,
            self.dialect.as_ref(),
            &self.options.batches,
        );
        let executed = batches.execute(plan.scripts.clone()).await?;

        let report = plan.report(executed);
        info!(
            removed = report.removed,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            scripts = report.executed_scripts,
            "Database structure updated"
        );
        Ok(report)
    }

    async fn plan_applications(
        &self,
        applications: &[NewConceptApplication],
    ) -> Result<GenerationPlan> {
        let old = self.repository.load().await?;
        info!(applications = old.len(), "Loaded applied concept applications");

        let changes = MigrationPlan::compute(&old, applications)?;
        let (scripts, updated) = self.assemble(&changes);
        info!(
            removed = changes.removed.len(),
            inserted = changes.inserted.len(),
            unchanged = changes.unchanged.len(),
            scripts = scripts.len(),
            "Planned database changes"
        );
        Ok(GenerationPlan {
            changes,
            scripts,
            updated,
        })
    }

    /// Orders the scripts: each removal's DDL followed by its metadata
    /// delete, each insertion's DDL followed by its metadata insert, then
    /// metadata updates of unchanged applications.
    fn assemble(&self, changes: &MigrationPlan) -> (Vec<SqlScript>, usize) {
        let mut scripts = Vec::new();
        for application in &changes.removed {
            push_ddl(&mut scripts, &application.remove_query);
            scripts.extend(self.repository.delete_metadata_sql(application));
        }
        for application in &changes.inserted {
            push_ddl(&mut scripts, &application.create_query);
            scripts.extend(self.repository.insert_metadata_sql(application));
        }

        let mut updated = 0;
        for (application, old) in &changes.unchanged {
            let update = self.repository.update_metadata_sql(application, old);
            if !update.is_empty() {
                updated += 1;
                scripts.extend(update);
            }
        }
        (scripts, updated)
    }
}

fn push_ddl(scripts: &mut Vec<SqlScript>, sql: &str) {
    if !sql.trim().is_empty() {
        scripts.push(SqlScript::new(sql));
    }
}
