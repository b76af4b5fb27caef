//! Ordered execution of SQL scripts in transaction batches.
//!
//! Consecutive transactional scripts run in one transaction on a dedicated
//! session, committed before the next batch starts. A script starting with
//! [`NO_TRANSACTION_TAG`] runs alone in autocommit mode. Each batch boundary
//! is a durability checkpoint: a failing batch rolls back, earlier batches
//! stay committed.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::dialect::SqlDialect;
use crate::error::{GeneratorError, Result};
use crate::sql_executor::{SqlExecutor, SqlSession};

/// Marks a script that must run outside of a transaction.
pub const NO_TRANSACTION_TAG: &str = "/*oxide-dbgen:no-transaction*/";

/// One SQL script to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlScript {
    /// SQL text.
    pub sql: String,
    /// Number of rows the script must affect, if checked.
    pub expected_rows: Option<u64>,
}

impl SqlScript {
    /// Creates a script without a row count check.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            expected_rows: None,
        }
    }

    /// Sets the number of rows the script must affect.
    #[must_use]
    pub fn with_expected_rows(mut self, rows: u64) -> Self {
        self.expected_rows = Some(rows);
        self
    }

    /// Returns whether the script may run inside a transaction.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        !self.sql.trim_start().starts_with(NO_TRANSACTION_TAG)
    }
}

impl From<String> for SqlScript {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

impl From<&str> for SqlScript {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

/// Consecutive scripts that share the same transaction mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlBatch {
    /// Whether the batch runs in a transaction.
    pub use_transaction: bool,
    /// Scripts in execution order.
    pub scripts: Vec<SqlScript>,
}

/// Limits for batch execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Maximum number of scripts joined into one round-trip.
    pub max_joined_script_count: usize,
    /// Maximum size in bytes of a joined script.
    pub max_joined_script_size: usize,
    /// Seconds between progress reports.
    pub progress_interval_secs: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_joined_script_count: 100,
            max_joined_script_size: 1_000_000,
            progress_interval_secs: 10,
        }
    }
}

/// A joined script and the range of source scripts it covers.
#[derive(Debug)]
struct JoinedScript {
    first_index: usize,
    count: usize,
    script: SqlScript,
}

/// Periodic progress logging, both between scripts and while a single
/// long-running script is executing.
struct Progress {
    started: Instant,
    last_report: Instant,
    interval: Duration,
    total: usize,
    done: usize,
    reports: usize,
}

impl Progress {
    fn new(total: usize, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_report: now,
            interval,
            total,
            done: 0,
            reports: 0,
        }
    }

    fn advance(&mut self, count: usize) {
        self.done += count;
        if self.last_report.elapsed() >= self.interval {
            self.mark_reported();
            info!(
                done = self.done,
                total = self.total,
                elapsed_secs = self.started.elapsed().as_secs(),
                "Executing SQL scripts"
            );
        }
    }

    fn report_running(&mut self, script_index: usize) {
        self.mark_reported();
        info!(
            done = self.done,
            total = self.total,
            script_index,
            elapsed_secs = self.started.elapsed().as_secs(),
            "Still executing SQL script"
        );
    }

    fn mark_reported(&mut self) {
        self.last_report = Instant::now();
        self.reports += 1;
    }

    fn next_report(&self) -> tokio::time::Instant {
        tokio::time::Instant::from_std(self.last_report + self.interval)
    }
}

/// Executes SQL scripts in transaction batches.
pub struct SqlTransactionBatches<'a, E: SqlExecutor> {
    executor: &'a E,
    dialect: &'a dyn SqlDialect,
    options: &'a BatchOptions,
}

impl<'a, E: SqlExecutor> SqlTransactionBatches<'a, E> {
    /// Creates a batch executor.
    pub fn new(executor: &'a E, dialect: &'a dyn SqlDialect, options: &'a BatchOptions) -> Self {
        Self {
            executor,
            dialect,
            options,
        }
    }

    /// Groups consecutive scripts by transaction mode. Blank scripts are
    /// dropped.
    #[must_use]
    pub fn split(scripts: Vec<SqlScript>) -> Vec<SqlBatch> {
        let mut batches: Vec<SqlBatch> = Vec::new();
        for script in scripts {
            if script.sql.trim().is_empty() {
                continue;
            }
            let use_transaction = script.is_transactional();
            match batches.last_mut() {
                Some(batch) if batch.use_transaction == use_transaction => {
                    batch.scripts.push(script);
                }
                _ => batches.push(SqlBatch {
                    use_transaction,
                    scripts: vec![script],
                }),
            }
        }
        batches
    }

    /// Joins consecutive scripts into fewer round-trips.
    ///
    /// Only transactional scripts without a row count check are joined, up to
    /// the configured count and size limits.
    #[must_use]
    pub fn join_scripts(&self, scripts: &[SqlScript]) -> Vec<SqlScript> {
        self.join_indexed(scripts, 0)
            .into_iter()
            .map(|joined| joined.script)
            .collect()
    }

    fn join_indexed(&self, scripts: &[SqlScript], offset: usize) -> Vec<JoinedScript> {
        let joinable = |script: &SqlScript| {
            script.is_transactional()
                && script.expected_rows.is_none()
                && script.sql.len() < self.options.max_joined_script_size
        };

        let mut result = Vec::new();
        let mut index = 0;
        while index < scripts.len() {
            let start = index;
            let mut size = scripts[start].sql.len();
            index += 1;
            if joinable(&scripts[start]) {
                while index < scripts.len()
                    && index - start < self.options.max_joined_script_count
                    && joinable(&scripts[index])
                    && size + scripts[index].sql.len() <= self.options.max_joined_script_size
                {
                    size += scripts[index].sql.len();
                    index += 1;
                }
            }

            let group = &scripts[start..index];
            let script = if group.len() == 1 {
                group[0].clone()
            } else {
                let parts: Vec<&str> = group.iter().map(|s| s.sql.as_str()).collect();
                SqlScript::new(self.dialect.join_scripts(&parts))
            };
            result.push(JoinedScript {
                first_index: offset + start,
                count: group.len(),
                script,
            });
        }
        result
    }

    /// Executes `scripts` in order and returns the number of executed
    /// scripts.
    pub async fn execute(&self, scripts: Vec<SqlScript>) -> Result<usize> {
        let batches = Self::split(scripts);
        let total: usize = batches.iter().map(|b| b.scripts.len()).sum();
        if total == 0 {
            debug!("No SQL scripts to execute");
            return Ok(0);
        }

        info!(
            scripts = total,
            batches = batches.len(),
            "Executing SQL scripts"
        );
        let mut progress = Progress::new(
            total,
            Duration::from_secs(self.options.progress_interval_secs),
        );
        let mut committed = 0;
        for batch in &batches {
            let result = if batch.use_transaction {
                self.execute_transaction(batch, committed, &mut progress)
                    .await
            } else {
                self.execute_without_transaction(batch, &mut committed, &mut progress)
                    .await
            };
            if let Err(e) = result {
                error!(
                    committed_scripts = committed,
                    total_scripts = total,
                    error = %e,
                    "SQL execution failed; committed scripts remain applied"
                );
                return Err(e);
            }
            if batch.use_transaction {
                committed += batch.scripts.len();
            }
        }

        info!(scripts = total, "SQL scripts executed");
        Ok(total)
    }

    async fn execute_transaction(
        &self,
        batch: &SqlBatch,
        committed: usize,
        progress: &mut Progress,
    ) -> Result<()> {
        let last_index = committed + batch.scripts.len() - 1;
        debug!(
            scripts = batch.scripts.len(),
            first_index = committed,
            "Starting transaction batch"
        );

        let mut session = self.executor.open_session(true).await?;
        verify_state(&mut session, true, committed, committed).await?;
        for joined in self.join_indexed(&batch.scripts, committed) {
            run_script(&mut session, &joined, committed, progress).await?;
            progress.advance(joined.count);
        }
        verify_state(&mut session, true, last_index, committed).await?;
        session.commit().await?;

        debug!(last_index, "Committed transaction batch");
        Ok(())
    }

    async fn execute_without_transaction(
        &self,
        batch: &SqlBatch,
        committed: &mut usize,
        progress: &mut Progress,
    ) -> Result<()> {
        for script in &batch.scripts {
            let joined = JoinedScript {
                first_index: *committed,
                count: 1,
                script: script.clone(),
            };
            debug!(script_index = joined.first_index, "Executing script without transaction");

            let mut session = self.executor.open_session(false).await?;
            verify_state(&mut session, false, joined.first_index, *committed).await?;
            run_script(&mut session, &joined, *committed, progress).await?;
            verify_state(&mut session, false, joined.first_index, *committed).await?;
            session.commit().await?;

            *committed += 1;
            progress.advance(1);
        }
        Ok(())
    }
}

async fn run_script<S: SqlSession>(
    session: &mut S,
    joined: &JoinedScript,
    committed: usize,
    progress: &mut Progress,
) -> Result<()> {
    debug!(script_index = joined.first_index, sql = %joined.script.sql, "Executing SQL");
    let execution = session.execute(&joined.script.sql);
    tokio::pin!(execution);
    let result = if progress.interval.is_zero() {
        execution.await
    } else {
        loop {
            tokio::select! {
                biased;
                result = &mut execution => break result,
                () = tokio::time::sleep_until(progress.next_report()) => {
                    progress.report_running(joined.first_index);
                }
            }
        }
    };
    let rows = result.map_err(|e| GeneratorError::ScriptFailed {
        script_index: joined.first_index,
        script: joined.script.sql.clone(),
        committed_scripts: committed,
        source: Box::new(e),
    })?;

    if let Some(expected) = joined.script.expected_rows {
        if rows != expected {
            return Err(GeneratorError::RowCountMismatch {
                script_index: joined.first_index,
                script: joined.script.sql.clone(),
                committed_scripts: committed,
                expected,
                actual: rows,
            });
        }
    }
    Ok(())
}

async fn verify_state<S: SqlSession>(
    session: &mut S,
    expected: bool,
    script_index: usize,
    committed: usize,
) -> Result<()> {
    let actual = session.in_transaction().await?;
    if actual != expected {
        return Err(GeneratorError::TransactionStateMismatch {
            expected,
            actual,
            script_index,
            committed_scripts: committed,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Records every statement; scripts containing `FAIL` fail and a script
    /// equal to `COMMIT` ends the transaction.
    #[derive(Default)]
    struct RecordingExecutor {
        log: Arc<Mutex<Vec<String>>>,
        rows: u64,
    }

    struct RecordingSession {
        log: Arc<Mutex<Vec<String>>>,
        in_transaction: bool,
        rows: u64,
    }

    #[async_trait]
    impl SqlSession for RecordingSession {
        async fn execute(&mut self, sql: &str) -> Result<u64> {
            if sql.contains("FAIL") {
                return Err(GeneratorError::InvalidState("script failed".into()));
            }
            if sql == "COMMIT" {
                self.in_transaction = false;
            }
            self.log.lock().unwrap().push(sql.to_string());
            Ok(self.rows)
        }

        async fn in_transaction(&mut self) -> Result<bool> {
            Ok(self.in_transaction)
        }

        async fn commit(self) -> Result<()> {
            if self.in_transaction {
                self.log.lock().unwrap().push("<commit>".into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SqlExecutor for RecordingExecutor {
        type Session = RecordingSession;

        async fn open_session(&self, use_transaction: bool) -> Result<RecordingSession> {
            let marker = if use_transaction { "<tran>" } else { "<notran>" };
            self.log.lock().unwrap().push(marker.into());
            Ok(RecordingSession {
                log: Arc::clone(&self.log),
                in_transaction: use_transaction,
                rows: self.rows,
            })
        }

        async fn acquire_lock(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn release_lock(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn no_tran(sql: &str) -> SqlScript {
        SqlScript::new(format!("{NO_TRANSACTION_TAG}{sql}"))
    }

    fn no_joins() -> BatchOptions {
        BatchOptions {
            max_joined_script_count: 1,
            ..BatchOptions::default()
        }
    }

    #[test]
    fn test_transaction_tag() {
        assert!(SqlScript::new("CREATE TABLE a (x INTEGER)").is_transactional());
        assert!(!no_tran("CREATE INDEX i ON a (x)").is_transactional());
        assert!(!SqlScript::new(format!("  \n{NO_TRANSACTION_TAG}x")).is_transactional());
        assert!(SqlScript::new(format!("x {NO_TRANSACTION_TAG}")).is_transactional());
    }

    #[test]
    fn test_split_by_transaction_mode() {
        let batches = SqlTransactionBatches::<RecordingExecutor>::split(vec![
            "a".into(),
            "b".into(),
            "  ".into(),
            no_tran("c"),
            no_tran("d"),
            "e".into(),
        ]);

        let modes: Vec<(bool, usize)> = batches
            .iter()
            .map(|b| (b.use_transaction, b.scripts.len()))
            .collect();
        assert_eq!(modes, vec![(true, 2), (false, 2), (true, 1)]);
    }

    #[test]
    fn test_join_scripts_respects_limits() {
        let executor = RecordingExecutor::default();
        let dialect = SqliteDialect::new();
        let options = BatchOptions {
            max_joined_script_count: 2,
            max_joined_script_size: 1000,
            progress_interval_secs: 10,
        };
        let batches = SqlTransactionBatches::new(&executor, &dialect, &options);

        let joined = batches.join_scripts(&[
            "INSERT INTO a VALUES (1)".into(),
            "INSERT INTO a VALUES (2)".into(),
            "INSERT INTO a VALUES (3)".into(),
            SqlScript::new("UPDATE b SET x = 1").with_expected_rows(1),
            no_tran("CREATE INDEX i ON a (x)"),
            "INSERT INTO a VALUES (4)".into(),
        ]);

        let sql: Vec<&str> = joined.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "INSERT INTO a VALUES (1);\nINSERT INTO a VALUES (2);",
                "INSERT INTO a VALUES (3)",
                "UPDATE b SET x = 1",
                "/*oxide-dbgen:no-transaction*/CREATE INDEX i ON a (x)",
                "INSERT INTO a VALUES (4)",
            ]
        );
        assert_eq!(joined[2].expected_rows, Some(1));
    }

    #[test]
    fn test_join_scripts_respects_size() {
        let executor = RecordingExecutor::default();
        let dialect = SqliteDialect::new();
        let options = BatchOptions {
            max_joined_script_count: 100,
            max_joined_script_size: 10,
            progress_interval_secs: 10,
        };
        let batches = SqlTransactionBatches::new(&executor, &dialect, &options);

        let joined = batches.join_scripts(&["aaaa".into(), "bbbb".into(), "cccc".into()]);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0].sql, "aaaa;\nbbbb;");
        assert_eq!(joined[1].sql, "cccc");
    }

    #[tokio::test]
    async fn test_execute_alternates_transaction_modes() {
        let executor = RecordingExecutor::default();
        let dialect = SqliteDialect::new();
        let options = no_joins();
        let batches = SqlTransactionBatches::new(&executor, &dialect, &options);

        let executed = batches
            .execute(vec!["a".into(), no_tran("b"), no_tran("c"), "d".into()])
            .await
            .unwrap();

        assert_eq!(executed, 4);
        let log = executor.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "<tran>",
                "a",
                "<commit>",
                "<notran>",
                "/*oxide-dbgen:no-transaction*/b",
                "<notran>",
                "/*oxide-dbgen:no-transaction*/c",
                "<tran>",
                "d",
                "<commit>",
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_empty() {
        let executor = RecordingExecutor::default();
        let dialect = SqliteDialect::new();
        let options = BatchOptions::default();
        let batches = SqlTransactionBatches::new(&executor, &dialect, &options);

        assert_eq!(batches.execute(Vec::new()).await.unwrap(), 0);
        assert!(executor.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_reports_committed_scripts() {
        let executor = RecordingExecutor::default();
        let dialect = SqliteDialect::new();
        let options = no_joins();
        let batches = SqlTransactionBatches::new(&executor, &dialect, &options);

        let result = batches
            .execute(vec!["a".into(), no_tran("b"), "c".into(), "FAIL".into()])
            .await;

        match result {
            Err(GeneratorError::ScriptFailed {
                script_index,
                script,
                committed_scripts,
                ..
            }) => {
                assert_eq!(script_index, 3);
                assert_eq!(script, "FAIL");
                assert_eq!(committed_scripts, 2);
            }
            other => panic!("Expected ScriptFailed, got {other:?}"),
        }
        // The failing batch was never committed.
        let log = executor.log.lock().unwrap().clone();
        assert_eq!(log.last().map(String::as_str), Some("c"));
    }

    #[tokio::test]
    async fn test_row_count_mismatch() {
        let executor = RecordingExecutor::default();
        let dialect = SqliteDialect::new();
        let options = BatchOptions::default();
        let batches = SqlTransactionBatches::new(&executor, &dialect, &options);

        let result = batches
            .execute(vec![
                "a".into(),
                no_tran("b"),
                SqlScript::new("UPDATE a SET x = 1").with_expected_rows(1),
            ])
            .await;

        assert!(matches!(
            result,
            Err(GeneratorError::RowCountMismatch {
                script_index: 2,
                committed_scripts: 2,
                expected: 1,
                actual: 0,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_detects_unexpected_commit() {
        let executor = RecordingExecutor {
            rows: 1,
            ..RecordingExecutor::default()
        };
        let dialect = SqliteDialect::new();
        let options = no_joins();
        let batches = SqlTransactionBatches::new(&executor, &dialect, &options);

        let result = batches
            .execute(vec!["a".into(), "COMMIT".into(), "b".into()])
            .await;

        assert!(matches!(
            result,
            Err(GeneratorError::TransactionStateMismatch {
                expected: true,
                actual: false,
                script_index: 2,
                committed_scripts: 0,
            })
        ));
    }

    /// Session whose scripts take a fixed time to run.
    struct SlowSession {
        delay: Duration,
    }

    #[async_trait]
    impl SqlSession for SlowSession {
        async fn execute(&mut self, _sql: &str) -> Result<u64> {
            tokio::time::sleep(self.delay).await;
            Ok(1)
        }

        async fn in_transaction(&mut self) -> Result<bool> {
            Ok(true)
        }

        async fn commit(self) -> Result<()> {
            Ok(())
        }
    }

    fn joined(sql: &str) -> JoinedScript {
        JoinedScript {
            first_index: 0,
            count: 1,
            script: SqlScript::new(sql),
        }
    }

    #[tokio::test]
    async fn test_progress_reported_during_long_script() {
        let mut session = SlowSession {
            delay: Duration::from_millis(120),
        };
        let mut progress = Progress::new(1, Duration::from_millis(20));

        run_script(&mut session, &joined("slow"), 0, &mut progress)
            .await
            .unwrap();

        assert!(progress.reports >= 2, "only {} reports", progress.reports);
    }

    #[tokio::test]
    async fn test_no_progress_for_fast_script() {
        let mut session = SlowSession {
            delay: Duration::ZERO,
        };
        let mut progress = Progress::new(2, Duration::from_secs(60));

        run_script(&mut session, &joined("fast"), 0, &mut progress)
            .await
            .unwrap();
        progress.advance(1);

        assert_eq!(progress.reports, 0);
        assert_eq!(progress.done, 1);
    }

    #[test]
    fn test_progress_reported_between_scripts() {
        let mut progress = Progress::new(3, Duration::ZERO);
        progress.advance(1);
        progress.advance(2);
        assert_eq!(progress.reports, 2);
        assert_eq!(progress.done, 3);
    }
}
