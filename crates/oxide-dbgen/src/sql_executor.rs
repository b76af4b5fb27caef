//! SQL execution primitives.
//!
//! The generator talks to the database only through [`SqlExecutor`]: it opens
//! one dedicated session per batch, runs scripts in it, checks the session's
//! transaction state, and commits. Named locks serialize concurrent
//! deployments against the same database.
//!
//! For a database file, a named lock is an exclusive transaction held open on
//! a dedicated connection to a sidecar lock file next to it. The operating
//! system drops that file lock together with the connection or the process,
//! so a crashed deployment never leaves a stale lock behind. An in-memory
//! database only lives as long as its process, so its locks are rows in a
//! table of that database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection, SqlitePool};
use sqlx::{ConnectOptions, Connection, Executor, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{GeneratorError, Result};

/// SQL to create the named locks table of in-memory databases (SQLite).
pub const CREATE_LOCKS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS oxide_dbgen_locks (
    name TEXT PRIMARY KEY,
    acquired_at TEXT NOT NULL DEFAULT (datetime('now'))
)
"#;

/// How long a lock request waits for a holder that is just closing.
const LOCK_BUSY_TIMEOUT: Duration = Duration::from_millis(200);

/// One dedicated database connection, optionally inside a transaction.
///
/// Dropping a session without calling [`SqlSession::commit`] rolls back its
/// transaction.
#[async_trait]
pub trait SqlSession: Send {
    /// Executes a script and returns the number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Returns whether the connection is currently inside a transaction.
    async fn in_transaction(&mut self) -> Result<bool>;

    /// Commits the session's transaction, if any.
    async fn commit(self) -> Result<()>;
}

/// Opens sessions and manages named locks on the target database.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Session type produced by this executor.
    type Session: SqlSession;

    /// Opens a session on a dedicated connection, starting a transaction if
    /// `use_transaction` is set.
    async fn open_session(&self, use_transaction: bool) -> Result<Self::Session>;

    /// Acquires a named lock, failing with [`GeneratorError::LockUnavailable`]
    /// if another process holds it.
    async fn acquire_lock(&self, name: &str) -> Result<()>;

    /// Releases a named lock.
    async fn release_lock(&self, name: &str) -> Result<()>;
}

/// A named lock held by this process.
enum HeldLock {
    /// Open exclusive transaction on the sidecar lock file.
    File(SqliteConnection),
    /// Row in `oxide_dbgen_locks` of an in-memory database.
    Row,
}

/// [`SqlExecutor`] over a SQLite connection pool.
///
/// Clones share the pool and the locks held through them.
#[derive(Clone)]
pub struct SqliteExecutor {
    pool: SqlitePool,
    held_locks: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl SqliteExecutor {
    /// Creates a new SQLite executor.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            held_locks: Arc::default(),
        }
    }

    /// Returns the connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the file of the main database, or `None` when it is in memory.
    async fn database_file(&self) -> Result<Option<PathBuf>> {
        let (file,): (String,) =
            sqlx::query_as("SELECT file FROM pragma_database_list WHERE name = 'main'")
                .fetch_one(&self.pool)
                .await?;
        Ok((!file.is_empty()).then(|| PathBuf::from(file)))
    }

    async fn lock_row(&self, name: &str) -> Result<()> {
        sqlx::query(CREATE_LOCKS_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("INSERT OR IGNORE INTO oxide_dbgen_locks (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GeneratorError::LockUnavailable(name.to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SqliteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteExecutor")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Returns the sidecar lock file of `name` for the database at `database`.
#[must_use]
pub fn lock_file_path(database: &Path, name: &str) -> PathBuf {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut file = database.as_os_str().to_owned();
    file.push(format!(".{name}.lock"));
    PathBuf::from(file)
}

/// Opens the lock file and holds an exclusive transaction on it.
async fn lock_file(path: &Path, name: &str) -> Result<SqliteConnection> {
    let busy = |e: sqlx::Error| {
        if is_busy(&e) {
            GeneratorError::LockUnavailable(name.to_string())
        } else {
            e.into()
        }
    };

    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(LOCK_BUSY_TIMEOUT)
        .connect()
        .await
        .map_err(busy)?;
    conn.execute(sqlx::raw_sql("BEGIN EXCLUSIVE"))
        .await
        .map_err(busy)?;
    Ok(conn)
}

fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(e) => {
            e.code().is_some_and(|code| code == "5") || e.message().contains("locked")
        }
        _ => false,
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    type Session = SqliteSession;

    async fn open_session(&self, use_transaction: bool) -> Result<SqliteSession> {
        if use_transaction {
            Ok(SqliteSession::Transaction(self.pool.begin().await?))
        } else {
            Ok(SqliteSession::Autocommit(self.pool.acquire().await?))
        }
    }

    async fn acquire_lock(&self, name: &str) -> Result<()> {
        let mut held = self.held_locks.lock().await;
        if held.contains_key(name) {
            return Err(GeneratorError::LockUnavailable(name.to_string()));
        }

        let lock = match self.database_file().await? {
            Some(database) => {
                let path = lock_file_path(&database, name);
                let conn = lock_file(&path, name).await?;
                debug!(lock = %name, file = %path.display(), "Acquired database lock");
                HeldLock::File(conn)
            }
            None => {
                self.lock_row(name).await?;
                debug!(lock = %name, "Acquired in-memory database lock");
                HeldLock::Row
            }
        };
        held.insert(name.to_string(), lock);
        Ok(())
    }

    async fn release_lock(&self, name: &str) -> Result<()> {
        let lock = self.held_locks.lock().await.remove(name);
        match lock {
            Some(HeldLock::File(mut conn)) => {
                conn.execute(sqlx::raw_sql("ROLLBACK")).await?;
                conn.close().await?;
            }
            Some(HeldLock::Row) => {
                sqlx::query("DELETE FROM oxide_dbgen_locks WHERE name = ?")
                    .bind(name)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                warn!(lock = %name, "Released a database lock that was not held");
                return Ok(());
            }
        }
        debug!(lock = %name, "Released database lock");
        Ok(())
    }
}

/// A dedicated SQLite connection, optionally inside a transaction.
pub enum SqliteSession {
    /// Connection inside a transaction; rolled back when dropped.
    Transaction(Transaction<'static, Sqlite>),
    /// Connection in autocommit mode.
    Autocommit(PoolConnection<Sqlite>),
}

impl SqliteSession {
    fn connection(&mut self) -> &mut SqliteConnection {
        match self {
            Self::Transaction(tx) => &mut **tx,
            Self::Autocommit(conn) => &mut **conn,
        }
    }
}

#[async_trait]
impl SqlSession for SqliteSession {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = self.connection().execute(sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }

    async fn in_transaction(&mut self) -> Result<bool> {
        // SQLite refuses to BEGIN inside an open transaction.
        let conn = self.connection();
        match conn.execute(sqlx::raw_sql("BEGIN")).await {
            Ok(_) => {
                conn.execute(sqlx::raw_sql("ROLLBACK")).await?;
                Ok(false)
            }
            Err(sqlx::Error::Database(e)) if e.message().contains("within a transaction") => {
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(self) -> Result<()> {
        match self {
            Self::Transaction(tx) => tx.commit().await?,
            Self::Autocommit(_) => {}
        }
        Ok(())
    }
}
