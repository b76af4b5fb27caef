//! SQLite dialect.

use super::SqlDialect;

/// SQLite dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn join_scripts(&self, scripts: &[&str]) -> String {
        scripts
            .iter()
            .map(|s| s.trim().trim_end_matches(';').trim_end())
            .filter(|s| !s.is_empty())
            .map(|s| format!("{s};"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
