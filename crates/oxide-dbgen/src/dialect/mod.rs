//! Database dialect strategies.
//!
//! The dialect knows how to quote values and identifiers and how to join
//! several scripts into one round-trip for a specific database system. It is
//! passed explicitly to the components that produce or combine SQL text.

mod sqlite;

pub use sqlite::SqliteDialect;

/// Trait for database-specific SQL text handling.
pub trait SqlDialect: Send + Sync + std::fmt::Debug {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Quotes a text literal.
    fn quote_text(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Quotes an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Combines several scripts into one that runs them in order.
    fn join_scripts(&self, scripts: &[&str]) -> String;
}
