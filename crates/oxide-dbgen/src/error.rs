//! Error types for the database generator.

use std::path::PathBuf;

use uuid::Uuid;

/// Errors that can occur while planning or applying database structure changes.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    /// Two concept applications share the same concept key and implementation.
    #[error("Duplicate concept application '{key}' (ids {first_id} and {second_id})")]
    DuplicateApplication {
        /// The duplicated concept application key.
        key: String,
        /// Id of the first application with this key.
        first_id: Uuid,
        /// Id of the second application with this key.
        second_id: Uuid,
    },

    /// A stored dependency references an application that was not loaded.
    #[error(
        "Applied concept {dependent_id} depends on {depends_on_id} which does not exist in the metadata"
    )]
    DanglingDependency {
        /// The application with the dependency.
        dependent_id: Uuid,
        /// The missing application.
        depends_on_id: Uuid,
    },

    /// The dependency graph contains a cycle.
    #[error("Circular dependency detected: {}", .nodes.join(" -> "))]
    CircularDependency {
        /// Every node on the detected cycle, in dependency order.
        nodes: Vec<String>,
    },

    /// Generated code contains text before the first application marker.
    #[error("Generated code contains text before the first application marker: '{text}'")]
    TextBeforeFirstMarker {
        /// The leading text (truncated).
        text: String,
    },

    /// An application marker appears more than once in the generated code.
    #[error("Application marker for '{application}' appears more than once in the generated code")]
    DuplicateMarker {
        /// The application whose marker is repeated.
        application: String,
    },

    /// An application marker is out of order or malformed.
    #[error("Misplaced application marker in the generated code: {0}")]
    MisplacedMarker(String),

    /// An application marker is missing from the generated code.
    #[error("Application marker for '{application}' is missing from the generated code")]
    MissingMarker {
        /// The application without a marker.
        application: String,
    },

    /// The concept model is inconsistent.
    #[error("Invalid concept model: {0}")]
    InvalidModel(String),

    /// A concept uses a type that was never registered.
    #[error("Unknown concept type '{0}'")]
    UnknownConceptType(String),

    /// A plugin failed to generate its SQL.
    #[error("Code generator '{implementation}' failed for '{concept}': {message}")]
    CodeGeneration {
        /// Implementation type name of the plugin.
        implementation: String,
        /// Key of the concept being generated.
        concept: String,
        /// Error message.
        message: String,
    },

    /// A SQL script failed during execution.
    #[error(
        "SQL script {script_index} failed after {committed_scripts} script(s) were committed: {source}\n{script}"
    )]
    ScriptFailed {
        /// Index of the failed script in the executed script list.
        script_index: usize,
        /// The failed script.
        script: String,
        /// Number of scripts durably committed before the failure.
        committed_scripts: usize,
        /// The underlying error.
        #[source]
        source: Box<GeneratorError>,
    },

    /// A metadata statement touched an unexpected number of rows.
    #[error(
        "Script {script_index} affected {actual} row(s) instead of {expected} after {committed_scripts} script(s) were committed: {script}"
    )]
    RowCountMismatch {
        /// Index of the script in the executed script list.
        script_index: usize,
        /// The metadata statement.
        script: String,
        /// Number of scripts durably committed before the failure.
        committed_scripts: usize,
        /// Expected affected rows.
        expected: u64,
        /// Actual affected rows.
        actual: u64,
    },

    /// The database transaction state changed unexpectedly.
    #[error(
        "Unexpected transaction state after script {script_index}: expected in_transaction={expected}, found {actual} ({committed_scripts} script(s) committed)"
    )]
    TransactionStateMismatch {
        /// Expected state.
        expected: bool,
        /// Observed state.
        actual: bool,
        /// Index of the last executed script.
        script_index: usize,
        /// Number of scripts durably committed before the failure.
        committed_scripts: usize,
    },

    /// The named database lock is held by another process.
    #[error("Database lock '{0}' is held by another process")]
    LockUnavailable(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading model files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a model file.
    #[error("Failed to parse model file '{path}': {source}")]
    ModelFile {
        /// Path to the model file.
        path: PathBuf,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal invariant was violated.
    #[error("Invalid generator state: {0}")]
    InvalidState(String),
}

/// Result type for generator operations.
pub type Result<T> = std::result::Result<T, GeneratorError>;
