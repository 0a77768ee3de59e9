//! Error types for the synchronization engine.

/// How the queue should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff (connection loss, busy database).
    Transient,
    /// Deterministic conflict; retrying reproduces it.
    Structural,
    /// The job can never succeed against the current configuration.
    Fatal,
}

/// Errors that can occur while naming, diffing, or migrating dynamic tables.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Database error during migration execution.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The form has never been materialized into a table.
    #[error("Form '{0}' has no dynamic table yet")]
    TableNotMaterialized(String),

    /// The target table is recorded but does not exist in the database.
    #[error("Table '{0}' does not exist")]
    TableMissing(String),

    /// No form registered under this id.
    #[error("Form not found: {0}")]
    FormNotFound(String),

    /// No sub-form registered under this id.
    #[error("Sub-form not found: {0}")]
    SubFormNotFound(String),

    /// A column with this name already exists.
    #[error("Column '{column}' already exists on '{table}'")]
    DuplicateColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A column expected by the operation is absent.
    #[error("Column '{column}' not found on '{table}'")]
    ColumnNotFound {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A stored value cannot be converted to the target column type.
    #[error("Cannot cast value {value:?} of row '{row_id}' to {target}")]
    InvalidCast {
        /// Row holding the offending value.
        row_id: String,
        /// The offending value, as text.
        value: String,
        /// Target column type.
        target: String,
    },

    /// Unknown field type string.
    #[error("Unknown field type: {0}")]
    UnknownFieldType(String),

    /// Unknown column type string.
    #[error("Unknown column type: {0}")]
    UnknownColumnType(String),

    /// A migration is not reversible.
    #[error("Migration '{0}' is not reversible")]
    NotReversible(i64),

    /// Migration not found.
    #[error("Migration not found: {0}")]
    MigrationNotFound(i64),

    /// Backup not found.
    #[error("Backup not found: {0}")]
    BackupNotFound(i64),

    /// Queue job not found.
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    /// Invalid migration state.
    #[error("Invalid migration state: {0}")]
    InvalidState(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (reading configuration).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrateError {
    /// Classifies the error for the queue's retry policy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Database(err) => classify_sqlx(err),
            Self::Io(_) => ErrorClass::Transient,
            Self::TableNotMaterialized(_)
            | Self::TableMissing(_)
            | Self::FormNotFound(_)
            | Self::SubFormNotFound(_)
            | Self::UnknownFieldType(_)
            | Self::UnknownColumnType(_)
            | Self::Config(_) => ErrorClass::Fatal,
            Self::DuplicateColumn { .. }
            | Self::ColumnNotFound { .. }
            | Self::InvalidCast { .. }
            | Self::NotReversible(_)
            | Self::MigrationNotFound(_)
            | Self::BackupNotFound(_)
            | Self::JobNotFound(_)
            | Self::InvalidState(_)
            | Self::Serialization(_) => ErrorClass::Structural,
        }
    }

    /// Returns true if the queue should retry the job.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
fn classify_sqlx(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::Transient,
        sqlx::Error::Database(db) => {
            let busy = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6));
            if busy {
                ErrorClass::Transient
            } else {
                ErrorClass::Structural
            }
        }
        _ => ErrorClass::Structural,
    }
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
