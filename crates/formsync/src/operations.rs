//! Schema operations and migration vocabulary.
//!
//! `SchemaOperation` is the DDL the engine issues against dynamic tables.
//! `MigrationType` and `MigrationStatus` are the audit vocabulary recorded in
//! the `migrations` table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MigrateError;
use crate::schema::{ColumnSchema, TableSchema};

/// A single DDL operation on a dynamic table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaOperation {
    /// Create a new table.
    CreateTable {
        /// Table definition.
        table: TableSchema,
    },

    /// Drop a table.
    DropTable {
        /// Table name.
        name: String,
        /// Whether to use IF EXISTS.
        if_exists: bool,
    },

    /// Add a column to a table.
    AddColumn {
        /// Table name.
        table: String,
        /// Column definition.
        column: ColumnSchema,
    },

    /// Drop a column from a table.
    DropColumn {
        /// Table name.
        table: String,
        /// Column name.
        column_name: String,
    },

    /// Rename a column.
    RenameColumn {
        /// Table name.
        table: String,
        /// Old column name.
        old_name: String,
        /// New column name.
        new_name: String,
    },
}

impl SchemaOperation {
    /// Creates a CreateTable operation.
    #[must_use]
    pub fn create_table(table: TableSchema) -> Self {
        Self::CreateTable { table }
    }

    /// Creates a DropTable operation.
    #[must_use]
    pub fn drop_table(name: impl Into<String>) -> Self {
        Self::DropTable {
            name: name.into(),
            if_exists: false,
        }
    }

    /// Creates an AddColumn operation.
    #[must_use]
    pub fn add_column(table: impl Into<String>, column: ColumnSchema) -> Self {
        Self::AddColumn {
            table: table.into(),
            column,
        }
    }

    /// Creates a DropColumn operation.
    #[must_use]
    pub fn drop_column(table: impl Into<String>, column_name: impl Into<String>) -> Self {
        Self::DropColumn {
            table: table.into(),
            column_name: column_name.into(),
        }
    }

    /// Creates a RenameColumn operation.
    #[must_use]
    pub fn rename_column(
        table: impl Into<String>,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Self {
        Self::RenameColumn {
            table: table.into(),
            old_name: old_name.into(),
            new_name: new_name.into(),
        }
    }

    /// Returns the structural inverse of this operation.
    ///
    /// Returns `None` for drops: their inverse needs the data captured in a
    /// backup, which the operation alone does not carry.
    #[must_use]
    pub fn reverse(&self) -> Option<Self> {
        match self {
            Self::CreateTable { table } => Some(Self::drop_table(table.name.clone())),
            Self::AddColumn { table, column } => {
                Some(Self::drop_column(table.clone(), column.name.clone()))
            }
            Self::RenameColumn {
                table,
                old_name,
                new_name,
            } => Some(Self::rename_column(
                table.clone(),
                new_name.clone(),
                old_name.clone(),
            )),
            Self::DropTable { .. } | Self::DropColumn { .. } => None,
        }
    }

    /// Returns a short description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::CreateTable { table } => format!("Create table {}", table.name),
            Self::DropTable { name, .. } => format!("Drop table {name}"),
            Self::AddColumn { table, column } => {
                format!("Add column {} to {table}", column.name)
            }
            Self::DropColumn { table, column_name } => {
                format!("Drop column {column_name} from {table}")
            }
            Self::RenameColumn {
                table,
                old_name,
                new_name,
            } => format!("Rename column {old_name} to {new_name} on {table}"),
        }
    }
}

/// Kind of a recorded migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    /// A column was added.
    AddField,
    /// A column was dropped.
    DeleteField,
    /// A column was renamed.
    RenameField,
    /// A column changed type.
    ChangeType,
}

impl MigrationType {
    /// Returns the stored name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddField => "ADD_FIELD",
            Self::DeleteField => "DELETE_FIELD",
            Self::RenameField => "RENAME_FIELD",
            Self::ChangeType => "CHANGE_TYPE",
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD_FIELD" => Ok(Self::AddField),
            "DELETE_FIELD" => Ok(Self::DeleteField),
            "RENAME_FIELD" => Ok(Self::RenameField),
            "CHANGE_TYPE" => Ok(Self::ChangeType),
            other => Err(MigrateError::InvalidState(format!(
                "unknown migration type '{other}'"
            ))),
        }
    }
}

/// Lifecycle of a recorded migration.
///
/// `Pending` becomes `Success` or `Failed`; only `Success` may become
/// `RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    /// Dequeued, not yet finished.
    Pending,
    /// Applied.
    Success,
    /// Gave up.
    Failed,
    /// Applied, then reverted.
    RolledBack,
}

impl MigrationStatus {
    /// Returns the stored name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    /// Returns true once no further forward transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "ROLLED_BACK" => Ok(Self::RolledBack),
            other => Err(MigrateError::InvalidState(format!(
                "unknown migration status '{other}'"
            ))),
        }
    }
}
