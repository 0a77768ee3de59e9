//! Change detection between two versions of a form's field list.
//!
//! The detector is a pure function: it holds no state and never touches the
//! database. Fields are matched only by their stable id; a renamed title or a
//! same-titled replacement is never guessed to be a rename.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::operations::MigrationType;
use crate::schema::{FieldDefinition, FieldInput, FieldType};

/// One schema change for a dynamic table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    /// Add a column for a new field.
    AddField {
        /// Field identity, when already assigned.
        field_id: Option<String>,
        /// Display title, used to name the column when none is given.
        title: String,
        /// Requested column name.
        column_name: Option<String>,
        /// Field type.
        field_type: FieldType,
    },

    /// Drop the column of a removed field.
    DeleteField {
        /// Field identity.
        field_id: String,
        /// Column to drop.
        column_name: String,
        /// Field type before removal.
        field_type: FieldType,
    },

    /// Rename a field's column.
    RenameField {
        /// Field identity.
        field_id: String,
        /// Current column name.
        old_column: String,
        /// New column name.
        new_column: String,
    },

    /// Convert a field's column to another type.
    ChangeType {
        /// Field identity.
        field_id: String,
        /// Column, by its post-rename name.
        column_name: String,
        /// Current field type.
        old_type: FieldType,
        /// New field type.
        new_type: FieldType,
    },
}

impl Change {
    /// Returns the migration type recorded for this change.
    #[must_use]
    pub fn migration_type(&self) -> MigrationType {
        match self {
            Self::AddField { .. } => MigrationType::AddField,
            Self::DeleteField { .. } => MigrationType::DeleteField,
            Self::RenameField { .. } => MigrationType::RenameField,
            Self::ChangeType { .. } => MigrationType::ChangeType,
        }
    }

    /// Returns the field this change concerns, if it has an id yet.
    #[must_use]
    pub fn field_id(&self) -> Option<&str> {
        match self {
            Self::AddField { field_id, .. } => field_id.as_deref(),
            Self::DeleteField { field_id, .. }
            | Self::RenameField { field_id, .. }
            | Self::ChangeType { field_id, .. } => Some(field_id),
        }
    }

    /// Returns a short description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::AddField {
                title,
                column_name,
                field_type,
                ..
            } => match column_name {
                Some(column) => format!("Add {column} ({field_type})"),
                None => format!("Add '{title}' ({field_type})"),
            },
            Self::DeleteField { column_name, .. } => format!("Delete {column_name}"),
            Self::RenameField {
                old_column,
                new_column,
                ..
            } => format!("Rename {old_column} to {new_column}"),
            Self::ChangeType {
                column_name,
                old_type,
                new_type,
                ..
            } => format!("Change {column_name} from {old_type} to {new_type}"),
        }
    }
}

/// Diffs field lists into an ordered change plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    /// Creates a detector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Compares `old` with `new` and returns the changes that turn one into
    /// the other.
    ///
    /// Output order is all renames, then deletes, then adds, then type
    /// changes. Renames, adds and type changes follow the order of `new`;
    /// deletes follow the order of `old`.
    #[must_use]
    pub fn diff(&self, old: &[FieldDefinition], new: &[FieldInput]) -> Vec<Change> {
        let old_by_id: HashMap<&str, &FieldDefinition> =
            old.iter().map(|f| (f.id.as_str(), f)).collect();

        // Old field id to the input carrying it; a repeated id counts as new.
        let mut matched: HashMap<&str, &FieldInput> = HashMap::new();
        let mut renames = Vec::new();
        let mut adds = Vec::new();
        let mut type_changes = Vec::new();

        for input in new {
            let previous = input
                .id
                .as_deref()
                .filter(|id| !matched.contains_key(id))
                .and_then(|id| old_by_id.get(id).copied());
            let Some(previous) = previous else {
                if input.field_type.is_mirrored() {
                    adds.push(add_change(input));
                }
                continue;
            };
            matched.insert(previous.id.as_str(), input);

            match (previous.field_type.is_mirrored(), input.field_type.is_mirrored()) {
                (true, true) => {
                    let mut column = previous.column_name.clone();
                    if let Some(requested) = &input.column_name {
                        if *requested != previous.column_name {
                            renames.push(Change::RenameField {
                                field_id: previous.id.clone(),
                                old_column: previous.column_name.clone(),
                                new_column: requested.clone(),
                            });
                            column = requested.clone();
                        }
                    }
                    if input.field_type.column_type() != previous.field_type.column_type() {
                        type_changes.push(Change::ChangeType {
                            field_id: previous.id.clone(),
                            column_name: column,
                            old_type: previous.field_type,
                            new_type: input.field_type,
                        });
                    }
                }
                (false, true) => adds.push(add_change(input)),
                // Leaving the mirror is handled as a delete below.
                (true, false) | (false, false) => {}
            }
        }

        let deletes: Vec<Change> = old
            .iter()
            .filter(|f| f.field_type.is_mirrored())
            .filter(|f| match matched.get(f.id.as_str()) {
                None => true,
                Some(input) => !input.field_type.is_mirrored(),
            })
            .map(|f| Change::DeleteField {
                field_id: f.id.clone(),
                column_name: f.column_name.clone(),
                field_type: f.field_type,
            })
            .collect();

        let mut changes = renames;
        changes.extend(deletes);
        changes.extend(adds);
        changes.extend(type_changes);
        changes
    }
}

fn add_change(input: &FieldInput) -> Change {
    Change::AddField {
        field_id: input.id.clone(),
        title: input.title.clone(),
        column_name: input.column_name.clone(),
        field_type: input.field_type,
    }
}
