//! Row change events published by the database notify trigger.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

/// The kind of row change, as reported by `TG_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    /// The wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "INSERT",
            ChangeAction::Update => "UPDATE",
            ChangeAction::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row change on a watched table.
///
/// This is exactly the object the trigger function passes to `pg_notify`:
/// `{ "table": ..., "action": ..., "data": { column: value, ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Name of the table the row belongs to.
    pub table: String,
    /// What happened to the row.
    pub action: ChangeAction,
    /// The affected row (the old row for deletes).
    pub data: Map<String, Value>,
}

impl ChangeEvent {
    /// Create a change event.
    pub fn new(table: impl Into<String>, action: ChangeAction, data: Map<String, Value>) -> Self {
        Self {
            table: table.into(),
            action,
            data,
        }
    }

    /// Decode the text payload of a notify channel message.
    pub fn from_notification(payload: &str) -> Result<Self, Error> {
        serde_json::from_str(payload).map_err(|e| Error::InvalidNotification(e.to_string()))
    }

    /// Return a copy whose row data only carries the given columns.
    ///
    /// An empty column list keeps every column.
    pub fn project(&self, columns: &[String]) -> Self {
        if columns.is_empty() {
            return self.clone();
        }

        let data = self
            .data
            .iter()
            .filter(|(name, _)| columns.iter().any(|c| c == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Self {
            table: self.table.clone(),
            action: self.action,
            data,
        }
    }
}
