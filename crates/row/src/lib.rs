#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The data model shared between the replication source and the pipeline
//! runner: row changes, replication-position checkpoints, and the
//! intermediate row representation that stages read and write.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row mutation as observed on the replication log.
pub type IntermediateRow = serde_json::Map<String, Value>;

/// The kind of change a `RowEvent` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// A new row was inserted.
    Insert,
    /// An existing row was modified; `RowEvent::row` carries the post-image.
    Update,
    /// A row was removed; `RowEvent::row` carries the pre-image.
    Delete,
}

impl Action {
    /// The lowercase name used in channel keys and log lines (`insert`, `update`, `delete`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row change pulled off the replication log, already filtered to a
/// schema/table the pipeline has been configured to care about.
#[derive(Debug, Clone)]
pub struct RowEvent {
    /// Source schema name.
    pub schema: String,
    /// Source table name.
    pub table: String,
    /// The kind of change.
    pub action: Action,
    /// Post-image for insert/update, pre-image for delete.
    pub row: IntermediateRow,
}

impl RowEvent {
    /// Builds the `schema_table_action` key used to look up projection
    /// configurations in the registry.
    pub fn registry_key(&self) -> String {
        format!("{}_{}_{}", self.schema, self.table, self.action.as_str())
    }

    /// Seeds the pipeline's working row from this event: the row image plus
    /// `schema`/`table`/`action` and a stringified `id`.
    ///
    /// Fails if the row has no `id` field or it cannot be coerced to a string
    /// (the id normalizer accepts any JSON-integral width or numeric string).
    pub fn seed_row(&self) -> Result<IntermediateRow, RowError> {
        let id = coerce_id(self.row.get("id").ok_or(RowError::MissingId)?)?;

        let mut seeded = self.row.clone();
        let _ = seeded.insert("schema".to_string(), Value::String(self.schema.clone()));
        let _ = seeded.insert("table".to_string(), Value::String(self.table.clone()));
        let _ = seeded.insert("action".to_string(), Value::String(self.action.as_str().to_string()));
        let _ = seeded.insert("id".to_string(), Value::String(id));

        Ok(seeded)
    }
}

/// A replication-position checkpoint emitted at transaction commit, log
/// rotation, or a DDL boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionMarker {
    /// The binlog file name.
    pub log_name: String,
    /// The byte offset within that file.
    pub log_offset: u64,
    /// `true` on rotation/DDL boundaries; `true` also forces an immediate
    /// checkpoint rather than waiting for the periodic debounce window.
    pub force: bool,
}

/// The single value type carried over the bounded channel between the
/// replication source and the pipeline's consumer loop.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// A row change to run through the projection pipeline.
    Row(RowEvent),
    /// A position checkpoint to (maybe) persist.
    Position(PositionMarker),
}

/// Errors raised while normalizing a row into the pipeline's working shape.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum RowError {
    /// The row image carried no `id` field.
    #[error("row has no `id` field")]
    MissingId,
    /// The `id` field was present but not a recognized integral or numeric-string shape.
    #[error("`id` field is not an integer or numeric string: {0}")]
    UnsupportedId(Value),
}

/// Coerces a JSON value into the stringified primary key used as the
/// document id downstream. Accepts JSON integers of any width, JSON floats
/// with no fractional part, and numeric strings — mirroring a replication
/// client's habit of surfacing integer columns with varying native widths.
pub fn coerce_id(value: &Value) -> Result<String, RowError> {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Ok(u.to_string())
            } else if let Some(i) = n.as_i64() {
                Ok(i.to_string())
            } else if let Some(f) = n.as_f64() {
                Ok((f as u64).to_string())
            } else {
                Err(RowError::UnsupportedId(value.clone()))
            }
        }
        Value::String(s) => {
            if s.parse::<i64>().is_ok() || s.parse::<u64>().is_ok() {
                Ok(s.clone())
            } else {
                Err(RowError::UnsupportedId(value.clone()))
            }
        }
        other => Err(RowError::UnsupportedId(other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(fields: serde_json::Value) -> IntermediateRow {
        fields.as_object().unwrap().clone()
    }

    #[test]
    fn registry_key_joins_schema_table_action() {
        let event = RowEvent {
            schema: "shop".into(),
            table: "orders".into(),
            action: Action::Insert,
            row: row(json!({"id": 42})),
        };
        assert_eq!(event.registry_key(), "shop_orders_insert");
    }

    #[test]
    fn seed_row_adds_metadata_and_stringifies_id() {
        let event = RowEvent {
            schema: "shop".into(),
            table: "orders".into(),
            action: Action::Update,
            row: row(json!({"id": 42, "status": "paid"})),
        };
        let seeded = event.seed_row().expect("seed should succeed");
        assert_eq!(seeded.get("id"), Some(&Value::String("42".into())));
        assert_eq!(seeded.get("schema"), Some(&Value::String("shop".into())));
        assert_eq!(seeded.get("table"), Some(&Value::String("orders".into())));
        assert_eq!(seeded.get("action"), Some(&Value::String("update".into())));
        assert_eq!(seeded.get("status"), Some(&Value::String("paid".into())));
    }

    #[test]
    fn seed_row_fails_without_id() {
        let event = RowEvent {
            schema: "shop".into(),
            table: "orders".into(),
            action: Action::Insert,
            row: row(json!({"status": "new"})),
        };
        assert!(matches!(event.seed_row(), Err(RowError::MissingId)));
    }

    #[test]
    fn coerce_id_accepts_numeric_widths_and_strings() {
        assert_eq!(coerce_id(&json!(42)).unwrap(), "42");
        assert_eq!(coerce_id(&json!(-7)).unwrap(), "-7");
        assert_eq!(coerce_id(&json!("42")).unwrap(), "42");
        assert!(coerce_id(&json!("not-a-number")).is_err());
        assert!(coerce_id(&json!(null)).is_err());
    }
}
