//! Table schema and additive evolution.
//!
//! The schema starts with the fixed base columns. Every key found in an
//! event's `extra` mapping becomes a nullable column, appended in first-seen
//! order, with a type inferred from the values of the batch that introduced
//! it. A later batch holding values the column cannot represent widens it in
//! the new snapshot (integers to floats, anything mixed to text holding the
//! JSON rendering). Files written under the narrower type are cast on read.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TableRow;

/// Column types supported by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Utf8,
    Int64,
    Float64,
    Boolean,
    /// Microseconds since the epoch, UTC.
    TimestampMicros,
    /// Days since the epoch.
    Date32,
}

impl ColumnType {
    pub fn to_arrow(self) -> DataType {
        match self {
            Self::Utf8 => DataType::Utf8,
            Self::Int64 => DataType::Int64,
            Self::Float64 => DataType::Float64,
            Self::Boolean => DataType::Boolean,
            Self::TimestampMicros => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            Self::Date32 => DataType::Date32,
        }
    }

    /// Type of a single JSON value, `None` for null.
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Boolean),
            Value::Number(n) if n.is_i64() => Some(Self::Int64),
            Value::Number(_) => Some(Self::Float64),
            Value::String(_) | Value::Array(_) | Value::Object(_) => Some(Self::Utf8),
        }
    }

    /// Narrowest type able to hold values of both types.
    pub fn widen(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::Int64, Self::Float64) | (Self::Float64, Self::Int64) => Self::Float64,
            _ => Self::Utf8,
        }
    }
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl Column {
    fn new(name: &str, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable,
        }
    }
}

/// Ordered list of table columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

/// Columns touched by [`TableSchema::evolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaChanges {
    pub added: Vec<String>,
    pub widened: Vec<String>,
}

impl SchemaChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.widened.is_empty()
    }
}

/// Names of the base columns, in schema order.
pub const BASE_COLUMNS: [&str; 8] = [
    "event_id",
    "event_type",
    "user_id",
    "session_id",
    "location",
    "device",
    "timestamp",
    "event_date",
];

impl Default for TableSchema {
    fn default() -> Self {
        Self::base()
    }
}

impl TableSchema {
    /// The base columns every table starts with.
    pub fn base() -> Self {
        Self {
            columns: vec![
                Column::new("event_id", ColumnType::Utf8, false),
                Column::new("event_type", ColumnType::Utf8, false),
                Column::new("user_id", ColumnType::Utf8, true),
                Column::new("session_id", ColumnType::Utf8, false),
                Column::new("location", ColumnType::Utf8, true),
                Column::new("device", ColumnType::Utf8, true),
                Column::new("timestamp", ColumnType::TimestampMicros, false),
                Column::new("event_date", ColumnType::Date32, false),
            ],
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns holding `extra` values (everything after the base columns).
    pub fn extra_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !is_base_column(&c.name))
    }

    /// Extend the schema with columns for unseen `extra` keys of `rows` and
    /// widen existing columns whose type cannot hold the new values.
    pub fn evolve(&mut self, rows: &[TableRow]) -> SchemaChanges {
        let mut order: Vec<&str> = Vec::new();
        let mut inferred: HashMap<&str, Option<ColumnType>> = HashMap::new();
        let mut changes = SchemaChanges::default();

        for row in rows {
            for (key, value) in &row.event.extra {
                if is_base_column(key) {
                    continue;
                }
                let Some(ty) = ColumnType::infer(value) else {
                    if self.column(key).is_none() {
                        inferred.entry(key.as_str()).or_insert_with(|| {
                            order.push(key.as_str());
                            None
                        });
                    }
                    continue;
                };

                if let Some(column) = self.columns.iter_mut().find(|c| c.name == *key) {
                    let widened = column.column_type.widen(ty);
                    if widened != column.column_type {
                        column.column_type = widened;
                        if !changes.widened.iter().any(|name| name == key) {
                            changes.widened.push(key.clone());
                        }
                    }
                    continue;
                }

                let slot = inferred.entry(key.as_str()).or_insert_with(|| {
                    order.push(key.as_str());
                    None
                });
                *slot = Some(slot.map_or(ty, |current| current.widen(ty)));
            }
        }

        for name in order {
            // A key seen only with nulls has no type evidence yet
            let column_type = inferred.get(name).copied().flatten().unwrap_or(ColumnType::Utf8);
            self.columns.push(Column::new(name, column_type, true));
            changes.added.push(name.to_string());
        }
        changes
    }

    /// Arrow schema for data files and scans.
    pub fn to_arrow(&self) -> Arc<Schema> {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(&c.name, c.column_type.to_arrow(), c.nullable))
            .collect();
        Arc::new(Schema::new(fields))
    }
}

/// Whether `name` is a base column (and so never an `extra` column).
pub fn is_base_column(name: &str) -> bool {
    BASE_COLUMNS.contains(&name)
}
