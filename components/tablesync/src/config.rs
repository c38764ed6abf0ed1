/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::error::{Error, Result};
use serde_derive::{Deserialize, Serialize};

/// Whether a table takes part in change extraction or only receives
/// changes applied from elsewhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    /// The table is still change-tracked (the conflict check needs local
    /// history) and accepts applied changes, but is skipped by
    /// `get_initial_set` and `get_incremental_changes`.
    PullOnly,
}

/// Target kinds for value coercion, declared per column by a
/// [`RecordSchema`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Text,
    Integer,
    Boolean,
    Decimal,
    Float,
    Double,
    DateTime,
    Byte,
    Char,
}

/// An explicit per-column coercion table: column name -> value kind.
/// Columns not listed here pass through with the driver's native value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSchema {
    columns: Vec<(String, ColumnKind)>,
}

impl RecordSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push((name.into(), kind));
        self
    }

    /// Column names compare the way SQLite compares identifiers, ignoring
    /// ASCII case.
    pub fn kind_of(&self, column: &str) -> Option<ColumnKind> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, kind)| *kind)
    }
}

/// One table to synchronize.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncTable {
    pub name: String,
    pub schema: String,
    pub direction: SyncDirection,
    pub record_schema: Option<RecordSchema>,
}

impl SyncTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: "main".to_string(),
            direction: SyncDirection::default(),
            record_schema: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn pull_only(mut self) -> Self {
        self.direction = SyncDirection::PullOnly;
        self
    }

    pub fn with_record_schema(mut self, record_schema: RecordSchema) -> Self {
        self.record_schema = Some(record_schema);
        self
    }

    /// The `schema.name` form used in change-log rows and change items.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// The full configuration surface: where the store lives and which tables
/// to keep in sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub connection_string: String,
    pub tables: Vec<SyncTable>,
}

impl SyncConfiguration {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            tables: Vec::new(),
        }
    }

    pub fn table(mut self, table: SyncTable) -> Self {
        self.tables.push(table);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(Error::Configuration(
                "connection string must not be empty".to_string(),
            ));
        }
        for table in &self.tables {
            validate_identifier(&table.name)?;
            validate_identifier(&table.schema)?;
        }
        for (i, table) in self.tables.iter().enumerate() {
            let qualified = table.qualified_name();
            if self.tables[..i]
                .iter()
                .any(|other| other.qualified_name().eq_ignore_ascii_case(&qualified))
            {
                return Err(Error::Configuration(format!(
                    "table '{}' is configured more than once",
                    qualified
                )));
            }
        }
        Ok(())
    }
}

/// Table and column names end up interpolated into SQL. They come from
/// trusted configuration, but reject anything that could escape the
/// bracket-quoting (or the single-quoted change-log literals) outright.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Configuration(
            "identifiers must not be empty".to_string(),
        ));
    }
    if name
        .chars()
        .any(|c| matches!(c, '\'' | '"' | '[' | ']' | '`') || c.is_control())
    {
        return Err(Error::Configuration(format!(
            "identifier '{}' contains a quote or control character",
            name
        )));
    }
    Ok(())
}
