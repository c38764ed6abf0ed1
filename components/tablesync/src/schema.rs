/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The sidecar schema: the change-log and meta tables that live inside the
//! host database, the per-table change-tracking triggers, and the column
//! introspection the rest of the crate builds on.
//!
//! Everything here is `CREATE ... IF NOT EXISTS` so installation can be
//! re-run on every open.

use crate::config::SyncTable;
use crate::error::{Error, Result};
use crate::types::ChangeType;
use rusqlite::{Connection, Transaction};
use sql_support::open_database::{
    ConnectionInitializer, Error as OpenError, Result as OpenResult,
};
use sql_support::ConnExt;

/// The append-only change-log. ID doubles as the store's version counter:
/// INTEGER PRIMARY KEY aliases the rowid, so IDs are dense, ascending and
/// never reused while the table exists.
pub(crate) const CHANGE_LOG_TABLE: &str = "__CORE_SYNC_CT";

/// Sidecar bookkeeping (schema version). We can't use PRAGMA user_version
/// for that - the host application owns it.
pub(crate) const META_TABLE: &str = "__CORE_SYNC_META";

const CREATE_SIDECAR_SQL: &str = "
    CREATE TABLE IF NOT EXISTS [__CORE_SYNC_CT] (
        ID INTEGER PRIMARY KEY,
        TBL TEXT NOT NULL,
        OP CHAR NOT NULL,
        PK TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS [__CORE_SYNC_CT_TBL_PK__]
        ON [__CORE_SYNC_CT] (TBL, PK, ID);
    CREATE TABLE IF NOT EXISTS [__CORE_SYNC_META] (
        key    TEXT PRIMARY KEY,
        value  NOT NULL
    );
";

const DROP_SIDECAR_SQL: &str = "
    DROP TABLE IF EXISTS [__CORE_SYNC_CT];
    DROP TABLE IF EXISTS [__CORE_SYNC_META];
";

pub(crate) struct SyncConnectionInitializer;

impl ConnectionInitializer for SyncConnectionInitializer {
    const NAME: &'static str = "tablesync storage db";
    const END_VERSION: u32 = 1;
    const META_TABLE: &'static str = META_TABLE;

    fn prepare(&self, conn: &Connection, _sidecar_absent: bool) -> OpenResult<()> {
        let initial_pragmas = "
            -- We don't care about temp tables being persisted to disk.
            PRAGMA temp_store = 2;
            -- we unconditionally want write-ahead-logging mode.
            PRAGMA journal_mode = WAL;
        ";
        conn.execute_batch(initial_pragmas)?;
        conn.set_prepared_statement_cache_capacity(128);
        Ok(())
    }

    fn init(&self, db: &Transaction<'_>) -> OpenResult<()> {
        log::debug!("Creating sidecar schema");
        db.execute_batch(CREATE_SIDECAR_SQL)?;
        Ok(())
    }

    fn upgrade_from(&self, _db: &Transaction<'_>, version: u32) -> OpenResult<()> {
        Err(OpenError::IncompatibleVersion(version))
    }
}

/// Remove the sidecar tables. Trigger teardown is separate because trigger
/// names derive from the configured tables.
pub(crate) fn drop_sidecar(conn: &Connection) -> Result<()> {
    conn.execute_batch(DROP_SIDECAR_SQL)?;
    Ok(())
}

/// One column of a configured table, as discovered from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    /// 0 for non-key columns, otherwise the 1-based position within the
    /// primary key.
    pub pk_index: u32,
}

impl ColumnInfo {
    pub fn is_pk(&self) -> bool {
        self.pk_index > 0
    }

    /// Whether the declared type has INTEGER affinity, which decides the
    /// fingerprint format token.
    pub fn is_integer(&self) -> bool {
        self.decl_type.to_ascii_uppercase().contains("INT")
    }
}

/// Read column metadata for a configured table, in declaration order.
/// A name that resolves to nothing is a configuration error - so is a table
/// with no discoverable primary key, since the fingerprint would be empty.
pub(crate) fn fetch_columns(conn: &Connection, table: &SyncTable) -> Result<Vec<ColumnInfo>> {
    let columns = conn.query_rows_and_then_cached(
        "SELECT name, type, pk FROM pragma_table_info(?, ?) ORDER BY cid",
        [table.name.as_str(), table.schema.as_str()],
        |row| -> Result<ColumnInfo> {
            Ok(ColumnInfo {
                name: row.get(0)?,
                decl_type: row.get(1)?,
                pk_index: row.get(2)?,
            })
        },
    )?;
    if columns.is_empty() {
        return Err(Error::Configuration(format!(
            "table '{}' does not exist",
            table.qualified_name()
        )));
    }
    if !columns.iter().any(|c| c.is_pk()) {
        return Err(Error::Configuration(format!(
            "table '{}' has no primary key",
            table.qualified_name()
        )));
    }
    Ok(columns)
}

/// The primary-key columns in key order (which is not necessarily
/// declaration order for composite keys).
pub(crate) fn pk_columns(columns: &[ColumnInfo]) -> Vec<&ColumnInfo> {
    let mut pks: Vec<&ColumnInfo> = columns.iter().filter(|c| c.is_pk()).collect();
    pks.sort_by_key(|c| c.pk_index);
    pks
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("[{}]", name)
}

/// The deterministic textual encoding of a row's primary key: one printf
/// token per key column ('%d' for integer columns, '%s' otherwise), applied
/// to the key values. Equal keys yield equal fingerprints for every
/// supported column type; collisions across types are tolerable because the
/// change-log scopes fingerprints by table.
pub(crate) fn fingerprint_expr(columns: &[ColumnInfo], qualifier: &str) -> String {
    let pks = pk_columns(columns);
    let format: String = pks
        .iter()
        .map(|c| if c.is_integer() { "%d" } else { "%s" })
        .collect();
    let args: Vec<String> = pks
        .iter()
        .map(|c| format!("{}.{}", qualifier, quote_ident(&c.name)))
        .collect();
    format!("printf('{}', {})", format, args.join(", "))
}

fn trigger_name(table: &SyncTable, op: ChangeType) -> String {
    let op_name = match op {
        ChangeType::Insert => "INSERT",
        ChangeType::Update => "UPDATE",
        ChangeType::Delete => "DELETE",
    };
    format!("__{}_ct-{}__", table.name, op_name)
}

fn create_trigger_sql(table: &SyncTable, columns: &[ColumnInfo], op: ChangeType) -> String {
    // Deletes only have the old row to fingerprint.
    let row_qualifier = match op {
        ChangeType::Delete => "OLD",
        _ => "NEW",
    };
    format!(
        "CREATE TRIGGER IF NOT EXISTS {schema}.{name}
         AFTER {op_name} ON {table}
         FOR EACH ROW
         BEGIN
             INSERT INTO {log} (TBL, OP, PK) VALUES ('{qualified}', '{op_code}', {fingerprint});
         END",
        schema = quote_ident(&table.schema),
        name = quote_ident(&trigger_name(table, op)),
        op_name = match op {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        },
        table = quote_ident(&table.name),
        log = quote_ident(CHANGE_LOG_TABLE),
        qualified = table.qualified_name(),
        op_code = op.op_code(),
        fingerprint = fingerprint_expr(columns, row_qualifier),
    )
}

/// The three change-tracking triggers for one table. Names are stable and
/// derived from the table name, so IF NOT EXISTS makes installation
/// idempotent.
pub(crate) fn create_trigger_sqls(table: &SyncTable, columns: &[ColumnInfo]) -> Vec<String> {
    [ChangeType::Insert, ChangeType::Update, ChangeType::Delete]
        .into_iter()
        .map(|op| create_trigger_sql(table, columns, op))
        .collect()
}

pub(crate) fn drop_trigger_sqls(table: &SyncTable) -> Vec<String> {
    [ChangeType::Insert, ChangeType::Update, ChangeType::Delete]
        .into_iter()
        .map(|op| {
            format!(
                "DROP TRIGGER IF EXISTS {}.{}",
                quote_ident(&table.schema),
                quote_ident(&trigger_name(table, op))
            )
        })
        .collect()
}
