/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The provider ties everything together: one-shot initialization
//! (introspection, trigger installation, template building), the two
//! extractors and the conflict-aware applier.
//!
//! Each public operation opens its own connection and runs under a single
//! transaction; concurrent callers are serialized by SQLite's transaction
//! semantics. The provider keeps no mutable state between calls beyond the
//! memoized per-table descriptors.

use crate::config::{ColumnKind, SyncConfiguration, SyncDirection, SyncTable};
use crate::error::{Error, Result};
use crate::schema::{self, ColumnInfo, SyncConnectionInitializer};
use crate::templates::{
    self, build_templates, TableTemplates, TemplateParam, PARAM_LAST_SYNC_VERSION,
    PARAM_SYNC_FORCE_WRITE,
};
use crate::types::{
    Anchor, ChangeItem, ChangeSet, ChangeType, ConflictResolution, ConflictResolver, JsonMap,
};
use crate::values::{json_to_sql, sql_to_json};
use interrupt_support::{InterruptHandle, Interruptee};
use parking_lot::Mutex;
use rusqlite::types::{ToSql, Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, Row};
use serde_json::Value as JsonValue;
use sql_support::open_database::open_database_with_flags;
use sql_support::{ConnExt, UncheckedTransaction};
use std::sync::Arc;

const VERSION_BOUNDS_SQL: &str =
    "SELECT IFNULL(MAX(ID), 0), IFNULL(MIN(ID), 0) FROM [__CORE_SYNC_CT]";

// CT.PK and MIN(CT.OP) come first in the incremental SELECT.
const INCREMENTAL_COLUMN_OFFSET: usize = 2;

pub struct SyncProvider {
    config: SyncConfiguration,
    state: Mutex<ProviderState>,
    interrupt_handle: InterruptHandle,
}

#[derive(Default)]
struct ProviderState {
    tables: Option<Arc<Vec<TrackedTable>>>,
    // Keeps a shared-cache memory store alive between the per-operation
    // connections; never used to run statements.
    memory_conn: Option<Connection>,
}

struct TrackedTable {
    table: SyncTable,
    qualified: String,
    columns: Vec<ColumnInfo>,
    templates: TableTemplates,
}

impl TrackedTable {
    fn is_pull_only(&self) -> bool {
        self.table.direction == SyncDirection::PullOnly
    }

    fn kind_of(&self, column: &str) -> Option<ColumnKind> {
        self.table
            .record_schema
            .as_ref()
            .and_then(|rs| rs.kind_of(column))
    }

    fn single_pk(&self) -> Option<&ColumnInfo> {
        let pks = schema::pk_columns(&self.columns);
        match pks.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

impl SyncProvider {
    pub fn new(config: SyncConfiguration) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(ProviderState::default()),
            interrupt_handle: InterruptHandle::new(),
        })
    }

    /// A handle other threads can use to cancel whatever operation is
    /// currently running against this provider. Cancellation is observed
    /// between tables and between change items; the aborted transaction
    /// rolls back and the store is unchanged.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt_handle.clone()
    }

    /// Introspect the configured tables, install the change-log and the
    /// per-table triggers, and precompute the DML templates. Runs once;
    /// later calls (and the implicit calls from every operation) return the
    /// memoized result. Concurrent first callers collapse to one run.
    pub fn initialize(&self) -> Result<()> {
        self.ensure_initialized().map(|_| ())
    }

    /// Every row of every bidirectional table as an `Insert` item, plus the
    /// store's current version. Used once to seed a fresh peer.
    pub fn get_initial_set(&self) -> Result<ChangeSet> {
        let tables = self.ensure_initialized()?;
        let scope = self.interrupt_handle.begin_scope();
        let conn = self.open_connection()?;
        let tx = conn.unchecked_transaction()?;
        let mut items = Vec::new();
        for tracked in tables.iter().filter(|t| !t.is_pull_only()) {
            scope.err_if_interrupted()?;
            let mut stmt = tx.prepare(&tracked.templates.select_initial)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                items.push(ChangeItem {
                    table: tracked.qualified.clone(),
                    change_type: ChangeType::Insert,
                    values: row_values(row, tracked, 0)?,
                });
            }
        }
        let (max, _min) = version_bounds(&tx)?;
        tx.commit()?;
        log::debug!("initial set: {} items at version {}", items.len(), max);
        Ok(ChangeSet {
            anchor: Anchor::new(max),
            items,
        })
    }

    /// The rows that changed since `anchor`, one item per row, with several
    /// log entries for the same row collapsed into the strongest operation
    /// (any delete beats any insert, any insert beats any update). Returns
    /// the store's new version as the set's anchor.
    pub fn get_incremental_changes(&self, anchor: &Anchor) -> Result<ChangeSet> {
        if !anchor.is_compatible() {
            return Err(Error::IncompatibleAnchor(anchor.provider.clone()));
        }
        let tables = self.ensure_initialized()?;
        let scope = self.interrupt_handle.begin_scope();
        let conn = self.open_connection()?;
        let tx = conn.unchecked_transaction()?;
        let (max, min) = version_bounds(&tx)?;
        if anchor.version + 1 < min {
            return Err(Error::AnchorTooOld(anchor.version));
        }
        let mut items = Vec::new();
        for tracked in tables.iter().filter(|t| !t.is_pull_only()) {
            scope.err_if_interrupted()?;
            let mut stmt = tx.prepare(&tracked.templates.select_incremental)?;
            let mut rows = stmt.query(rusqlite::named_params! {
                ":last_sync_version": anchor.version as i64,
            })?;
            while let Some(row) = rows.next()? {
                scope.err_if_interrupted()?;
                if let Some(item) = incremental_item(row, tracked)? {
                    items.push(item);
                }
            }
        }
        tx.commit()?;
        log::debug!(
            "incremental changes since {}: {} items at version {}",
            anchor.version,
            items.len(),
            max
        );
        Ok(ChangeSet {
            anchor: Anchor::new(max),
            items,
        })
    }

    /// Replay a change set produced by another store, skipping conflicting
    /// updates and deletes. See [`SyncProvider::apply_changes_with_resolver`].
    pub fn apply_changes(&self, changes: &ChangeSet) -> Result<Anchor> {
        self.apply_changes_inner(changes, None)
    }

    /// Replay a change set, consulting `resolver` for each incoming update
    /// or delete whose target row has local history newer than
    /// `changes.anchor` - which must name the version of *this* store that
    /// the producing side last synchronized from.
    ///
    /// The whole set applies under one write transaction, so observers see
    /// all of it or none, and the returned anchor names exactly the state
    /// the call produced. A force-written update whose target row is gone
    /// locally resurrects the row with the incoming values.
    pub fn apply_changes_with_resolver(
        &self,
        changes: &ChangeSet,
        resolver: &dyn ConflictResolver,
    ) -> Result<Anchor> {
        self.apply_changes_inner(changes, Some(resolver))
    }

    fn apply_changes_inner(
        &self,
        changes: &ChangeSet,
        resolver: Option<&dyn ConflictResolver>,
    ) -> Result<Anchor> {
        if !changes.anchor.is_compatible() {
            return Err(Error::IncompatibleAnchor(changes.anchor.provider.clone()));
        }
        let tables = self.ensure_initialized()?;
        let scope = self.interrupt_handle.begin_scope();
        let conn = self.open_connection()?;
        let tx = conn.unchecked_transaction_imm()?;
        let (_max, min) = version_bounds(&tx)?;
        if changes.anchor.version + 1 < min {
            return Err(Error::AnchorTooOld(changes.anchor.version));
        }
        for item in &changes.items {
            scope.err_if_interrupted()?;
            let tracked = tables
                .iter()
                .find(|t| t.qualified.eq_ignore_ascii_case(&item.table))
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "change item references unconfigured table '{}'",
                        item.table
                    ))
                })?;
            apply_item(&tx, tracked, item, changes.anchor.version, resolver)?;
        }
        let (max, _min) = version_bounds(&tx)?;
        tx.commit()?;
        Ok(Anchor::new(max))
    }

    /// The store's current version, read under its own transaction.
    pub fn current_anchor(&self) -> Result<Anchor> {
        self.ensure_initialized()?;
        let conn = self.open_connection()?;
        let tx = conn.unchecked_transaction()?;
        let (max, _min) = version_bounds(&tx)?;
        tx.commit()?;
        Ok(Anchor::new(max))
    }

    /// Remove the change-tracking triggers and the sidecar tables,
    /// returning the store to its untracked state. Host rows are untouched.
    /// Any later operation on this provider reinstalls tracking from
    /// scratch, with a fresh change history.
    pub fn deprovision(&self) -> Result<()> {
        let mut state = self.state.lock();
        let conn = self.open_connection()?;
        let tx = conn.unchecked_transaction_imm()?;
        for table in &self.config.tables {
            for sql in schema::drop_trigger_sqls(table) {
                tx.execute(&sql, [])?;
            }
        }
        schema::drop_sidecar(&tx)?;
        tx.commit()?;
        state.tables = None;
        log::debug!("deprovisioned {} tables", self.config.tables.len());
        Ok(())
    }

    fn open_connection(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE;
        Ok(open_database_with_flags(
            &self.config.connection_string,
            flags,
            &SyncConnectionInitializer,
        )?)
    }

    fn ensure_initialized(&self) -> Result<Arc<Vec<TrackedTable>>> {
        // Holding the lock across the whole run is what collapses
        // concurrent first callers into one initialization.
        let mut state = self.state.lock();
        if let Some(tables) = &state.tables {
            return Ok(Arc::clone(tables));
        }
        let scope = self.interrupt_handle.begin_scope();
        let conn = self.open_connection()?;
        let tx = conn.unchecked_transaction_imm()?;
        let mut tracked = Vec::with_capacity(self.config.tables.len());
        for table in &self.config.tables {
            scope.err_if_interrupted()?;
            let columns = schema::fetch_columns(&tx, table)?;
            for sql in schema::create_trigger_sqls(table, &columns) {
                tx.execute(&sql, [])?;
            }
            let templates = build_templates(table, &columns)?;
            tracked.push(TrackedTable {
                qualified: table.qualified_name(),
                table: table.clone(),
                columns,
                templates,
            });
        }
        tx.commit()?;
        log::debug!("initialized change tracking for {} tables", tracked.len());
        let tables = Arc::new(tracked);
        state.tables = Some(Arc::clone(&tables));
        if is_memory_store(&self.config.connection_string) {
            state.memory_conn = Some(conn);
        }
        Ok(tables)
    }
}

/// The replay ladder for one item: run the template for the item's
/// operation; on zero affected rows either fail (insert collision),
/// consult the resolver and retry force-written, or - for a force-written
/// update whose row is gone - retry once more as an insert.
fn apply_item(
    tx: &UncheckedTransaction<'_>,
    tracked: &TrackedTable,
    item: &ChangeItem,
    base_version: u64,
    resolver: Option<&dyn ConflictResolver>,
) -> Result<()> {
    let mut op = item.change_type;
    let mut force_write = false;
    loop {
        let affected = execute_template(tx, tracked, op, item, base_version, force_write)?;
        if affected >= 1 {
            return Ok(());
        }
        match op {
            ChangeType::Insert => {
                // INSERT OR IGNORE matching nothing means a row with this
                // primary key already exists; there is no legitimate way to
                // proceed. Tell the caller where to re-sync from.
                let (max, _min) = version_bounds(tx)?;
                return Err(Error::InvalidSyncOperation {
                    candidate_anchor: Anchor::new(max + 1),
                });
            }
            ChangeType::Update | ChangeType::Delete if force_write => {
                if op == ChangeType::Delete {
                    // Already gone, which is what the caller wanted.
                    return Ok(());
                }
                // Force-written update against a locally deleted row:
                // resurrect it with the incoming values.
                log::debug!("resurrecting deleted row in {}", tracked.qualified);
                op = ChangeType::Insert;
            }
            ChangeType::Update | ChangeType::Delete => {
                let resolution = match resolver {
                    Some(resolver) => resolver.resolve(item),
                    None => ConflictResolution::Skip,
                };
                match resolution {
                    ConflictResolution::ForceWrite => force_write = true,
                    ConflictResolution::Skip => {
                        log::debug!(
                            "skipping conflicting {:?} on {}",
                            item.change_type,
                            tracked.qualified
                        );
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn execute_template(
    tx: &UncheckedTransaction<'_>,
    tracked: &TrackedTable,
    op: ChangeType,
    item: &ChangeItem,
    base_version: u64,
    force_write: bool,
) -> Result<usize> {
    let template = tracked.templates.for_op(op);
    let mut owned: Vec<(String, SqlValue)> = Vec::with_capacity(template.params.len());
    for param in &template.params {
        match param {
            TemplateParam::Column(name) => {
                let value = lookup_value(&item.values, name)
                    .map(json_to_sql)
                    .unwrap_or(SqlValue::Null);
                owned.push((templates::param_name(name), value));
            }
            TemplateParam::LastSyncVersion => owned.push((
                PARAM_LAST_SYNC_VERSION.to_string(),
                SqlValue::Integer(base_version as i64),
            )),
            TemplateParam::ForceWrite => owned.push((
                PARAM_SYNC_FORCE_WRITE.to_string(),
                SqlValue::Integer(force_write as i64),
            )),
        }
    }
    let params: Vec<(&str, &dyn ToSql)> = owned
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect();
    Ok(tx.execute_cached(&template.sql, params.as_slice())?)
}

fn lookup_value<'a>(values: &'a JsonMap, column: &str) -> Option<&'a JsonValue> {
    values.get(column).or_else(|| {
        values
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

fn row_values(row: &Row<'_>, tracked: &TrackedTable, offset: usize) -> Result<JsonMap> {
    let mut values = JsonMap::new();
    for (i, column) in tracked.columns.iter().enumerate() {
        let value = sql_to_json(row.get_ref(offset + i)?, tracked.kind_of(&column.name));
        values.insert(column.name.clone(), value);
    }
    Ok(values)
}

/// Turn one row of the incremental SELECT into a change item, or None for
/// the rows the extraction contract drops.
fn incremental_item(row: &Row<'_>, tracked: &TrackedTable) -> Result<Option<ChangeItem>> {
    let op: String = row.get(1)?;
    let change_type = match ChangeType::from_op_code(&op) {
        Some(change_type) => change_type,
        None => {
            log::warn!("ignoring change-log entry with unknown op '{}'", op);
            return Ok(None);
        }
    };
    let mut row_present = true;
    for (i, column) in tracked.columns.iter().enumerate() {
        if column.is_pk()
            && matches!(
                row.get_ref(INCREMENTAL_COLUMN_OFFSET + i)?,
                ValueRef::Null
            )
        {
            row_present = false;
            break;
        }
    }
    if row_present {
        return Ok(Some(ChangeItem {
            table: tracked.qualified.clone(),
            change_type,
            values: row_values(row, tracked, INCREMENTAL_COLUMN_OFFSET)?,
        }));
    }
    if change_type != ChangeType::Delete {
        // The row is gone but no delete was recorded; the table must have
        // been mutated outside the triggers. Nothing useful to report.
        log::warn!(
            "dropping change for vanished row in {} with no recorded delete",
            tracked.qualified
        );
        return Ok(None);
    }
    // Deleted rows exist only in the log; recover the key from the
    // fingerprint. Composite fingerprints have no separator and can't be
    // decoded.
    let fingerprint: String = row.get(0)?;
    let decoded = tracked
        .single_pk()
        .and_then(|pk| decode_fingerprint(&fingerprint, pk, tracked).map(|v| (pk, v)));
    match decoded {
        Some((pk, value)) => {
            let mut values = JsonMap::new();
            values.insert(pk.name.clone(), value);
            Ok(Some(ChangeItem {
                table: tracked.qualified.clone(),
                change_type,
                values,
            }))
        }
        None => {
            log::warn!(
                "dropping delete for {}: fingerprint '{}' is not decodable",
                tracked.qualified,
                fingerprint
            );
            Ok(None)
        }
    }
}

fn decode_fingerprint(
    fingerprint: &str,
    pk: &ColumnInfo,
    tracked: &TrackedTable,
) -> Option<JsonValue> {
    let native = if pk.is_integer() {
        JsonValue::from(fingerprint.parse::<i64>().ok()?)
    } else {
        JsonValue::from(fingerprint)
    };
    Some(match tracked.kind_of(&pk.name) {
        Some(kind) => crate::values::coerce(native, kind),
        None => native,
    })
}

fn version_bounds(conn: &Connection) -> Result<(u64, u64)> {
    let (max, min) = conn.query_row_and_then_cachable(
        VERSION_BOUNDS_SQL,
        [],
        |row| -> Result<(i64, i64)> { Ok((row.get(0)?, row.get(1)?)) },
        true,
    )?;
    Ok((max as u64, min as u64))
}

fn is_memory_store(connection_string: &str) -> bool {
    connection_string == ":memory:" || connection_string.contains("mode=memory")
}
