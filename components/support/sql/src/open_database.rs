/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Use this module to open a SQLite database connection and bring the
//! sidecar schema a crate maintains inside that database up to date.
//!
//! The code handles some common cases:
//!
//!   - First open against a database that has never carried the sidecar:
//!     initialize it to the current schema.
//!
//!   - Opening a database with an older sidecar: run a series of upgrade
//!     functions to migrate it to the current schema.
//!
//! The sidecar usually lives inside a database owned by the host
//! application, so the schema version is kept in a meta table named by the
//! initializer rather than in `PRAGMA user_version` - the host owns that
//! pragma.

use crate::ConnExt;
use rusqlite::{Connection, OpenFlags, Transaction};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The database schema version is newer than the code can handle, or an
    /// upgrade function was asked to handle a version it doesn't know.
    #[error("Incompatible database version: {0}")]
    IncompatibleVersion(u32),
    /// Something went wrong during initialization or an upgrade. Initializers
    /// can return this to signal the sidecar is beyond repair.
    #[error("Migration error: {0}")]
    MigrationError(String),
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Implement this to tell `open_database` how to create and upgrade the
/// schema your crate keeps in the opened database.
pub trait ConnectionInitializer {
    // Name to display in the logs.
    const NAME: &'static str;

    // The version that the last upgrade function upgrades to.
    const END_VERSION: u32;

    // The meta table carrying the schema version, as a
    // `(key TEXT PRIMARY KEY, value NOT NULL)` shape. `init` must create
    // it. It doubles as the existence marker for the sidecar.
    const META_TABLE: &'static str;

    // Runs immediately after the connection opens, before the version
    // check. Use it for pragmas and other connection-level setup.
    fn prepare(&self, _conn: &Connection, _sidecar_absent: bool) -> Result<()> {
        Ok(())
    }

    // Initialize a database that has never carried the sidecar, bringing
    // it directly to `END_VERSION`.
    fn init(&self, tx: &Transaction<'_>) -> Result<()>;

    // Upgrade from `version` to `version + 1`.
    fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> Result<()>;

    // Runs inside the same transaction, after init/upgrades.
    fn finish(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

pub fn open_database<CI: ConnectionInitializer>(
    path: impl AsRef<Path>,
    initializer: &CI,
) -> Result<Connection> {
    open_database_with_flags(path, OpenFlags::default(), initializer)
}

pub fn open_database_with_flags<CI: ConnectionInitializer>(
    path: impl AsRef<Path>,
    open_flags: OpenFlags,
    initializer: &CI,
) -> Result<Connection> {
    let mut conn = Connection::open_with_flags(path, open_flags)?;
    init_connection(&mut conn, initializer)?;
    Ok(conn)
}

pub fn open_memory_database<CI: ConnectionInitializer>(initializer: &CI) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    init_connection(&mut conn, initializer)?;
    Ok(conn)
}

fn init_connection<CI: ConnectionInitializer>(
    conn: &mut Connection,
    initializer: &CI,
) -> Result<()> {
    log::debug!("{}: opening database", CI::NAME);
    let mut current_version = get_schema_version(conn, CI::META_TABLE)?;
    initializer.prepare(conn, current_version == 0)?;
    let tx = conn.transaction()?;
    if current_version == 0 {
        log::debug!("{}: initializing new sidecar schema", CI::NAME);
        initializer.init(&tx)?;
    } else {
        if current_version > CI::END_VERSION {
            return Err(Error::IncompatibleVersion(current_version));
        }
        while current_version < CI::END_VERSION {
            log::debug!(
                "{}: upgrading sidecar schema from {}",
                CI::NAME,
                current_version
            );
            initializer.upgrade_from(&tx, current_version)?;
            current_version += 1;
        }
    }
    set_schema_version(&tx, CI::META_TABLE, CI::END_VERSION)?;
    initializer.finish(&tx)?;
    tx.commit()?;
    log::debug!("{}: database open successful", CI::NAME);
    Ok(())
}

fn get_schema_version(conn: &Connection, meta_table: &str) -> Result<u32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        [meta_table],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }
    let version: Option<u32> = conn.try_query_one(
        &format!(
            "SELECT value FROM [{}] WHERE key = 'schema_version'",
            meta_table
        ),
        &[],
        false,
    )?;
    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, meta_table: &str, version: u32) -> Result<()> {
    conn.execute(
        &format!(
            "REPLACE INTO [{}] (key, value) VALUES ('schema_version', ?)",
            meta_table
        ),
        [version],
    )?;
    Ok(())
}

// It would be nice for this to be #[cfg(test)], but that doesn't allow it to
// be used in tests for our other crates.
pub mod test_utils {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A database file seeded with an old sidecar schema, for exercising
    /// upgrades the way they run in the real world: against a freshly
    /// opened connection.
    pub struct MigratedDatabaseFile {
        // Keep around a TempDir to ensure the database file stays around
        // until this struct is dropped.
        _tempdir: TempDir,
        pub path: PathBuf,
    }

    impl MigratedDatabaseFile {
        pub fn new(initial_schema_sql: &str) -> Self {
            let tempdir = tempfile::tempdir().unwrap();
            let path = tempdir.path().join("db.sql");
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(initial_schema_sql).unwrap();
            Self {
                _tempdir: tempdir,
                path,
            }
        }

        pub fn open(&self) -> Connection {
            Connection::open(&self.path).unwrap()
        }
    }
}
