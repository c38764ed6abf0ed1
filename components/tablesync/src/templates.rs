/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Parameterized DML for applying changes and the SELECTs used by the two
//! extractors, precomputed per table at initialization.
//!
//! The conflict check lives inside the WHERE clause of the update and
//! delete statements, so detection and mutation are a single atomic
//! statement - there is no read-then-write race to lose.

use crate::config::SyncTable;
use crate::error::{Error, Result};
use crate::schema::{fingerprint_expr, pk_columns, quote_ident, ColumnInfo, CHANGE_LOG_TABLE};
use crate::types::ChangeType;

pub(crate) const PARAM_LAST_SYNC_VERSION: &str = ":last_sync_version";
pub(crate) const PARAM_SYNC_FORCE_WRITE: &str = ":sync_force_write";

/// A parameter slot of a precomputed statement, in binding order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TemplateParam {
    /// Bound from the change item's value for this (unnormalized) column
    /// name; absent columns bind NULL.
    Column(String),
    /// The caller's base version.
    LastSyncVersion,
    /// Boolean override of the conflict check.
    ForceWrite,
}

#[derive(Clone, Debug)]
pub(crate) struct SqlTemplate {
    pub sql: String,
    pub params: Vec<TemplateParam>,
}

#[derive(Clone, Debug)]
pub(crate) struct TableTemplates {
    pub insert: SqlTemplate,
    pub update: SqlTemplate,
    pub delete: SqlTemplate,
    pub select_incremental: String,
    pub select_initial: String,
}

impl TableTemplates {
    pub fn for_op(&self, op: ChangeType) -> &SqlTemplate {
        match op {
            ChangeType::Insert => &self.insert,
            ChangeType::Update => &self.update,
            ChangeType::Delete => &self.delete,
        }
    }
}

/// Spaces in column names are normalized to underscores in the parameter
/// name, but not in the SQL identifier.
pub(crate) fn param_name(column: &str) -> String {
    format!(":{}", column.replace(' ', "_"))
}

pub(crate) fn build_templates(table: &SyncTable, columns: &[ColumnInfo]) -> Result<TableTemplates> {
    for column in columns {
        let param = param_name(&column.name);
        if param == PARAM_LAST_SYNC_VERSION || param == PARAM_SYNC_FORCE_WRITE {
            return Err(Error::Configuration(format!(
                "column '{}' of '{}' collides with a reserved parameter name",
                column.name,
                table.qualified_name()
            )));
        }
    }

    let target = format!(
        "{}.{}",
        quote_ident(&table.schema),
        quote_ident(&table.name)
    );
    let qualified = table.qualified_name();
    let log = quote_ident(CHANGE_LOG_TABLE);
    let pks = pk_columns(columns);
    let non_pks: Vec<&ColumnInfo> = columns.iter().filter(|c| !c.is_pk()).collect();

    let column_list = join_mapped(columns.iter(), |c| quote_ident(&c.name));
    let value_list = join_mapped(columns.iter(), |c| param_name(&c.name));
    let insert = SqlTemplate {
        sql: format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            target, column_list, value_list
        ),
        params: columns
            .iter()
            .map(|c| TemplateParam::Column(c.name.clone()))
            .collect(),
    };

    // Admit the write only when the caller has seen every local change for
    // this row, unless explicitly overridden.
    let conflict_guard = format!(
        "({force} = 1 OR NOT EXISTS (SELECT 1 FROM {log} AS CT \
         WHERE CT.TBL = '{qualified}' AND CT.PK = {fingerprint} \
         AND CT.ID > {version}))",
        force = PARAM_SYNC_FORCE_WRITE,
        log = log,
        qualified = qualified,
        fingerprint = fingerprint_expr(columns, &quote_ident(&table.name)),
        version = PARAM_LAST_SYNC_VERSION,
    );
    let pk_match = pks
        .iter()
        .map(|c| format!("{} = {}", quote_ident(&c.name), param_name(&c.name)))
        .collect::<Vec<_>>()
        .join(" AND ");

    // A table whose every column is part of the key has nothing to update;
    // assigning the key columns to themselves keeps the statement
    // well-formed.
    let set_columns: &[&ColumnInfo] = if non_pks.is_empty() { &pks } else { &non_pks };
    let set_list = join_mapped(set_columns.iter().copied(), |c| {
        format!("{} = {}", quote_ident(&c.name), param_name(&c.name))
    });
    let update = SqlTemplate {
        sql: format!(
            "UPDATE {} SET {} WHERE {} AND {}",
            target, set_list, pk_match, conflict_guard
        ),
        params: dml_params(set_columns.iter().copied().chain(pks.iter().copied())),
    };

    let delete = SqlTemplate {
        sql: format!("DELETE FROM {} WHERE {} AND {}", target, pk_match, conflict_guard),
        params: dml_params(pks.iter().copied()),
    };

    let select_incremental = format!(
        "SELECT CT.PK, MIN(CT.OP), {columns} \
         FROM {log} AS CT \
         LEFT JOIN {target} AS T ON CT.PK = {fingerprint} \
         WHERE CT.TBL = '{qualified}' AND CT.ID > {version} \
         GROUP BY CT.PK \
         ORDER BY MIN(CT.ID)",
        columns = join_mapped(columns.iter(), |c| format!("T.{}", quote_ident(&c.name))),
        log = log,
        target = target,
        fingerprint = fingerprint_expr(columns, "T"),
        qualified = qualified,
        version = PARAM_LAST_SYNC_VERSION,
    );

    let select_initial = format!(
        "SELECT {} FROM {} ORDER BY {}",
        column_list,
        target,
        join_mapped(pks.iter().copied(), |c| quote_ident(&c.name)),
    );

    Ok(TableTemplates {
        insert,
        update,
        delete,
        select_incremental,
        select_initial,
    })
}

/// Column params (deduplicated - the all-key update lists each key column
/// in both SET and WHERE) followed by the two reserved params every
/// update/delete needs.
fn dml_params<'a>(columns: impl Iterator<Item = &'a ColumnInfo>) -> Vec<TemplateParam> {
    let mut params: Vec<TemplateParam> = Vec::new();
    for column in columns {
        let param = TemplateParam::Column(column.name.clone());
        if !params.contains(&param) {
            params.push(param);
        }
    }
    params.push(TemplateParam::ForceWrite);
    params.push(TemplateParam::LastSyncVersion);
    params
}

fn join_mapped<'a, I, F>(items: I, f: F) -> String
where
    I: Iterator<Item = &'a ColumnInfo>,
    F: FnMut(&'a ColumnInfo) -> String,
{
    items.map(f).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::test_support::{tracked_users_db, users_table};
    use crate::schema::fetch_columns;

    fn users_templates() -> TableTemplates {
        let conn = tracked_users_db();
        let columns = fetch_columns(&conn, &users_table()).unwrap();
        build_templates(&users_table(), &columns).unwrap()
    }

    #[test]
    fn test_insert_template() {
        let templates = users_templates();
        assert_eq!(
            templates.insert.sql,
            "INSERT OR IGNORE INTO [main].[Users] ([Id], [Email], [Name], [Created]) \
             VALUES (:Id, :Email, :Name, :Created)"
        );
        assert_eq!(templates.insert.params.len(), 4);
    }

    #[test]
    fn test_update_template_shape() {
        let templates = users_templates();
        let sql = &templates.update.sql;
        assert!(sql.starts_with(
            "UPDATE [main].[Users] SET [Email] = :Email, [Name] = :Name, [Created] = :Created \
             WHERE [Id] = :Id AND (:sync_force_write = 1 OR NOT EXISTS"
        ));
        assert!(sql.contains("CT.TBL = 'main.Users'"));
        assert!(sql.contains("CT.PK = printf('%d', [Users].[Id])"));
        assert!(sql.contains("CT.ID > :last_sync_version"));
        assert_eq!(
            templates.update.params.last(),
            Some(&TemplateParam::LastSyncVersion)
        );
    }

    #[test]
    fn test_delete_template_binds_only_keys() {
        let templates = users_templates();
        assert_eq!(
            templates.delete.params,
            vec![
                TemplateParam::Column("Id".to_string()),
                TemplateParam::ForceWrite,
                TemplateParam::LastSyncVersion,
            ]
        );
    }

    #[test]
    fn test_all_statements_prepare() {
        let conn = tracked_users_db();
        let templates = users_templates();
        for sql in [
            &templates.insert.sql,
            &templates.update.sql,
            &templates.delete.sql,
            &templates.select_incremental,
            &templates.select_initial,
        ] {
            conn.prepare(sql)
                .unwrap_or_else(|e| panic!("{} failed to prepare: {}", sql, e));
        }
    }

    #[test]
    fn test_space_in_column_name_normalizes_param_only() {
        assert_eq!(param_name("Full Name"), ":Full_Name");
        let conn = tracked_users_db();
        conn.execute_batch(
            "CREATE TABLE Spaced (Id INTEGER PRIMARY KEY, [Full Name] TEXT)",
        )
        .unwrap();
        let table = crate::config::SyncTable::new("Spaced");
        let columns = fetch_columns(&conn, &table).unwrap();
        let templates = build_templates(&table, &columns).unwrap();
        assert!(templates.insert.sql.contains("[Full Name]"));
        assert!(templates.insert.sql.contains(":Full_Name"));
        conn.prepare(&templates.update.sql).unwrap();
    }

    #[test]
    fn test_all_key_table_update_stays_well_formed() {
        let conn = tracked_users_db();
        conn.execute_batch(
            "CREATE TABLE Tags (UserId INTEGER, Tag TEXT, PRIMARY KEY (UserId, Tag))",
        )
        .unwrap();
        let table = crate::config::SyncTable::new("Tags");
        let columns = fetch_columns(&conn, &table).unwrap();
        let templates = build_templates(&table, &columns).unwrap();
        assert!(templates
            .update
            .sql
            .starts_with("UPDATE [main].[Tags] SET [UserId] = :UserId, [Tag] = :Tag WHERE"));
        // Each key column binds once despite appearing in SET and WHERE.
        assert_eq!(
            templates.update.params,
            vec![
                TemplateParam::Column("UserId".to_string()),
                TemplateParam::Column("Tag".to_string()),
                TemplateParam::ForceWrite,
                TemplateParam::LastSyncVersion,
            ]
        );
        conn.prepare(&templates.update.sql).unwrap();
    }

    #[test]
    fn test_reserved_parameter_collision_rejected() {
        let conn = tracked_users_db();
        conn.execute_batch(
            "CREATE TABLE Clash (Id INTEGER PRIMARY KEY, [sync force write] TEXT)",
        )
        .unwrap();
        let table = crate::config::SyncTable::new("Clash");
        let columns = fetch_columns(&conn, &table).unwrap();
        assert!(matches!(
            build_templates(&table, &columns),
            Err(Error::Configuration(_))
        ));
    }
}
