/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! End-to-end synchronization between two real stores on disk.

use rusqlite::Connection;
use serde_json::json;
use tablesync::{
    Anchor, ChangeItem, ChangeSet, ChangeType, ConflictResolution, Error, SyncConfiguration,
    SyncProvider, SyncTable,
};
use tempfile::TempDir;

fn open_store(dir: &TempDir, name: &str) -> (SyncProvider, String) {
    let _ = env_logger::try_init();
    let path = dir.path().join(name).to_str().unwrap().to_string();
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Users (
            Id INTEGER PRIMARY KEY,
            Email TEXT,
            Name TEXT,
            Created TEXT
        )",
    )
    .unwrap();
    let provider = SyncProvider::new(
        SyncConfiguration::new(path.clone()).table(SyncTable::new("Users")),
    )
    .unwrap();
    provider.initialize().unwrap();
    (provider, path)
}

fn raw(path: &str) -> Connection {
    Connection::open(path).unwrap()
}

/// Re-tag a set with the base version for the store it's about to be
/// applied to; that's the transport layer's job, done inline here.
fn rebased(set: &ChangeSet, version: u64) -> ChangeSet {
    ChangeSet {
        anchor: Anchor::new(version),
        items: set.items.clone(),
    }
}

fn force_write(_: &ChangeItem) -> ConflictResolution {
    ConflictResolution::ForceWrite
}

fn user_name(path: &str) -> String {
    raw(path)
        .query_row("SELECT Name FROM Users WHERE Id = 1", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn test_paired_sync_walkthrough() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, remote_path) = open_store(&dir, "remote.db");
    let (local, local_path) = open_store(&dir, "local.db");

    // A fresh store has nothing to hand out.
    let initial = remote.get_initial_set().unwrap();
    assert!(initial.items.is_empty());
    assert_eq!(initial.anchor.version, 0);

    // First write on the remote.
    raw(&remote_path)
        .execute(
            "INSERT INTO Users (Id, Email, Name, Created)
             VALUES (1, 'a@b', 'U1', '2020-01-01')",
            [],
        )
        .unwrap();
    let changes = remote.get_incremental_changes(&Anchor::zero()).unwrap();
    assert_eq!(changes.items.len(), 1);
    assert_eq!(changes.items[0].change_type, ChangeType::Insert);
    assert_eq!(changes.items[0].values["Email"], json!("a@b"));
    assert_eq!(changes.anchor.version, 1);

    // Replay on the local store. Re-applying the same set collides on the
    // primary key and names the version to re-sync from.
    let anchor = local.apply_changes(&rebased(&changes, 0)).unwrap();
    assert_eq!(anchor.version, 1);
    match local.apply_changes(&rebased(&changes, 0)) {
        Err(Error::InvalidSyncOperation { candidate_anchor }) => {
            assert_eq!(candidate_anchor.version, 2)
        }
        other => panic!("expected InvalidSyncOperation, got {:?}", other.map(|a| a.version)),
    }

    // A remote edit; extraction from scratch carries the new value.
    raw(&remote_path)
        .execute("UPDATE Users SET Created = '2018-01-01' WHERE Id = 1", [])
        .unwrap();
    let changes = remote.get_incremental_changes(&Anchor::zero()).unwrap();
    assert_eq!(changes.items.len(), 1);
    assert_eq!(changes.items[0].values["Created"], json!("2018-01-01"));
    assert_eq!(changes.anchor.version, 2);

    // The same row edited locally. The remote's history is newer than the
    // base version, so without a resolver the incoming update is skipped:
    // no rows are written, no triggers fire, the anchor stays put.
    raw(&local_path)
        .execute("UPDATE Users SET Name = 'modified' WHERE Id = 1", [])
        .unwrap();
    let local_changes = local.get_incremental_changes(&Anchor::new(1)).unwrap();
    assert_eq!(local_changes.items.len(), 1);
    assert_eq!(local_changes.items[0].change_type, ChangeType::Update);
    let to_remote = rebased(&local_changes, 1);
    let anchor = remote.apply_changes(&to_remote).unwrap();
    assert_eq!(anchor.version, 2);
    assert_eq!(user_name(&remote_path), "U1");

    // Forcing it through wins.
    let anchor = remote
        .apply_changes_with_resolver(&to_remote, &force_write)
        .unwrap();
    assert_eq!(anchor.version, 3);
    assert_eq!(user_name(&remote_path), "modified");

    // Delete the row remotely, then force the local update once more: the
    // update finds nothing to write and comes back as an insert.
    raw(&remote_path)
        .execute("DELETE FROM Users WHERE Id = 1", [])
        .unwrap();
    assert_eq!(remote.current_anchor().unwrap().version, 4);
    let anchor = remote
        .apply_changes_with_resolver(&to_remote, &force_write)
        .unwrap();
    assert_eq!(anchor.version, 5);
    let (email, name): (String, String) = raw(&remote_path)
        .query_row("SELECT Email, Name FROM Users WHERE Id = 1", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(email, "a@b");
    assert_eq!(name, "modified");
}

#[test]
fn test_anchor_monotonicity() {
    let dir = tempfile::tempdir().unwrap();
    let (provider, path) = open_store(&dir, "mono.db");
    let conn = raw(&path);
    let mut last = provider.current_anchor().unwrap();
    for i in 0..5 {
        conn.execute("INSERT INTO Users (Id, Email) VALUES (?, 'x@y')", [i])
            .unwrap();
        let changes = provider.get_incremental_changes(&last).unwrap();
        assert_eq!(changes.items.len(), 1);
        assert!(changes.anchor > last);
        last = changes.anchor;
    }
}

#[test]
fn test_operations_are_idempotent_without_writes() {
    let dir = tempfile::tempdir().unwrap();
    let (provider, path) = open_store(&dir, "idem.db");
    raw(&path)
        .execute("INSERT INTO Users (Id, Email) VALUES (1, 'a@b')", [])
        .unwrap();
    assert_eq!(
        provider.get_initial_set().unwrap(),
        provider.get_initial_set().unwrap()
    );
    assert_eq!(
        provider.get_incremental_changes(&Anchor::zero()).unwrap(),
        provider.get_incremental_changes(&Anchor::zero()).unwrap()
    );
    assert_eq!(
        provider.current_anchor().unwrap(),
        provider.current_anchor().unwrap()
    );
}

#[test]
fn test_initial_set_covers_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (provider, path) = open_store(&dir, "seedsrc.db");
    let conn = raw(&path);
    for (id, email) in [(1, "a@b"), (2, "c@d"), (3, "e@f")] {
        conn.execute(
            "INSERT INTO Users (Id, Email) VALUES (?, ?)",
            rusqlite::params![id, email],
        )
        .unwrap();
    }
    let initial = provider.get_initial_set().unwrap();
    assert_eq!(initial.items.len(), 3);
    for (item, (id, email)) in initial.items.iter().zip([(1, "a@b"), (2, "c@d"), (3, "e@f")]) {
        assert_eq!(item.change_type, ChangeType::Insert);
        assert_eq!(item.table, "main.Users");
        assert_eq!(item.values["Id"], json!(id));
        assert_eq!(item.values["Email"], json!(email));
        assert_eq!(item.values["Name"], serde_json::Value::Null);
    }
}

#[test]
fn test_no_change_null_diff() {
    let dir = tempfile::tempdir().unwrap();
    let (provider, path) = open_store(&dir, "nulldiff.db");
    raw(&path)
        .execute("INSERT INTO Users (Id) VALUES (1)", [])
        .unwrap();
    let current = provider.current_anchor().unwrap();
    let changes = provider.get_incremental_changes(&current).unwrap();
    assert!(changes.items.is_empty());
    assert_eq!(changes.anchor, current);
}

#[test]
fn test_round_trip_initial_seed() {
    let dir = tempfile::tempdir().unwrap();
    let (a, a_path) = open_store(&dir, "a.db");
    let (b, _b_path) = open_store(&dir, "b.db");
    let conn = raw(&a_path);
    conn.execute("INSERT INTO Users (Id, Email) VALUES (1, 'a@b')", [])
        .unwrap();
    conn.execute("INSERT INTO Users (Id, Email) VALUES (2, 'c@d')", [])
        .unwrap();
    let seed = a.get_initial_set().unwrap();
    let b_anchor = b.apply_changes(&seed).unwrap();
    // After seeding, asking the source "what changed since the seed" from
    // the target's point of view must come back empty.
    let diff = a.get_incremental_changes(&b_anchor).unwrap();
    assert!(diff.items.is_empty());
}

#[test]
fn test_force_write_applies_conflicting_delete() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, remote_path) = open_store(&dir, "fdel_r.db");
    let (local, local_path) = open_store(&dir, "fdel_l.db");
    raw(&remote_path)
        .execute("INSERT INTO Users (Id, Email) VALUES (1, 'a@b')", [])
        .unwrap();
    let seed = remote.get_incremental_changes(&Anchor::zero()).unwrap();
    local.apply_changes(&rebased(&seed, 0)).unwrap();

    // Both sides touch the row: local edits, remote deletes.
    raw(&local_path)
        .execute("UPDATE Users SET Email = 'edited@b' WHERE Id = 1", [])
        .unwrap();
    raw(&remote_path)
        .execute("DELETE FROM Users WHERE Id = 1", [])
        .unwrap();
    let deletes = remote.get_incremental_changes(&Anchor::new(1)).unwrap();
    assert_eq!(deletes.items.len(), 1);
    assert_eq!(deletes.items[0].change_type, ChangeType::Delete);

    // Local history is newer than the base, so by default nothing happens.
    let before = local.current_anchor().unwrap();
    let anchor = local.apply_changes(&rebased(&deletes, 1)).unwrap();
    assert_eq!(anchor, before);
    assert_eq!(
        raw(&local_path)
            .query_row("SELECT COUNT(*) FROM Users", [], |r| r.get::<_, i64>(0))
            .unwrap(),
        1
    );

    // Forced, the delete lands and the anchor advances.
    let anchor = local
        .apply_changes_with_resolver(&rebased(&deletes, 1), &force_write)
        .unwrap();
    assert!(anchor > before);
    assert_eq!(
        raw(&local_path)
            .query_row("SELECT COUNT(*) FROM Users", [], |r| r.get::<_, i64>(0))
            .unwrap(),
        0
    );
}

#[test]
fn test_delete_propagates_between_stores() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, remote_path) = open_store(&dir, "dprop_r.db");
    let (local, local_path) = open_store(&dir, "dprop_l.db");
    raw(&remote_path)
        .execute("INSERT INTO Users (Id, Email) VALUES (1, 'a@b')", [])
        .unwrap();
    let seed = remote.get_incremental_changes(&Anchor::zero()).unwrap();
    let local_version = local.apply_changes(&rebased(&seed, 0)).unwrap();

    raw(&remote_path)
        .execute("DELETE FROM Users WHERE Id = 1", [])
        .unwrap();
    let deletes = remote.get_incremental_changes(&seed.anchor).unwrap();
    assert_eq!(deletes.items.len(), 1);
    assert_eq!(deletes.items[0].change_type, ChangeType::Delete);
    assert_eq!(deletes.items[0].values["Id"], json!(1));

    // The local store saw no further edits, so the delete applies cleanly.
    let anchor = local
        .apply_changes(&rebased(&deletes, local_version.version))
        .unwrap();
    assert!(anchor > local_version);
    assert_eq!(
        raw(&local_path)
            .query_row("SELECT COUNT(*) FROM Users", [], |r| r.get::<_, i64>(0))
            .unwrap(),
        0
    );
}

#[test]
fn test_change_sets_survive_serialization() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, remote_path) = open_store(&dir, "wire_r.db");
    let (local, _) = open_store(&dir, "wire_l.db");
    raw(&remote_path)
        .execute(
            "INSERT INTO Users (Id, Email, Name) VALUES (1, 'a@b', NULL)",
            [],
        )
        .unwrap();
    let changes = remote.get_incremental_changes(&Anchor::zero()).unwrap();

    // Simulate transport: serialize on one side, deserialize on the other.
    let wire = serde_json::to_vec(&rebased(&changes, 0)).unwrap();
    let received: ChangeSet = serde_json::from_slice(&wire).unwrap();
    let anchor = local.apply_changes(&received).unwrap();
    assert_eq!(anchor.version, 1);
}
