/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Single-replica behavior: installation, change capture, version and seq
//! bookkeeping, schema evolution.

mod common;

use common::*;
use rusqlite::types::Value;

#[test]
fn test_insert_creates_clock_row() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();

    assert_eq!(
        clock_dump(&conn, "kv"),
        vec![("1".to_string(), "v".to_string(), 1, 1, None, 0)]
    );
    assert_eq!(db_version(&conn), 1);

    let changes = pull_changes(&conn, 0, None);
    assert_eq!(changes.len(), 1);
    let change = &changes[0];
    assert_eq!(change.0, "kv");
    assert_eq!(change.1, "1");
    assert_eq!(change.2, "v");
    assert_eq!(change.3, Value::Text("a".to_string()));
    assert_eq!((change.4, change.5, change.7), (1, 1, 0));
}

#[test]
fn test_update_bumps_versions() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();
    conn.execute("UPDATE kv SET v = 'b' WHERE id = 1", [])
        .unwrap();

    assert_eq!(
        clock_dump(&conn, "kv"),
        vec![("1".to_string(), "v".to_string(), 2, 2, None, 0)]
    );
    assert_eq!(db_version(&conn), 2);

    let changes = pull_changes(&conn, 0, None);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].3, Value::Text("b".to_string()));
    assert_eq!((changes[0].4, changes[0].5, changes[0].7), (2, 2, 0));
}

// An UPDATE that sets a column to its existing value produces no new
// clock entry.
#[test]
fn test_no_change_no_delta() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();
    let before = clock_dump(&conn, "kv");
    conn.execute("UPDATE kv SET v = 'a' WHERE id = 1", [])
        .unwrap();
    assert_eq!(clock_dump(&conn, "kv"), before);
    assert_eq!(db_version(&conn), 1);
}

#[test]
fn test_as_crr_is_idempotent() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();
    conn.query_row("SELECT crsql_as_crr('kv')", [], |_| Ok(()))
        .unwrap();
    // no double-backfill, no extra rows
    assert_eq!(clock_dump(&conn, "kv").len(), 1);
}

#[test]
fn test_as_crr_backfills_existing_rows() {
    let conn = new_db();
    conn.execute_batch(
        "CREATE TABLE kv (id INTEGER PRIMARY KEY, v TEXT);
         INSERT INTO kv VALUES (1, 'a'), (2, NULL), (3, 'c');",
    )
    .unwrap();
    conn.query_row("SELECT crsql_as_crr('kv')", [], |_| Ok(()))
        .unwrap();

    let clock = clock_dump(&conn, "kv");
    let cids: Vec<(String, String)> = clock
        .iter()
        .map(|row| (row.0.clone(), row.1.clone()))
        .collect();
    assert_eq!(
        cids,
        vec![
            ("1".to_string(), "v".to_string()),
            ("2".to_string(), "__crsql_pko".to_string()),
            ("3".to_string(), "v".to_string()),
        ]
    );
    // distinct seq per backfilled write, one shared db_version
    assert_eq!(clock.iter().map(|r| r.3).collect::<Vec<_>>(), vec![1, 1, 1]);
    let mut seqs: Vec<i64> = clock.iter().map(|r| r.5).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[test]
fn test_as_crr_rejects_incompatible_tables() {
    let conn = new_db();
    conn.execute_batch("CREATE TABLE nopk (x, y)").unwrap();
    assert!(conn
        .query_row("SELECT crsql_as_crr('nopk')", [], |_| Ok(()))
        .is_err());
    assert!(conn
        .query_row("SELECT crsql_as_crr('missing')", [], |_| Ok(()))
        .is_err());
    // nothing was left behind
    let leftovers: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE name LIKE '%__crsql_clock'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_delete_writes_sentinel_and_drops_history() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (2, 'x')", [])
        .unwrap();
    conn.execute("DELETE FROM kv WHERE id = 2", []).unwrap();

    let changes = pull_changes(&conn, 0, None);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].1, "2");
    assert_eq!(changes[0].2, "__crsql_del");
    assert_eq!(changes[0].3, Value::Null);
}

// A row with no non-pk data is represented by the pk-only sentinel.
#[test]
fn test_pk_only_row() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id) VALUES (3)", []).unwrap();
    let changes = pull_changes(&conn, 0, None);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].2, "__crsql_pko");
    assert_eq!(changes[0].3, Value::Null);
}

// seq restarts at 0 after both commit and rollback.
#[test]
fn test_seq_resets_on_txn_end() {
    let mut conn = new_kv_db();

    let tx = conn.transaction().unwrap();
    tx.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();
    tx.execute("INSERT INTO kv (id, v) VALUES (2, 'b')", [])
        .unwrap();
    let seq: i64 = tx
        .query_row("SELECT crsql_get_seq()", [], |row| row.get(0))
        .unwrap();
    assert!(seq > 0);
    tx.commit().unwrap();
    let seq: i64 = conn
        .query_row("SELECT crsql_get_seq()", [], |row| row.get(0))
        .unwrap();
    assert_eq!(seq, 0);

    let tx = conn.transaction().unwrap();
    tx.execute("INSERT INTO kv (id, v) VALUES (9, 'z')", [])
        .unwrap();
    drop(tx); // rollback
    let seq: i64 = conn
        .query_row("SELECT crsql_get_seq()", [], |row| row.get(0))
        .unwrap();
    assert_eq!(seq, 0);
}

// Changes stream in strictly increasing (db_version, seq) order.
#[test]
fn test_delta_ordering() {
    let mut conn = new_kv_db();
    let tx = conn.transaction().unwrap();
    tx.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();
    tx.execute("INSERT INTO kv (id, v) VALUES (2, 'b')", [])
        .unwrap();
    tx.commit().unwrap();
    conn.execute("INSERT INTO kv (id, v) VALUES (3, 'c')", [])
        .unwrap();

    let changes = pull_changes(&conn, 0, None);
    assert_eq!(changes.len(), 3);
    let mut last = (i64::MIN, i64::MIN);
    for change in &changes {
        let cur = (change.5, change.7);
        assert!(cur > last, "expected strictly increasing order: {:?}", cur);
        last = cur;
    }
    // all writes of one transaction share a db_version
    assert_eq!(changes[0].5, changes[1].5);
}

#[test]
fn test_all_txn_writes_share_next_db_version() {
    let mut conn = new_kv_db();
    let tx = conn.transaction().unwrap();
    for i in 0..3 {
        tx.execute("INSERT INTO kv (id, v) VALUES (?, 'x')", [i])
            .unwrap();
        let next: i64 = tx
            .query_row("SELECT crsql_nextdbversion()", [], |row| row.get(0))
            .unwrap();
        assert_eq!(next, 1);
    }
    tx.commit().unwrap();
    assert_eq!(db_version(&conn), 1);
}

// begin_alter/commit_alter with an unchanged pk set keeps existing clocks
// and captures writes to the new column.
#[test]
fn test_alter_keeps_history_for_same_pks() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();

    conn.query_row("SELECT crsql_begin_alter('kv')", [], |_| Ok(()))
        .unwrap();
    conn.execute_batch("ALTER TABLE kv ADD COLUMN w TEXT").unwrap();
    conn.query_row("SELECT crsql_commit_alter('kv')", [], |_| Ok(()))
        .unwrap();

    // old clock entry retained
    let clock = clock_dump(&conn, "kv");
    assert!(clock
        .iter()
        .any(|row| row.1 == "v" && row.2 == 1 && row.3 == 1));

    conn.execute("UPDATE kv SET w = 'q' WHERE id = 1", [])
        .unwrap();
    let changes = pull_changes(&conn, 1, None);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].2, "w");
    assert_eq!(changes[0].3, Value::Text("q".to_string()));
}

// Dropping a column compacts its clock entries away.
#[test]
fn test_alter_compacts_dropped_columns() {
    let conn = new_db();
    conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, a TEXT, b TEXT)")
        .unwrap();
    conn.query_row("SELECT crsql_as_crr('t')", [], |_| Ok(()))
        .unwrap();
    conn.execute("INSERT INTO t VALUES (1, 'x', 'y')", [])
        .unwrap();

    conn.query_row("SELECT crsql_begin_alter('t')", [], |_| Ok(()))
        .unwrap();
    conn.execute_batch("ALTER TABLE t DROP COLUMN b").unwrap();
    conn.query_row("SELECT crsql_commit_alter('t')", [], |_| Ok(()))
        .unwrap();

    let mut stmt = conn
        .prepare("SELECT \"__crsql_col_name\" FROM \"t__crsql_clock\"")
        .unwrap();
    let cids: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(cids, vec!["a".to_string()]);
}

// A changed pk set means new identities for every row: the clock is
// rebuilt from scratch.
#[test]
fn test_alter_with_pk_change_rebuilds_clock() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();
    let pre_version = db_version(&conn);

    conn.query_row("SELECT crsql_begin_alter('kv')", [], |_| Ok(()))
        .unwrap();
    conn.execute_batch(
        "CREATE TABLE kv_new (id INTEGER NOT NULL, v TEXT NOT NULL, PRIMARY KEY (id, v));
         INSERT INTO kv_new SELECT id, v FROM kv;
         DROP TABLE kv;
         ALTER TABLE kv_new RENAME TO kv;",
    )
    .unwrap();
    conn.query_row("SELECT crsql_commit_alter('kv')", [], |_| Ok(()))
        .unwrap();

    // fresh backfill under the new identity, above the recorded floor
    let changes = pull_changes(&conn, 0, None);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].1, "1|'a'");
    assert!(changes[0].5 > pre_version);

    let floor: i64 = conn
        .query_row(
            "SELECT CAST(value AS INTEGER) FROM crsql_master WHERE key = 'pre_compact_dbversion'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(floor, pre_version);
}

#[test]
fn test_update_and_delete_on_changes_vtab_are_misuse() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();
    assert!(conn
        .execute("UPDATE crsql_changes SET db_version = 9", [])
        .is_err());
    assert!(conn.execute("DELETE FROM crsql_changes", []).is_err());
}

// The site id identifies the storage file for its lifetime, across
// connections.
#[test]
fn test_siteid_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crr.db");

    let conn = rusqlite::Connection::open(&path).unwrap();
    crsql::load(&conn).unwrap();
    let site = site_id(&conn);
    conn.close().unwrap();

    let conn = rusqlite::Connection::open(&path).unwrap();
    crsql::load(&conn).unwrap();
    assert_eq!(site_id(&conn), site);
}

#[test]
fn test_siteid_shape() {
    let conn = new_db();
    let site = site_id(&conn);
    assert_eq!(site.len(), 16);
    assert_eq!(site[6] >> 4, 0x4);
    assert!((0x8..=0xb).contains(&(site[8] >> 4)));
    // stable across reads
    assert_eq!(site, site_id(&conn));
}

#[test]
fn test_changes_filter_by_version() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();
    conn.execute("INSERT INTO kv (id, v) VALUES (2, 'b')", [])
        .unwrap();
    assert_eq!(pull_changes(&conn, 0, None).len(), 2);
    assert_eq!(pull_changes(&conn, 1, None).len(), 1);
    assert_eq!(pull_changes(&conn, 2, None).len(), 0);
}

// The value resolved for a change tracks the live row; a concurrently
// deleted row still yields the change with a NULL value.
#[test]
fn test_value_resolved_from_live_row() {
    let conn = new_kv_db();
    conn.execute("INSERT INTO kv (id, v) VALUES (1, 'a')", [])
        .unwrap();
    let mut stmt = conn
        .prepare("SELECT val FROM crsql_changes WHERE db_version > 0 AND cid = 'v'")
        .unwrap();
    let vals: Vec<Value> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(vals, vec![Value::Text("a".to_string())]);
}
