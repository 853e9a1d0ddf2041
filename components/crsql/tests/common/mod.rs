/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// not every test binary uses every helper
#![allow(dead_code)]

use rusqlite::types::Value;
use rusqlite::Connection;

pub fn new_db() -> Connection {
    let _ = env_logger::builder().is_test(true).try_init();
    let conn = Connection::open_in_memory().unwrap();
    crsql::load(&conn).unwrap();
    conn
}

/// A connection with `kv(id INTEGER PRIMARY KEY, v TEXT)` lifted to a CRR.
pub fn new_kv_db() -> Connection {
    let conn = new_db();
    conn.execute_batch("CREATE TABLE kv (id INTEGER PRIMARY KEY, v TEXT)")
        .unwrap();
    conn.query_row("SELECT crsql_as_crr('kv')", [], |_| Ok(()))
        .unwrap();
    conn
}

pub fn site_id(conn: &Connection) -> Vec<u8> {
    conn.query_row("SELECT crsql_siteid()", [], |row| row.get(0))
        .unwrap()
}

pub fn db_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT crsql_dbversion()", [], |row| row.get(0))
        .unwrap()
}

/// One row of the changes stream, with the originating site resolved (a
/// NULL site id on the wire means "the replica you pulled from").
pub type Change = (String, String, String, Value, i64, i64, Value, i64);

pub fn pull_changes(conn: &Connection, since: i64, not_site: Option<&[u8]>) -> Vec<Change> {
    let (filter, params): (&str, Vec<Value>) = match not_site {
        Some(site) => (
            " AND site_id IS NOT ?2",
            vec![Value::from(since), Value::from(site.to_vec())],
        ),
        None => ("", vec![Value::from(since)]),
    };
    let sql = format!(
        "SELECT \"table\", pk, cid, val, col_version, db_version, \
         coalesce(site_id, crsql_siteid()), seq \
         FROM crsql_changes WHERE db_version > ?1{}",
        filter
    );
    let mut stmt = conn.prepare(&sql).unwrap();
    stmt.query_map(rusqlite::params_from_iter(params), |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    })
    .unwrap()
    .map(|r| r.unwrap())
    .collect()
}

pub fn apply_changes(conn: &Connection, changes: &[Change]) {
    for change in changes {
        apply_change(conn, change).unwrap();
    }
}

pub fn apply_change(conn: &Connection, change: &Change) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO crsql_changes \
         (\"table\", pk, cid, val, col_version, db_version, site_id, seq) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            change.0, change.1, change.2, change.3, change.4, change.5, change.6, change.7
        ],
    )
}

/// Ship every change from `src` to `dst`.
pub fn sync_all(src: &Connection, dst: &Connection) {
    let changes = pull_changes(src, 0, None);
    apply_changes(dst, &changes);
}

/// The replicated projection of `kv`, for convergence comparisons.
pub fn kv_dump(conn: &Connection) -> Vec<(i64, Option<String>)> {
    let mut stmt = conn.prepare("SELECT id, v FROM kv ORDER BY id").unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

/// Raw clock rows for a table, for metadata assertions.
pub fn clock_dump(
    conn: &Connection,
    tbl: &str,
) -> Vec<(String, String, i64, i64, Option<Vec<u8>>, i64)> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT quote(\"id\"), \"__crsql_col_name\", \"__crsql_col_version\", \
             \"__crsql_db_version\", \"__crsql_site_id\", \"__crsql_seq\" \
             FROM \"{}__crsql_clock\" ORDER BY 1, 2",
            tbl
        ))
        .unwrap();
    stmt.query_map([], |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    })
    .unwrap()
    .map(|r| r.unwrap())
    .collect()
}
