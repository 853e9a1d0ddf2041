/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Bootstrap of the extension's own persisted state - site id, master
//! key/value table, peer tracking - plus the idempotent on-attach upgrade.

use crate::consts::{
    CLOCK_TABLES_SELECT, CRSQLITE_VERSION, SITE_ID_LEN, TBL_MASTER, TBL_SITE_ID, TBL_TRACKED_PEERS,
};
use crate::error::{Error, Result};
use rand::Rng;
use rusqlite::Connection;
use sql_support::ConnExt;

pub fn create_master_table(conn: &Connection) -> Result<()> {
    let sp = conn.unchecked_savepoint("crsql_create_schema_table")?;
    sp.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\"key\" TEXT PRIMARY KEY, \"value\" ANY)",
            TBL_MASTER
        ),
        [],
    )?;
    sp.commit()?;
    Ok(())
}

pub fn create_peer_tracking_table(conn: &Connection) -> Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\
             \"site_id\" BLOB NOT NULL, \
             \"version\" INTEGER NOT NULL, \
             \"seq\" INTEGER DEFAULT 0, \
             \"tag\" INTEGER, \
             \"event\" INTEGER, \
             PRIMARY KEY (\"site_id\", \"tag\", \"event\")) STRICT",
            TBL_TRACKED_PEERS
        ),
        [],
    )?;
    Ok(())
}

/// Load the site id, creating the table and a fresh identity on first
/// attach. The id is random but keeps the version-4 UUID nibble layout.
pub fn load_or_create_site_id(conn: &Connection) -> Result<[u8; SITE_ID_LEN]> {
    let exists: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [TBL_SITE_ID],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return create_site_id_and_table(conn);
    }

    let blob: Vec<u8> = conn.query_one(&format!("SELECT site_id FROM \"{}\"", TBL_SITE_ID))?;
    blob.as_slice()
        .try_into()
        .map_err(|_| Error::Schema(format!("stored site id is not {} bytes", SITE_ID_LEN)))
}

fn create_site_id_and_table(conn: &Connection) -> Result<[u8; SITE_ID_LEN]> {
    conn.execute(
        &format!("CREATE TABLE \"{}\" (site_id)", TBL_SITE_ID),
        [],
    )?;

    let mut site_id = [0u8; SITE_ID_LEN];
    rand::thread_rng().fill(&mut site_id[..]);
    site_id[6] = (site_id[6] & 0x0f) | 0x40;
    site_id[8] = (site_id[8] & 0x3f) | 0x80;

    conn.execute(
        &format!("INSERT INTO \"{}\" (site_id) VALUES (?)", TBL_SITE_ID),
        [&site_id[..]],
    )?;
    log::debug!("created new site id");
    Ok(site_id)
}

/// Bring an older database up to the current layout and record the
/// extension version. Databases from before the version key existed lack
/// the `__crsql_seq` column on their clock tables.
pub fn maybe_update_db(conn: &Connection) -> Result<()> {
    let sp = conn.unchecked_savepoint("crsql_maybe_update_db")?;

    let recorded: Option<i64> = sp.try_query_one(
        &format!("SELECT value FROM \"{}\" WHERE key = 'crsqlite_version'", TBL_MASTER),
        [],
        false,
    )?;
    if recorded.is_none() {
        add_seq_to_clock_tables(&sp)?;
    }

    sp.execute(
        &format!(
            "INSERT OR REPLACE INTO \"{}\" VALUES ('crsqlite_version', ?)",
            TBL_MASTER
        ),
        [CRSQLITE_VERSION],
    )?;
    sp.commit()?;
    Ok(())
}

fn add_seq_to_clock_tables(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(CLOCK_TABLES_SELECT)?;
    let clock_tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for tbl in clock_tables {
        let has_seq: i64 = conn.query_row(
            "SELECT count(*) FROM pragma_table_info(?) WHERE name = '__crsql_seq'",
            [&tbl],
            |row| row.get(0),
        )?;
        if has_seq == 0 {
            log::debug!("adding __crsql_seq to {}", tbl);
            conn.execute(
                &format!(
                    "ALTER TABLE \"{}\" ADD COLUMN \"__crsql_seq\" NOT NULL DEFAULT 0",
                    sql_support::escape_ident(&tbl)
                ),
                [],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_site_id_created_once() {
        let conn = Connection::open_in_memory().unwrap();
        let first = load_or_create_site_id(&conn).unwrap();
        let second = load_or_create_site_id(&conn).unwrap();
        assert_eq!(first, second);
        // v4/variant layout
        assert_eq!(first[6] >> 4, 0x4);
        assert!((0x8..=0xb).contains(&(first[8] >> 4)));
    }

    #[test]
    fn test_upgrade_adds_seq_column() {
        let conn = Connection::open_in_memory().unwrap();
        create_master_table(&conn).unwrap();
        // an old-layout clock table, from before __crsql_seq existed
        conn.execute_batch(
            "CREATE TABLE \"kv__crsql_clock\" (
                \"id\",
                \"__crsql_col_name\" NOT NULL,
                \"__crsql_col_version\" NOT NULL,
                \"__crsql_db_version\" NOT NULL,
                \"__crsql_site_id\",
                PRIMARY KEY (\"id\", \"__crsql_col_name\")
            );
            INSERT INTO \"kv__crsql_clock\" VALUES (1, 'v', 1, 1, NULL);",
        )
        .unwrap();

        maybe_update_db(&conn).unwrap();

        let seq: i64 = conn
            .query_one("SELECT \"__crsql_seq\" FROM \"kv__crsql_clock\"")
            .unwrap();
        assert_eq!(seq, 0);
        let version: i64 = conn
            .query_one(&format!(
                "SELECT value FROM \"{}\" WHERE key = 'crsqlite_version'",
                TBL_MASTER
            ))
            .unwrap();
        assert_eq!(version, CRSQLITE_VERSION);

        // idempotent
        maybe_update_db(&conn).unwrap();
    }
}
