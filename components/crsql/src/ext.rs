/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Per-connection mutable state. Every registered callback (scalar
//! function, hook, virtual table) holds a clone of the shared handle.
//!
//! The lock must never be held across SQL execution: statements can call
//! back into our own registered functions (triggers evaluate the sync bit,
//! `crsql_nextdbversion`, ...), which take the lock themselves.

use crate::consts::{PRE_COMPACT_DBVERSION_KEY, SITE_ID_LEN, TBL_MASTER};
use crate::error::Result;
use crate::tableinfo::{pull_all_table_infos, TableInfo};
use parking_lot::Mutex;
use rusqlite::Connection;
use sql_support::ConnExt;
use std::sync::Arc;

pub type SharedState = Arc<Mutex<ExtState>>;

pub struct ExtState {
    pub site_id: [u8; SITE_ID_LEN],
    /// −1 = not loaded; fetched lazily and memoized until the commit or
    /// rollback hook clears it.
    pub db_version: i64,
    /// Transaction-local write counter; reset to 0 on commit and rollback.
    pub seq: i64,
    /// Non-zero while remote changes are being applied; change-capture
    /// triggers are a no-op then.
    pub sync_bit: i64,
    /// Changes that actually mutated state in the current transaction.
    pub rows_impacted: i64,
    /// `config.merge-equal-values` from the master table.
    pub merge_equal_values: bool,
    table_infos: Vec<TableInfo>,
    /// `PRAGMA schema_version` at which `table_infos` was computed; −1
    /// until the first pull.
    table_infos_schema_version: i64,
}

impl ExtState {
    pub fn new(site_id: [u8; SITE_ID_LEN]) -> Self {
        ExtState {
            site_id,
            db_version: -1,
            seq: 0,
            sync_bit: 0,
            rows_impacted: 0,
            merge_equal_values: false,
            table_infos: Vec::new(),
            table_infos_schema_version: -1,
        }
    }
}

/// Read `config.*` rows out of the master table into the state. Runs once
/// at attach.
pub fn load_config(conn: &Connection, state: &SharedState) -> Result<()> {
    // substr, not ltrim: ltrim(X, Y) strips a character set, not a prefix
    let mut stmt = conn.prepare(&format!(
        "SELECT substr(key, {}), value FROM \"{}\" WHERE key LIKE 'config.%'",
        "config.".len() + 1,
        TBL_MASTER
    ))?;
    let entries = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut state = state.lock();
    for (name, value) in entries {
        match name.as_str() {
            "merge-equal-values" => state.merge_equal_values = value != 0,
            other => log::warn!("ignoring unknown config entry {:?}", other),
        }
    }
    Ok(())
}

/// The current db_version of this database: the largest version any clock
/// table has recorded (compaction leaves a floor in the master table), or
/// 0 for a fresh database. Memoized for the duration of the transaction.
pub fn db_version(conn: &Connection, state: &SharedState) -> Result<i64> {
    {
        let state = state.lock();
        if state.db_version != -1 {
            return Ok(state.db_version);
        }
    }
    let fetched = fetch_db_version(conn)?;
    let mut state = state.lock();
    if state.db_version == -1 {
        state.db_version = fetched;
    }
    Ok(state.db_version)
}

/// The version all writes in the current transaction stamp their clock
/// rows with. Stable for the whole transaction since `db_version` is
/// memoized until commit.
pub fn next_db_version(conn: &Connection, state: &SharedState) -> Result<i64> {
    Ok(db_version(conn, state)? + 1)
}

fn fetch_db_version(conn: &Connection) -> Result<i64> {
    let mut stmt = conn.prepare_cached(crate::consts::CLOCK_TABLES_SELECT)?;
    let clock_tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut arms: Vec<String> = clock_tables
        .iter()
        .map(|tbl| {
            format!(
                "SELECT max(\"__crsql_db_version\") AS version FROM \"{}\"",
                sql_support::escape_ident(tbl)
            )
        })
        .collect();
    arms.push(format!(
        "SELECT CAST(value AS INTEGER) AS version FROM \"{}\" WHERE key = '{}'",
        TBL_MASTER, PRE_COMPACT_DBVERSION_KEY
    ));

    let sql = format!(
        "SELECT coalesce(max(version), 0) FROM ({})",
        arms.join(" UNION ALL ")
    );
    Ok(conn.query_one(&sql)?)
}

/// The cached table infos, refreshed when `PRAGMA schema_version` moved.
/// Returns a snapshot so no caller works on the cache while the lock is
/// released.
pub fn ensure_table_infos(conn: &Connection, state: &SharedState) -> Result<Vec<TableInfo>> {
    let schema_version: i64 = conn.query_one("PRAGMA schema_version")?;
    {
        let state = state.lock();
        if state.table_infos_schema_version == schema_version {
            return Ok(state.table_infos.clone());
        }
    }
    let infos = pull_all_table_infos(conn)?;
    let mut state = state.lock();
    state.table_infos = infos.clone();
    state.table_infos_schema_version = schema_version;
    Ok(infos)
}
