/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Reflection over live table schemas, via the `pragma_table_info`,
//! `pragma_index_list` and `pragma_index_info` table-valued functions.
//! The result is the normalized description every other component works
//! from: pk columns sorted by their position in the primary key, then
//! everything else.

use crate::consts::CLOCK_TBL_SUFFIX;
use crate::error::{Error, Result};
use rusqlite::Connection;

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub cid: i64,
    pub name: String,
    /// Declared type, possibly empty.
    pub ty: String,
    pub notnull: bool,
    pub dflt_value: Option<String>,
    /// 1-based position within the primary key; 0 for non-pk columns.
    pub pk: i64,
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub seq: i64,
    pub name: String,
    pub unique: bool,
    pub origin: String,
    pub partial: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub tbl_name: String,
    /// Primary key columns, sorted by pk ordinal.
    pub pks: Vec<ColumnInfo>,
    pub non_pks: Vec<ColumnInfo>,
    pub indices: Vec<IndexInfo>,
}

impl TableInfo {
    pub fn clock_tbl_name(&self) -> String {
        format!("{}{}", self.tbl_name, CLOCK_TBL_SUFFIX)
    }
}

/// Describe `tbl_name`. Fails with a schema error if the table does not
/// exist, has no primary key, or has a pk column that could hold NULL.
pub fn pull_table_info(conn: &Connection, tbl_name: &str) -> Result<TableInfo> {
    let mut stmt = conn.prepare_cached(
        "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?)",
    )?;
    let columns = stmt
        .query_map([tbl_name], |row| {
            Ok(ColumnInfo {
                cid: row.get(0)?,
                name: row.get(1)?,
                ty: row.get(2)?,
                notnull: row.get::<_, i64>(3)? != 0,
                dflt_value: row.get(4)?,
                pk: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if columns.is_empty() {
        return Err(Error::Schema(format!("table {} does not exist", tbl_name)));
    }

    let mut pks: Vec<ColumnInfo> = columns.iter().filter(|c| c.pk > 0).cloned().collect();
    pks.sort_by_key(|c| c.pk);
    let non_pks: Vec<ColumnInfo> = columns.iter().filter(|c| c.pk == 0).cloned().collect();

    if pks.is_empty() {
        return Err(Error::Schema(format!(
            "table {} has no primary key",
            tbl_name
        )));
    }

    // A NULL row identity can't be versioned or put on the wire. A lone
    // INTEGER PRIMARY KEY is a rowid alias and can never be NULL even
    // though the pragma reports it as nullable.
    let is_rowid_alias = pks.len() == 1 && pks[0].ty.eq_ignore_ascii_case("integer");
    if !is_rowid_alias {
        for pk in &pks {
            if !pk.notnull && pk.dflt_value.is_none() {
                return Err(Error::Schema(format!(
                    "primary key column {}.{} is nullable and has no default",
                    tbl_name, pk.name
                )));
            }
        }
    }

    let indices = pull_index_list(conn, tbl_name)?;

    Ok(TableInfo {
        tbl_name: tbl_name.to_string(),
        pks,
        non_pks,
        indices,
    })
}

fn pull_index_list(conn: &Connection, tbl_name: &str) -> Result<Vec<IndexInfo>> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq, name, \"unique\", origin, partial FROM pragma_index_list(?)",
    )?;
    let mut indices = stmt
        .query_map([tbl_name], |row| {
            Ok(IndexInfo {
                seq: row.get(0)?,
                name: row.get(1)?,
                unique: row.get::<_, i64>(2)? != 0,
                origin: row.get(3)?,
                partial: row.get::<_, i64>(4)? != 0,
                columns: Vec::new(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for index in &mut indices {
        let mut stmt =
            conn.prepare_cached("SELECT name FROM pragma_index_info(?) ORDER BY seqno")?;
        index.columns = stmt
            .query_map([&index.name], |row| row.get::<_, Option<String>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            // rowid or expression members have no column name
            .flatten()
            .collect();
    }

    Ok(indices)
}

/// Describe every CRR in the database, in clock-table discovery order.
pub fn pull_all_table_infos(conn: &Connection) -> Result<Vec<TableInfo>> {
    let mut stmt = conn.prepare_cached(crate::consts::CLOCK_TABLES_SELECT)?;
    let clock_tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut infos = Vec::with_capacity(clock_tables.len());
    for clock_tbl in clock_tables {
        let base = &clock_tbl[..clock_tbl.len() - CLOCK_TBL_SUFFIX.len()];
        infos.push(pull_table_info(conn, base)?);
    }
    Ok(infos)
}

/// Is `tbl_name` already a CRR on this database? True when both the clock
/// table and the change-capture triggers are in place; `begin_alter` leaves
/// the clock without triggers, which must read as "not installed" so
/// `commit_alter` reinstalls them.
pub fn is_crr(conn: &Connection, tbl_name: &str) -> Result<bool> {
    let clock: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [format!("{}{}", tbl_name, CLOCK_TBL_SUFFIX)],
        |row| row.get(0),
    )?;
    let trigger: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'trigger' AND name = ?",
        [format!("{}__crsql_itrig", tbl_name)],
        |row| row.get(0),
    )?;
    Ok(clock > 0 && trigger > 0)
}

/// Validate that a table can be lifted into a CRR at all.
pub fn check_table_compatible(conn: &Connection, tbl_name: &str) -> Result<()> {
    let exists: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [tbl_name],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(Error::IncompatibleSchema(format!(
            "table {} does not exist",
            tbl_name
        )));
    }

    // Generated columns have no stable value to version.
    let generated: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_xinfo(?) WHERE hidden IN (2, 3)",
        [tbl_name],
        |row| row.get(0),
    )?;
    if generated > 0 {
        return Err(Error::IncompatibleSchema(format!(
            "table {} has generated columns",
            tbl_name
        )));
    }

    // The reflector re-checks pk shape; routing through it keeps the error
    // messages in one place.
    pull_table_info(conn, tbl_name).map_err(|e| match e {
        Error::Schema(msg) => Error::IncompatibleSchema(msg),
        other => other,
    })?;
    Ok(())
}
