/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The merge path: a row inserted into `crsql_changes` is applied to the
//! target table and its clock, last-writer-wins at column granularity.
//! Applying is idempotent and order-insensitive; a change that doesn't win
//! against local state is dropped.

use super::{row_type_for_cid, RowType};
use crate::clock::ClockStamp;
use crate::consts::DELETE_SENTINEL;
use crate::error::{Error, Result};
use crate::ext::{self, SharedState};
use crate::tableinfo::TableInfo;
use crate::util::{as_identifier_list, pk_where_list, slab_rowid, split_quote_concat};
use rusqlite::types::Value;
use rusqlite::vtab::Values;
use rusqlite::{ffi, params, Connection};
use sql_support::{escape_ident, ConnExt};
use std::cmp::Ordering;

// xUpdate argv layout: [old rowid, new rowid, declared columns...]
const ARG_TBL: usize = 2;
const ARG_PK: usize = 3;
const ARG_CID: usize = 4;
const ARG_VAL: usize = 5;
const ARG_COL_VERSION: usize = 6;
const ARG_DB_VERSION: usize = 7;
const ARG_SITE_ID: usize = 8;
const ARG_SEQ: usize = 9;

struct LocalClock {
    col_version: i64,
    stamp: ClockStamp,
}

pub fn merge_insert(
    db: *mut ffi::sqlite3,
    state: &SharedState,
    args: &Values<'_>,
) -> Result<i64> {
    let conn = unsafe { Connection::from_handle(db) }?;

    let tbl: String = args.get(ARG_TBL)?;
    let pks: String = args.get(ARG_PK)?;
    let cid: String = args.get(ARG_CID)?;
    let val: Value = args.get(ARG_VAL)?;
    let col_version: i64 = args.get(ARG_COL_VERSION)?;
    let db_version: i64 = args.get(ARG_DB_VERSION)?;
    let site_id: Option<Vec<u8>> = args.get(ARG_SITE_ID)?;
    let seq: i64 = args.get(ARG_SEQ)?;

    let infos = ext::ensure_table_infos(&conn, state)?;
    let tbl_idx = infos
        .iter()
        .position(|info| info.tbl_name == tbl)
        .ok_or_else(|| Error::UnknownTable(tbl.clone()))?;
    let info = &infos[tbl_idx];

    let pk_literals = split_quote_concat(&pks)?;
    if pk_literals.len() != info.pks.len() {
        return Err(Error::MalformedPk(format!(
            "{} pk values for {} pk columns of {}",
            pk_literals.len(),
            info.pks.len(),
            tbl
        )));
    }
    let pk_where = pk_where_list(&info.pks, &pk_literals);

    let row_type = row_type_for_cid(&cid);
    if row_type == RowType::Update && !info.non_pks.iter().any(|c| c.name == cid) {
        return Err(Error::Schema(format!(
            "column {} does not exist in {}",
            cid, tbl
        )));
    }

    let local_site = state.lock().site_id;
    let incoming = ClockStamp {
        db_version,
        seq,
        site_id: site_id.clone(),
    };

    // No savepoint here: this already runs inside the statement
    // transaction of the INSERT hitting the virtual table, and the host
    // rolls the whole statement back if the merge fails partway.

    // The competitor the incoming change must beat: for a delete, anything
    // recorded for the row; otherwise the cell's own clock or a delete
    // sentinel covering the whole row.
    let local_cell = stamp_for_cell(&conn, info, &pk_where, &cid)?;
    let local_best = match row_type {
        RowType::Delete => max_stamp_for_row(&conn, info, &pk_where, &local_site)?,
        _ => {
            let sentinel = stamp_for_cell(&conn, info, &pk_where, DELETE_SENTINEL)?;
            max_by_stamp(local_cell.as_ref(), sentinel.as_ref(), &local_site)
        }
    };

    let ordering = match &local_best {
        None => Ordering::Greater,
        Some(local) => incoming.cmp_at(&local.stamp, &local_site),
    };

    match ordering {
        Ordering::Less => {
            log::trace!("dropping stale change for {} {}", tbl, pks);
            return Ok(0);
        }
        Ordering::Equal => {
            // Same event (or a tie with identical versions). With
            // merge-equal-values set we still take the value so replicas
            // converge bit-for-bit; the clock row is left untouched.
            if row_type == RowType::Update && state.lock().merge_equal_values {
                with_sync_bit(state, || upsert_value(&conn, info, &pk_literals, &cid, &val))?;
                state.lock().rows_impacted += 1;
            }
            return Ok(0);
        }
        Ordering::Greater => {}
    }

    // The column version is a Lamport counter and may only move up: take
    // the max of the incoming value and whatever this cell (or its
    // sentinel) already recorded. db_version/seq/site_id are stored
    // verbatim.
    let merged_col_version = local_cell
        .map(|l| l.col_version.max(col_version))
        .unwrap_or(col_version);

    let clock_rowid = match row_type {
        RowType::Update => {
            // a winning write over a delete sentinel resurrects the row
            drop_delete_sentinel(&conn, info, &pk_where)?;
            with_sync_bit(state, || upsert_value(&conn, info, &pk_literals, &cid, &val))?;
            set_winner_clock(
                &conn,
                info,
                &pk_literals,
                &cid,
                merged_col_version,
                db_version,
                seq,
                &site_id,
            )?
        }
        RowType::Delete => {
            with_sync_bit(state, || {
                conn.execute(
                    &format!(
                        "DELETE FROM \"{}\" WHERE {}",
                        escape_ident(&info.tbl_name),
                        pk_where
                    ),
                    [],
                )?;
                Ok(())
            })?;
            // write the winner clock before dropping the rest so the max
            // db_version the row has seen is never lost
            let rowid = set_winner_clock(
                &conn,
                info,
                &pk_literals,
                DELETE_SENTINEL,
                merged_col_version,
                db_version,
                seq,
                &site_id,
            )?;
            conn.execute(
                &format!(
                    "DELETE FROM \"{}\" WHERE {} AND \"__crsql_col_name\" != '{}'",
                    escape_ident(&info.clock_tbl_name()),
                    pk_where,
                    DELETE_SENTINEL
                ),
                [],
            )?;
            rowid
        }
        RowType::PkOnly => {
            drop_delete_sentinel(&conn, info, &pk_where)?;
            with_sync_bit(state, || {
                conn.execute(
                    &format!(
                        "INSERT OR IGNORE INTO \"{}\" ({}) VALUES ({})",
                        escape_ident(&info.tbl_name),
                        as_identifier_list(&info.pks, ""),
                        pk_literals.join(",")
                    ),
                    [],
                )?;
                Ok(())
            })?;
            set_winner_clock(
                &conn,
                info,
                &pk_literals,
                &cid,
                merged_col_version,
                db_version,
                seq,
                &site_id,
            )?
        }
    };

    state.lock().rows_impacted += 1;
    Ok(slab_rowid(tbl_idx, clock_rowid))
}

// Triggers are a no-op while the bit is set; the lock is dropped before any
// SQL runs because evaluating the trigger guard takes it again.
fn with_sync_bit<T>(state: &SharedState, f: impl FnOnce() -> Result<T>) -> Result<T> {
    state.lock().sync_bit = 1;
    let result = f();
    state.lock().sync_bit = 0;
    result
}

fn stamp_for_cell(
    conn: &Connection,
    info: &TableInfo,
    pk_where: &str,
    cid: &str,
) -> Result<Option<LocalClock>> {
    let sql = format!(
        "SELECT \"__crsql_col_version\",\"__crsql_db_version\",\"__crsql_seq\",\"__crsql_site_id\" \
         FROM \"{}\" WHERE {} AND \"__crsql_col_name\" = ?",
        escape_ident(&info.clock_tbl_name()),
        pk_where
    );
    conn.try_query_row(&sql, [cid], map_local_clock, false)
}

// The greatest stamp recorded for the pk set across all of its cells.
fn max_stamp_for_row(
    conn: &Connection,
    info: &TableInfo,
    pk_where: &str,
    local_site: &[u8],
) -> Result<Option<LocalClock>> {
    let sql = format!(
        "SELECT \"__crsql_col_version\",\"__crsql_db_version\",\"__crsql_seq\",\"__crsql_site_id\" \
         FROM \"{}\" WHERE {}",
        escape_ident(&info.clock_tbl_name()),
        pk_where
    );
    let mut stmt = conn.prepare(&sql)?;
    let stamps = stmt
        .query_and_then([], map_local_clock)?
        .collect::<Result<Vec<_>>>()?;
    Ok(stamps.into_iter().fold(None, |best, candidate| {
        match &best {
            Some(b) if candidate.stamp.cmp_at(&b.stamp, local_site) != Ordering::Greater => best,
            _ => Some(candidate),
        }
    }))
}

fn map_local_clock(row: &rusqlite::Row<'_>) -> Result<LocalClock> {
    Ok(LocalClock {
        col_version: row.get(0)?,
        stamp: ClockStamp {
            db_version: row.get(1)?,
            seq: row.get(2)?,
            site_id: row.get(3)?,
        },
    })
}

fn max_by_stamp<'a>(
    a: Option<&'a LocalClock>,
    b: Option<&'a LocalClock>,
    local_site: &[u8],
) -> Option<LocalClock> {
    let pick = match (a, b) {
        (Some(a), Some(b)) => {
            if a.stamp.cmp_at(&b.stamp, local_site) == Ordering::Less {
                b
            } else {
                a
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some(LocalClock {
        col_version: pick.col_version,
        stamp: pick.stamp.clone(),
    })
}

fn drop_delete_sentinel(conn: &Connection, info: &TableInfo, pk_where: &str) -> Result<()> {
    conn.execute(
        &format!(
            "DELETE FROM \"{}\" WHERE {} AND \"__crsql_col_name\" = '{}'",
            escape_ident(&info.clock_tbl_name()),
            pk_where,
            DELETE_SENTINEL
        ),
        [],
    )?;
    Ok(())
}

fn upsert_value(
    conn: &Connection,
    info: &TableInfo,
    pk_literals: &[String],
    cid: &str,
    val: &Value,
) -> Result<()> {
    let col = escape_ident(cid);
    conn.execute(
        &format!(
            "INSERT INTO \"{tbl}\" ({pk_cols},\"{col}\") VALUES ({pk_vals},?) \
             ON CONFLICT ({pk_cols}) DO UPDATE SET \"{col}\" = excluded.\"{col}\"",
            tbl = escape_ident(&info.tbl_name),
            pk_cols = as_identifier_list(&info.pks, ""),
            col = col,
            pk_vals = pk_literals.join(","),
        ),
        [val],
    )?;
    Ok(())
}

// Record the incoming metadata as the cell's clock. Returns the clock row's
// rowid for the virtual table's rowid slab.
#[allow(clippy::too_many_arguments)]
fn set_winner_clock(
    conn: &Connection,
    info: &TableInfo,
    pk_literals: &[String],
    cid: &str,
    col_version: i64,
    db_version: i64,
    seq: i64,
    site_id: &Option<Vec<u8>>,
) -> Result<i64> {
    let pk_cols = as_identifier_list(&info.pks, "");
    let sql = format!(
        "INSERT INTO \"{clock}\" ({pk_cols},\"__crsql_col_name\",\"__crsql_col_version\",\
         \"__crsql_db_version\",\"__crsql_seq\",\"__crsql_site_id\") \
         VALUES ({pk_vals},?,?,?,?,?) \
         ON CONFLICT ({pk_cols},\"__crsql_col_name\") DO UPDATE SET \
         \"__crsql_col_version\" = excluded.\"__crsql_col_version\",\
         \"__crsql_db_version\" = excluded.\"__crsql_db_version\",\
         \"__crsql_seq\" = excluded.\"__crsql_seq\",\
         \"__crsql_site_id\" = excluded.\"__crsql_site_id\" \
         RETURNING rowid",
        clock = escape_ident(&info.clock_tbl_name()),
        pk_cols = pk_cols,
        pk_vals = pk_literals.join(","),
    );
    let rowid = conn.query_row(
        &sql,
        params![cid, col_version, db_version, seq, site_id],
        |row| row.get(0),
    )?;
    Ok(rowid)
}
