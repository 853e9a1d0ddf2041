/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Lifting a table into a CRR: clock table, change-capture triggers and
//! backfill of pre-existing rows, plus the begin/commit alter protocol for
//! schema evolution.

use crate::consts::{DELETE_SENTINEL, PKS_ONLY_SENTINEL, PRE_COMPACT_DBVERSION_KEY, TBL_MASTER};
use crate::error::{Error, Result};
use crate::ext::{self, SharedState};
use crate::tableinfo::{check_table_compatible, is_crr, pull_table_info, TableInfo};
use crate::triggers::{create_crr_triggers, remove_crr_triggers_if_exist};
use crate::util::as_identifier_list;
use rusqlite::Connection;
use sql_support::{escape_ident, ConnExt};

fn check_schema_is_main(schema: &str) -> Result<()> {
    if schema != "main" {
        return Err(Error::Schema(format!(
            "only the main schema is supported, got {:?}",
            schema
        )));
    }
    Ok(())
}

/// Turn `tbl_name` into a CRR. Idempotent; anything partial is rolled back.
pub fn as_crr(conn: &Connection, schema: &str, tbl_name: &str) -> Result<()> {
    check_schema_is_main(schema)?;
    let sp = conn.unchecked_savepoint("as_crr")?;
    create_crr(&sp, tbl_name)?;
    sp.commit()?;
    Ok(())
}

fn create_crr(conn: &Connection, tbl_name: &str) -> Result<()> {
    check_table_compatible(conn, tbl_name)?;
    if is_crr(conn, tbl_name)? {
        return Ok(());
    }
    log::debug!("creating crr for {}", tbl_name);

    let info = pull_table_info(conn, tbl_name)?;
    create_clock_table(conn, &info)?;
    remove_crr_triggers_if_exist(conn, tbl_name)?;
    create_crr_triggers(conn, &info)?;
    backfill_table(conn, &info)?;
    Ok(())
}

/// The clock table holds the versions for each column of a given row.
/// These versions are set to the next db_version at the time of the write;
/// db_version itself only advances at commit, so all columns written in
/// one transaction share a version and can be replicated together.
fn create_clock_table(conn: &Connection, info: &TableInfo) -> Result<()> {
    let clock = escape_ident(&info.clock_tbl_name());
    let pk_defs = info
        .pks
        .iter()
        .map(|c| {
            if c.ty.is_empty() {
                format!("\"{}\"", escape_ident(&c.name))
            } else {
                format!("\"{}\" {}", escape_ident(&c.name), c.ty)
            }
        })
        .collect::<Vec<_>>()
        .join(",");

    let create_table = format!(
        "CREATE TABLE IF NOT EXISTS \"{clock}\" (\
         {pk_defs},\
         \"__crsql_col_name\" TEXT NOT NULL,\
         \"__crsql_col_version\" INTEGER NOT NULL,\
         \"__crsql_db_version\" INTEGER NOT NULL,\
         \"__crsql_site_id\" BLOB,\
         \"__crsql_seq\" INTEGER NOT NULL,\
         PRIMARY KEY ({pk_list},\"__crsql_col_name\"))",
        clock = clock,
        pk_defs = pk_defs,
        pk_list = as_identifier_list(&info.pks, ""),
    );
    let create_index = format!(
        "CREATE INDEX IF NOT EXISTS \"{}_dbv_idx\" ON \"{}\" (\"__crsql_db_version\")",
        clock, clock,
    );
    conn.execute_all(&[create_table.as_str(), create_index.as_str()])?;
    Ok(())
}

/// Give every pre-existing row its clock entries. Existing entries are left
/// alone so re-running after `commit_alter` only fills in what's new.
fn backfill_table(conn: &Connection, info: &TableInfo) -> Result<()> {
    let clock = escape_ident(&info.clock_tbl_name());
    let tbl = escape_ident(&info.tbl_name);
    let pk_list = as_identifier_list(&info.pks, "");
    let cols = format!(
        "{},\"__crsql_col_name\",\"__crsql_col_version\",\"__crsql_db_version\",\"__crsql_seq\",\"__crsql_site_id\"",
        pk_list
    );

    for col in &info.non_pks {
        conn.execute(
            &format!(
                "INSERT INTO \"{clock}\" ({cols}) \
                 SELECT {pk_list},'{col}',1,crsql_nextdbversion(),crsql_increment_and_get_seq(),NULL \
                 FROM \"{tbl}\" WHERE \"{col_ident}\" IS NOT NULL \
                 ON CONFLICT DO NOTHING",
                clock = clock,
                cols = cols,
                pk_list = pk_list,
                col = sql_support::escape_text(&col.name),
                tbl = tbl,
                col_ident = escape_ident(&col.name),
            ),
            [],
        )?;
    }

    // rows with nothing but their identity still need to exist on peers
    let all_null = if info.non_pks.is_empty() {
        "true".to_string()
    } else {
        info.non_pks
            .iter()
            .map(|c| format!("\"{}\" IS NULL", escape_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(" AND ")
    };
    conn.execute(
        &format!(
            "INSERT INTO \"{clock}\" ({cols}) \
             SELECT {pk_list},'{pko}',1,crsql_nextdbversion(),crsql_increment_and_get_seq(),NULL \
             FROM \"{tbl}\" WHERE {all_null} \
             ON CONFLICT DO NOTHING",
            clock = clock,
            cols = cols,
            pk_list = pk_list,
            pko = PKS_ONLY_SENTINEL,
            tbl = tbl,
            all_null = all_null,
        ),
        [],
    )?;
    Ok(())
}

/// Drop the change-capture triggers ahead of a schema alteration. The
/// `alter_crr` savepoint stays open until `commit_alter`.
pub fn begin_alter(conn: &Connection, schema: &str, tbl_name: &str) -> Result<()> {
    check_schema_is_main(schema)?;
    conn.execute_batch("SAVEPOINT alter_crr")?;
    if let Err(e) = remove_crr_triggers_if_exist(conn, tbl_name) {
        let _ = conn.execute_batch("ROLLBACK TO alter_crr; RELEASE alter_crr");
        return Err(e);
    }
    Ok(())
}

/// Reconcile the clock with the table's post-alter shape, then reinstall
/// triggers and backfill whatever columns are new.
pub fn commit_alter(
    conn: &Connection,
    state: &SharedState,
    schema: &str,
    tbl_name: &str,
) -> Result<()> {
    check_schema_is_main(schema)?;
    let result = compact_post_alter(conn, state, tbl_name).and_then(|_| create_crr(conn, tbl_name));
    match result {
        Ok(()) => {
            conn.execute_batch("RELEASE alter_crr")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK TO alter_crr; RELEASE alter_crr");
            Err(e)
        }
    }
}

// If the primary key columns changed we have to drop and rebuild the clock
// table: a change in pk columns is a change in the identity of every row,
// and the old history can't be mapped over. Otherwise the clock is still
// relevant and just needs compacting for dropped columns and rows.
fn compact_post_alter(conn: &Connection, state: &SharedState, tbl_name: &str) -> Result<i64> {
    let current_db_version = ext::db_version(conn, state)?;
    let clock_tbl = format!("{}{}", tbl_name, crate::consts::CLOCK_TBL_SUFFIX);

    let pk_diff: i64 = conn.query_row(
        "SELECT count(name) FROM (\
           SELECT name FROM pragma_table_info(?1) WHERE pk > 0 \
             AND name NOT IN (SELECT name FROM pragma_table_info(?2) WHERE pk > 0) \
           UNION \
           SELECT name FROM pragma_table_info(?2) WHERE pk > 0 \
             AND name NOT IN (SELECT name FROM pragma_table_info(?1) WHERE pk > 0) \
             AND name != '__crsql_col_name')",
        [tbl_name, clock_tbl.as_str()],
        |row| row.get(0),
    )?;

    if pk_diff > 0 {
        log::debug!("pk set of {} changed; dropping clock", tbl_name);
        conn.execute(
            &format!("DROP TABLE \"{}\"", escape_ident(&clock_tbl)),
            [],
        )?;
    } else {
        // entries whose column is gone
        conn.execute(
            &format!(
                "DELETE FROM \"{clock}\" WHERE \"__crsql_col_name\" NOT IN (\
                 SELECT name FROM pragma_table_info(?) \
                 UNION SELECT '{del}' UNION SELECT '{pko}')",
                clock = escape_ident(&clock_tbl),
                del = DELETE_SENTINEL,
                pko = PKS_ONLY_SENTINEL,
            ),
            [tbl_name],
        )?;

        // entries whose row is gone; the delete sentinels must survive
        let info = pull_table_info(conn, tbl_name)?;
        let pk_join = info
            .pks
            .iter()
            .map(|c| {
                format!(
                    "\"{tbl}\".\"{name}\" = \"{clock}\".\"{name}\"",
                    tbl = escape_ident(tbl_name),
                    clock = escape_ident(&clock_tbl),
                    name = escape_ident(&c.name),
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        conn.execute(
            &format!(
                "DELETE FROM \"{clock}\" WHERE \"__crsql_col_name\" != '{del}' \
                 AND NOT EXISTS (SELECT 1 FROM \"{tbl}\" WHERE {pk_join} LIMIT 1)",
                clock = escape_ident(&clock_tbl),
                del = DELETE_SENTINEL,
                tbl = escape_ident(tbl_name),
                pk_join = pk_join,
            ),
            [],
        )?;
    }

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO \"{}\" (key, value) VALUES ('{}', ?)",
            TBL_MASTER, PRE_COMPACT_DBVERSION_KEY
        ),
        [current_db_version],
    )?;
    Ok(current_db_version)
}
