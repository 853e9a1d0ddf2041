/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Generation of the change-capture triggers. One trigger each for INSERT,
//! UPDATE and DELETE; all three are a no-op while the sync bit is set so
//! that applying remote changes doesn't feed back into the clock.

use crate::consts::{DELETE_SENTINEL, PKS_ONLY_SENTINEL};
use crate::error::Result;
use crate::tableinfo::TableInfo;
use crate::util::as_identifier_list;
use rusqlite::Connection;
use sql_support::{escape_ident, escape_text, ConnExt};

// Columns of every clock-table insert, pk columns first.
fn clock_insert_columns(info: &TableInfo) -> String {
    format!(
        "{},\"__crsql_col_name\",\"__crsql_col_version\",\"__crsql_db_version\",\"__crsql_seq\",\"__crsql_site_id\"",
        as_identifier_list(&info.pks, "")
    )
}

// The upsert tail shared by every clock write a trigger makes: a repeat
// write to the same cell bumps the column version and re-stamps the row as
// a fresh local write.
fn clock_upsert_clause(info: &TableInfo) -> String {
    format!(
        "ON CONFLICT ({},\"__crsql_col_name\") DO UPDATE SET \
         \"__crsql_col_version\" = \"__crsql_col_version\" + 1,\
         \"__crsql_db_version\" = crsql_nextdbversion(),\
         \"__crsql_seq\" = crsql_increment_and_get_seq(),\
         \"__crsql_site_id\" = NULL",
        as_identifier_list(&info.pks, "")
    )
}

// One `INSERT ... SELECT ... WHERE <guard> ON CONFLICT ...` clock write.
fn clock_write(info: &TableInfo, pk_prefix: &str, col_name_literal: &str, guard: &str) -> String {
    format!(
        "INSERT INTO \"{clock}\" ({cols}) SELECT {pks},'{col}',1,crsql_nextdbversion(),crsql_increment_and_get_seq(),NULL WHERE {guard} {upsert};",
        clock = escape_ident(&info.clock_tbl_name()),
        cols = clock_insert_columns(info),
        pks = as_identifier_list(&info.pks, pk_prefix),
        col = col_name_literal,
        guard = guard,
        upsert = clock_upsert_clause(info),
    )
}

// `"a" = NEW."a" AND "b" = NEW."b"` (or OLD.)
fn pk_match(info: &TableInfo, prefix: &str) -> String {
    info.pks
        .iter()
        .map(|c| {
            format!(
                "\"{name}\" = {prefix}\"{name}\"",
                name = escape_ident(&c.name),
                prefix = prefix
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

// `(NEW."a" IS NOT OLD."a" OR ...)` - did the row identity change?
fn pk_changed(info: &TableInfo) -> String {
    format!(
        "({})",
        info.pks
            .iter()
            .map(|c| {
                format!(
                    "NEW.\"{name}\" IS NOT OLD.\"{name}\"",
                    name = escape_ident(&c.name)
                )
            })
            .collect::<Vec<_>>()
            .join(" OR ")
    )
}

// `NEW."x" IS NULL AND NEW."y" IS NULL`; `true` when there is nothing to
// check, which is exactly the pk-only case.
fn non_pks_all_null(info: &TableInfo) -> String {
    if info.non_pks.is_empty() {
        return "true".to_string();
    }
    info.non_pks
        .iter()
        .map(|c| format!("NEW.\"{}\" IS NULL", escape_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub fn insert_trigger_sql(info: &TableInfo) -> String {
    let clock = escape_ident(&info.clock_tbl_name());
    let mut body = String::new();

    for col in &info.non_pks {
        body.push_str(&clock_write(
            info,
            "NEW.",
            &escape_text(&col.name),
            &format!("NEW.\"{}\" IS NOT NULL", escape_ident(&col.name)),
        ));
    }
    body.push_str(&clock_write(
        info,
        "NEW.",
        PKS_ONLY_SENTINEL,
        &non_pks_all_null(info),
    ));

    // A re-insert supersedes any delete sentinel. This must run after the
    // clock writes above: the sentinel's db_version has to be visible while
    // the next version is computed, or the re-insert would sort below the
    // delete it supersedes.
    body.push_str(&format!(
        "DELETE FROM \"{clock}\" WHERE {pks} AND \"__crsql_col_name\" = '{del}';",
        clock = clock,
        pks = pk_match(info, "NEW."),
        del = DELETE_SENTINEL,
    ));

    format!(
        "CREATE TRIGGER \"{tbl}__crsql_itrig\" AFTER INSERT ON \"{tbl}\" FOR EACH ROW \
         WHEN crsql_internal_sync_bit() = 0 BEGIN {body} END",
        tbl = escape_ident(&info.tbl_name),
        body = body,
    )
}

pub fn update_trigger_sql(info: &TableInfo) -> String {
    let clock = escape_ident(&info.clock_tbl_name());
    let pk_changed = pk_changed(info);
    let mut body = String::new();

    // Identity change is a delete of the old row plus an insert of the new
    // one. These are no-ops when the pks are untouched.
    body.push_str(&clock_write(
        info,
        "OLD.",
        DELETE_SENTINEL,
        &pk_changed,
    ));
    body.push_str(&format!(
        "DELETE FROM \"{clock}\" WHERE {changed} AND {pks} AND \"__crsql_col_name\" != '{del}';",
        clock = clock,
        changed = pk_changed,
        pks = pk_match(info, "OLD."),
        del = DELETE_SENTINEL,
    ));
    body.push_str(&format!(
        "DELETE FROM \"{clock}\" WHERE {changed} AND {pks} AND \"__crsql_col_name\" = '{del}';",
        clock = clock,
        changed = pk_changed,
        pks = pk_match(info, "NEW."),
        del = DELETE_SENTINEL,
    ));

    for col in &info.non_pks {
        let name = escape_ident(&col.name);
        body.push_str(&clock_write(
            info,
            "NEW.",
            &escape_text(&col.name),
            &format!(
                "CASE WHEN {changed} THEN NEW.\"{name}\" IS NOT NULL \
                 ELSE NEW.\"{name}\" IS NOT OLD.\"{name}\" END",
                changed = pk_changed,
                name = name,
            ),
        ));
    }
    body.push_str(&clock_write(
        info,
        "NEW.",
        PKS_ONLY_SENTINEL,
        &format!("{} AND {}", pk_changed, non_pks_all_null(info)),
    ));

    format!(
        "CREATE TRIGGER \"{tbl}__crsql_utrig\" AFTER UPDATE ON \"{tbl}\" FOR EACH ROW \
         WHEN crsql_internal_sync_bit() = 0 BEGIN {body} END",
        tbl = escape_ident(&info.tbl_name),
        body = body,
    )
}

pub fn delete_trigger_sql(info: &TableInfo) -> String {
    let mut body = String::new();
    body.push_str(&clock_write(info, "OLD.", DELETE_SENTINEL, "true"));
    body.push_str(&format!(
        "DELETE FROM \"{clock}\" WHERE {pks} AND \"__crsql_col_name\" != '{del}';",
        clock = escape_ident(&info.clock_tbl_name()),
        pks = pk_match(info, "OLD."),
        del = DELETE_SENTINEL,
    ));

    format!(
        "CREATE TRIGGER \"{tbl}__crsql_dtrig\" AFTER DELETE ON \"{tbl}\" FOR EACH ROW \
         WHEN crsql_internal_sync_bit() = 0 BEGIN {body} END",
        tbl = escape_ident(&info.tbl_name),
        body = body,
    )
}

pub fn create_crr_triggers(conn: &Connection, info: &TableInfo) -> Result<()> {
    let insert = insert_trigger_sql(info);
    let update = update_trigger_sql(info);
    let delete = delete_trigger_sql(info);
    conn.execute_all(&[insert.as_str(), update.as_str(), delete.as_str()])?;
    Ok(())
}

pub fn remove_crr_triggers_if_exist(conn: &Connection, tbl_name: &str) -> Result<()> {
    let tbl = escape_ident(tbl_name);
    let drop_insert = format!("DROP TRIGGER IF EXISTS \"{}__crsql_itrig\"", tbl);
    let drop_update = format!("DROP TRIGGER IF EXISTS \"{}__crsql_utrig\"", tbl);
    let drop_delete = format!("DROP TRIGGER IF EXISTS \"{}__crsql_dtrig\"", tbl);
    conn.execute_all(&[
        drop_insert.as_str(),
        drop_update.as_str(),
        drop_delete.as_str(),
    ])?;
    Ok(())
}
