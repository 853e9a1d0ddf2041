/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The scalar functions the extension registers on attach. The generated
//! triggers call the version/seq/sync-bit functions, so their flags must
//! allow use from inside trigger programs; the schema-modifying ones are
//! direct-only.

use crate::crr;
use crate::error::Result;
use crate::ext::{self, SharedState};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::Value;
use rusqlite::Connection;

// `crsql_as_crr('tbl')` or `crsql_as_crr('main', 'tbl')`
fn table_args(ctx: &Context<'_>, fn_name: &str) -> rusqlite::Result<(String, String)> {
    match ctx.len() {
        1 => Ok(("main".to_string(), ctx.get::<String>(0)?)),
        2 => Ok((ctx.get::<String>(0)?, ctx.get::<String>(1)?)),
        n => Err(rusqlite::Error::UserFunctionError(
            format!(
                "wrong number of args ({}) provided to {}; provide the schema \
                 name and table name or just the table name",
                n, fn_name
            )
            .into(),
        )),
    }
}

pub fn register_all(conn: &Connection, state: &SharedState) -> Result<()> {
    let st = state.clone();
    conn.create_scalar_function(
        "crsql_siteid",
        0,
        // the site id never changes: deterministic and innocuous
        FunctionFlags::SQLITE_UTF8
            | FunctionFlags::SQLITE_INNOCUOUS
            | FunctionFlags::SQLITE_DETERMINISTIC,
        move |_ctx| Ok(st.lock().site_id.to_vec()),
    )?;

    let st = state.clone();
    conn.create_scalar_function(
        "crsql_dbversion",
        0,
        // can change on each invocation
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
        move |ctx| {
            let conn = unsafe { ctx.get_connection()? };
            Ok(ext::db_version(&conn, &st)?)
        },
    )?;

    let st = state.clone();
    conn.create_scalar_function(
        "crsql_nextdbversion",
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
        move |ctx| {
            let conn = unsafe { ctx.get_connection()? };
            Ok(ext::next_db_version(&conn, &st)?)
        },
    )?;

    let st = state.clone();
    conn.create_scalar_function(
        "crsql_increment_and_get_seq",
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
        move |_ctx| {
            let mut state = st.lock();
            let seq = state.seq;
            state.seq += 1;
            Ok(seq)
        },
    )?;

    let st = state.clone();
    conn.create_scalar_function(
        "crsql_get_seq",
        0,
        FunctionFlags::SQLITE_UTF8
            | FunctionFlags::SQLITE_INNOCUOUS
            | FunctionFlags::SQLITE_DETERMINISTIC,
        move |_ctx| Ok(st.lock().seq),
    )?;

    conn.create_scalar_function(
        "crsql_as_crr",
        -1,
        // does a great deal to modify database state: top level only
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DIRECTONLY,
        move |ctx| {
            let (schema, tbl) = table_args(ctx, "crsql_as_crr")?;
            let conn = unsafe { ctx.get_connection()? };
            crr::as_crr(&conn, &schema, &tbl)?;
            Ok(Value::Null)
        },
    )?;

    conn.create_scalar_function(
        "crsql_begin_alter",
        -1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DIRECTONLY,
        move |ctx| {
            let (schema, tbl) = table_args(ctx, "crsql_begin_alter")?;
            let conn = unsafe { ctx.get_connection()? };
            crr::begin_alter(&conn, &schema, &tbl)?;
            Ok(Value::Null)
        },
    )?;

    let st = state.clone();
    conn.create_scalar_function(
        "crsql_commit_alter",
        -1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DIRECTONLY,
        move |ctx| {
            let (schema, tbl) = table_args(ctx, "crsql_commit_alter")?;
            let conn = unsafe { ctx.get_connection()? };
            crr::commit_alter(&conn, &st, &schema, &tbl)?;
            Ok(Value::Null)
        },
    )?;

    conn.create_scalar_function(
        "crsql_finalize",
        -1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DIRECTONLY,
        move |ctx| {
            let conn = unsafe { ctx.get_connection()? };
            conn.flush_prepared_statement_cache();
            Ok(Value::Null)
        },
    )?;

    let st = state.clone();
    conn.create_scalar_function(
        "crsql_rows_impacted",
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
        move |_ctx| Ok(st.lock().rows_impacted),
    )?;

    // Read with no args, set with one. Triggers check this so that applying
    // remote changes doesn't loop back into the clock tables.
    let st = state.clone();
    conn.create_scalar_function(
        "crsql_internal_sync_bit",
        -1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
        move |ctx| {
            let mut state = st.lock();
            if ctx.len() > 0 {
                state.sync_bit = ctx.get::<i64>(0)?;
            }
            Ok(state.sync_bit)
        },
    )?;

    Ok(())
}
