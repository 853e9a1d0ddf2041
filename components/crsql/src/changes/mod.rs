/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The `crsql_changes` virtual table. Reading it enumerates the change
//! stream a peer needs to catch up; inserting into it merges changes
//! received from a peer. UPDATE and DELETE are refused.

pub mod read;
pub mod write;

use crate::consts::{DELETE_SENTINEL, PKS_ONLY_SENTINEL};
use crate::error::Error;
use crate::ext::{self, SharedState};
use crate::util::{slab_rowid, split_quote_concat};
use self::read::*;
use rusqlite::types::{Value, ValueRef};
use rusqlite::vtab::{
    update_module, Context, CreateVTab, IndexInfo, UpdateVTab, VTab, VTabConnection, VTabCursor,
    VTabKind, Values,
};
use rusqlite::{ffi, params_from_iter, Connection, OptionalExtension};
use std::marker::PhantomData;
use std::os::raw::c_int;

/// Register the module and materialize a per-connection instance in the
/// temp schema so plain `SELECT ... FROM crsql_changes` works.
pub fn register_module(conn: &Connection, state: &SharedState) -> crate::error::Result<()> {
    conn.create_module(
        "crsql_changes",
        update_module::<ChangesVTab>(),
        Some(state.clone()),
    )?;
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS temp.crsql_changes USING crsql_changes",
    )?;
    Ok(())
}

#[repr(C)]
pub struct ChangesVTab {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab,
    db: *mut ffi::sqlite3,
    state: SharedState,
}

unsafe impl<'vtab> VTab<'vtab> for ChangesVTab {
    type Aux = SharedState;
    type Cursor = ChangesCursor<'vtab>;

    fn connect(
        db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        _args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let state = aux
            .ok_or_else(|| rusqlite::Error::ModuleError("missing extension state".to_string()))?
            .clone();
        let vtab = ChangesVTab {
            base: ffi::sqlite3_vtab::default(),
            db: unsafe { db.handle() },
            state,
        };
        Ok((CHANGES_VTAB_SCHEMA.to_string(), vtab))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let mut fragment = String::new();
        let mut idx_num: c_int = 0;
        // fragment-order positions of constraints we consumed; argv indices
        // are assigned in the same order the fragments were appended
        let mut consumed: Vec<(usize, bool)> = Vec::new();

        for (i, constraint) in info.constraints().enumerate() {
            if !constraint.is_usable() {
                continue;
            }
            let col_name = match constraint_column_name(constraint.column()) {
                Some(name) => name,
                None => continue,
            };
            let op = match operator_sql(constraint.operator()) {
                Some(op) => op,
                None => continue,
            };

            if !fragment.is_empty() {
                fragment.push_str(" AND ");
            }
            let takes_arg = !matches!(op, "IS NULL" | "IS NOT NULL");
            if takes_arg {
                fragment.push_str(&format!("\"{}\" {} ?", col_name, op));
            } else {
                fragment.push_str(&format!("\"{}\" {}", col_name, op));
            }
            consumed.push((i, takes_arg));

            match constraint.column() {
                COL_DB_VERSION => idx_num |= IDX_HAS_DB_VERSION,
                COL_SITE_ID => idx_num |= IDX_HAS_SITE_ID,
                _ => {}
            }
        }

        let mut argv_index = 1;
        for (i, takes_arg) in consumed {
            let mut usage = info.constraint_usage(i);
            if takes_arg {
                usage.set_argv_index(argv_index);
                argv_index += 1;
            }
            usage.set_omit(true);
        }

        if idx_num & (IDX_HAS_DB_VERSION | IDX_HAS_SITE_ID)
            == IDX_HAS_DB_VERSION | IDX_HAS_SITE_ID
        {
            info.set_estimated_cost(1.0);
            info.set_estimated_rows(1);
        } else if idx_num & IDX_HAS_DB_VERSION == IDX_HAS_DB_VERSION {
            info.set_estimated_cost(10.0);
            info.set_estimated_rows(10);
        } else {
            info.set_estimated_cost(2_147_483_647.0);
            info.set_estimated_rows(2_147_483_647);
        }

        info.set_idx_num(idx_num);
        info.set_idx_str(&fragment);
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<Self::Cursor> {
        Ok(ChangesCursor {
            base: ffi::sqlite3_vtab_cursor::default(),
            rows: Vec::new(),
            pos: 0,
            phantom: PhantomData,
        })
    }
}

impl<'vtab> CreateVTab<'vtab> for ChangesVTab {
    const KIND: VTabKind = VTabKind::Default;
}

impl<'vtab> UpdateVTab<'vtab> for ChangesVTab {
    fn delete(&mut self, _arg: ValueRef<'_>) -> rusqlite::Result<()> {
        Err(Error::Misuse.into())
    }

    fn insert(&mut self, args: &Values<'_>) -> rusqlite::Result<i64> {
        Ok(write::merge_insert(self.db, &self.state, args)?)
    }

    fn update(&mut self, _args: &Values<'_>) -> rusqlite::Result<()> {
        Err(Error::Misuse.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowType {
    Update,
    Delete,
    PkOnly,
}

pub fn row_type_for_cid(cid: &str) -> RowType {
    match cid {
        DELETE_SENTINEL => RowType::Delete,
        PKS_ONLY_SENTINEL => RowType::PkOnly,
        _ => RowType::Update,
    }
}

struct ChangeRow {
    tbl: String,
    pks: String,
    cid: String,
    val: Value,
    col_version: i64,
    db_version: i64,
    site_id: Value,
    seq: i64,
    rowid: i64,
}

#[repr(C)]
pub struct ChangesCursor<'vtab> {
    /// Base class. Must be first
    base: ffi::sqlite3_vtab_cursor,
    rows: Vec<ChangeRow>,
    pos: usize,
    phantom: PhantomData<&'vtab ChangesVTab>,
}

impl ChangesCursor<'_> {
    fn vtab(&self) -> &ChangesVTab {
        unsafe { &*(self.base.pVtab as *const ChangesVTab) }
    }
}

unsafe impl VTabCursor for ChangesCursor<'_> {
    /// Run the filtered union over every clock table and resolve row values
    /// up front. Statements can't outlive this call (they borrow the
    /// connection), so the scan is materialized rather than streamed.
    fn filter(
        &mut self,
        _idx_num: c_int,
        idx_str: Option<&str>,
        args: &Values<'_>,
    ) -> rusqlite::Result<()> {
        self.rows.clear();
        self.pos = 0;

        let vtab = self.vtab();
        let conn = unsafe { Connection::from_handle(vtab.db) }?;
        let infos = ext::ensure_table_infos(&conn, &vtab.state)?;
        if infos.is_empty() {
            // no crrs exist: nothing to fetch
            return Ok(());
        }

        let fragment = idx_str.unwrap_or("");
        let sql = changes_union_query(&infos, fragment);

        // the same fragment appears in every union arm, so the argv values
        // bind once per arm
        let arg_values = (0..args.len())
            .map(|i| args.get::<Value>(i))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let repeated = std::iter::repeat(arg_values.iter().cloned())
            .take(infos.len())
            .flatten()
            .collect::<Vec<_>>();

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(repeated))?;
        while let Some(row) = rows.next()? {
            let tbl: String = row.get(READ_TBL)?;
            let pks: String = row.get(READ_PKS)?;
            let cid: String = row.get(READ_CID)?;
            let col_version: i64 = row.get(READ_COL_VERSION)?;
            let db_version: i64 = row.get(READ_DB_VERSION)?;
            let site_id: Value = row.get(READ_SITE_ID)?;
            let clock_rowid: i64 = row.get(READ_ROWID)?;
            let seq: i64 = row.get(READ_SEQ)?;

            let tbl_idx = infos
                .iter()
                .position(|info| info.tbl_name == tbl)
                .ok_or_else(|| {
                    rusqlite::Error::ModuleError(format!("no schema information for {}", tbl))
                })?;

            let val = match row_type_for_cid(&cid) {
                RowType::Delete | RowType::PkOnly => Value::Null,
                RowType::Update => {
                    let literals = split_quote_concat(&pks).map_err(rusqlite::Error::from)?;
                    let patch_sql = row_patch_data_query(&infos[tbl_idx], &cid, &literals);
                    // the row may have been deleted since the clock entry
                    // was scanned; the change still goes out and the
                    // receiver discards it by version comparison
                    conn.query_row(&patch_sql, [], |r| r.get::<_, Value>(0))
                        .optional()?
                        .unwrap_or(Value::Null)
                }
            };

            self.rows.push(ChangeRow {
                tbl,
                pks,
                cid,
                val,
                col_version,
                db_version,
                site_id,
                seq,
                rowid: slab_rowid(tbl_idx, clock_rowid),
            });
        }
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.pos += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.pos >= self.rows.len()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let row = &self.rows[self.pos];
        match i {
            COL_TBL => ctx.set_result(&row.tbl),
            COL_PK => ctx.set_result(&row.pks),
            COL_CID => ctx.set_result(&row.cid),
            COL_VAL => ctx.set_result(&row.val),
            COL_COL_VERSION => ctx.set_result(&row.col_version),
            COL_DB_VERSION => ctx.set_result(&row.db_version),
            COL_SITE_ID => ctx.set_result(&row.site_id),
            COL_SEQ => ctx.set_result(&row.seq),
            n => Err(rusqlite::Error::ModuleError(format!(
                "unknown changes column {}",
                n
            ))),
        }
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.rows[self.pos].rowid)
    }
}
