/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Query construction for the changes read path: one arm per clock table,
//! a UNION ALL over all of them ordered by `(db_version, seq)`, and the
//! per-row point query that resolves the current column value.

use crate::tableinfo::TableInfo;
use crate::util::{pk_quote_concat, pk_where_list};
use sql_support::{escape_ident, escape_text};
use std::os::raw::c_int;

// Declared column order of the virtual table.
pub const COL_TBL: c_int = 0;
pub const COL_PK: c_int = 1;
pub const COL_CID: c_int = 2;
pub const COL_VAL: c_int = 3;
pub const COL_COL_VERSION: c_int = 4;
pub const COL_DB_VERSION: c_int = 5;
pub const COL_SITE_ID: c_int = 6;
pub const COL_SEQ: c_int = 7;

// idxNum bits reported by the planner.
pub const IDX_HAS_DB_VERSION: c_int = 2;
pub const IDX_HAS_SITE_ID: c_int = 4;

pub const CHANGES_VTAB_SCHEMA: &str =
    "CREATE TABLE x([table] TEXT NOT NULL, [pk] TEXT NOT NULL, [cid] TEXT NOT NULL, \
     [val] ANY, [col_version] INTEGER NOT NULL, [db_version] INTEGER NOT NULL, \
     [site_id] BLOB, [seq] HIDDEN INTEGER NOT NULL)";

/// The physical clock column a virtual-table constraint folds down onto.
/// `table`, `pk` and `val` don't exist in the clock tables; constraints on
/// them are left for SQLite to evaluate.
pub fn constraint_column_name(col: c_int) -> Option<&'static str> {
    match col {
        COL_CID => Some("__crsql_col_name"),
        COL_COL_VERSION => Some("__crsql_col_version"),
        COL_DB_VERSION => Some("__crsql_db_version"),
        COL_SITE_ID => Some("__crsql_site_id"),
        _ => None,
    }
}

/// SQL text for a constraint operator, or None for ones we can't fold.
pub fn operator_sql(op: rusqlite::vtab::IndexConstraintOp) -> Option<&'static str> {
    use rusqlite::vtab::IndexConstraintOp::*;
    match op {
        SQLITE_INDEX_CONSTRAINT_EQ => Some("="),
        SQLITE_INDEX_CONSTRAINT_NE => Some("!="),
        SQLITE_INDEX_CONSTRAINT_GT => Some(">"),
        SQLITE_INDEX_CONSTRAINT_GE => Some(">="),
        SQLITE_INDEX_CONSTRAINT_LT => Some("<"),
        SQLITE_INDEX_CONSTRAINT_LE => Some("<="),
        SQLITE_INDEX_CONSTRAINT_IS => Some("IS"),
        SQLITE_INDEX_CONSTRAINT_ISNOT => Some("IS NOT"),
        SQLITE_INDEX_CONSTRAINT_ISNULL => Some("IS NULL"),
        SQLITE_INDEX_CONSTRAINT_ISNOTNULL => Some("IS NOT NULL"),
        SQLITE_INDEX_CONSTRAINT_LIKE => Some("LIKE"),
        SQLITE_INDEX_CONSTRAINT_GLOB => Some("GLOB"),
        SQLITE_INDEX_CONSTRAINT_MATCH => Some("MATCH"),
        SQLITE_INDEX_CONSTRAINT_REGEXP => Some("REGEXP"),
        _ => None,
    }
}

// Column order the cursor reads back out of the union statement.
pub const READ_TBL: usize = 0;
pub const READ_PKS: usize = 1;
pub const READ_CID: usize = 2;
pub const READ_COL_VERSION: usize = 3;
pub const READ_DB_VERSION: usize = 4;
pub const READ_SITE_ID: usize = 5;
pub const READ_ROWID: usize = 6;
pub const READ_SEQ: usize = 7;

fn changes_query_for_table(info: &TableInfo, where_frag: &str) -> String {
    let where_clause = if where_frag.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_frag)
    };
    format!(
        "SELECT '{tbl_val}' AS tbl, {pk_concat} AS pks, \
         \"__crsql_col_name\" AS cid, \"__crsql_col_version\" AS col_vrsn, \
         \"__crsql_db_version\" AS db_vrsn, \"__crsql_site_id\" AS site_id, \
         rowid, \"__crsql_seq\" AS seq \
         FROM \"{clock}\"{where_clause}",
        tbl_val = escape_text(&info.tbl_name),
        pk_concat = pk_quote_concat(&info.pks, ""),
        clock = escape_ident(&info.clock_tbl_name()),
        where_clause = where_clause,
    )
}

/// The full scan statement. The same WHERE fragment is repeated in every
/// arm, so parameters bind once per arm in fragment order.
pub fn changes_union_query(infos: &[TableInfo], where_frag: &str) -> String {
    let arms = infos
        .iter()
        .map(|info| changes_query_for_table(info, where_frag))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    format!(
        "SELECT tbl, pks, cid, col_vrsn, db_vrsn, site_id, rowid, seq FROM ({}) \
         ORDER BY db_vrsn, seq ASC",
        arms
    )
}

/// Fetch the current value of one cell, identified by the decoded pk
/// literals. The row may be gone by the time this runs; the caller treats
/// that as a NULL value, not an error.
pub fn row_patch_data_query(info: &TableInfo, cid: &str, pk_literals: &[String]) -> String {
    format!(
        "SELECT \"{col}\" FROM \"{tbl}\" WHERE {pks}",
        col = escape_ident(cid),
        tbl = escape_ident(&info.tbl_name),
        pks = pk_where_list(&info.pks, pk_literals),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tableinfo::pull_table_info;
    use rusqlite::Connection;

    fn infos() -> Vec<TableInfo> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE kv (id INTEGER PRIMARY KEY, v TEXT);
             CREATE TABLE pair (a INTEGER NOT NULL, b TEXT NOT NULL, x, PRIMARY KEY (a, b));",
        )
        .unwrap();
        vec![
            pull_table_info(&conn, "kv").unwrap(),
            pull_table_info(&conn, "pair").unwrap(),
        ]
    }

    #[test]
    fn test_union_query_shape() {
        let sql = changes_union_query(&infos(), "\"__crsql_db_version\" > ?");
        assert_eq!(sql.matches("UNION ALL").count(), 1);
        assert_eq!(sql.matches("WHERE \"__crsql_db_version\" > ?").count(), 2);
        assert!(sql.ends_with("ORDER BY db_vrsn, seq ASC"));
        assert!(sql.contains("quote(\"a\") || '|' || quote(\"b\")"));
    }

    #[test]
    fn test_union_query_without_filter() {
        let sql = changes_union_query(&infos()[..1], "");
        assert!(!sql.contains("WHERE"));
        assert!(sql.contains("FROM \"kv__crsql_clock\""));
    }

    #[test]
    fn test_row_patch_query_uses_literals() {
        let infos = infos();
        let sql = row_patch_data_query(&infos[1], "x", &["1".into(), "'b''c'".into()]);
        assert_eq!(
            sql,
            "SELECT \"x\" FROM \"pair\" WHERE \"a\" = 1 AND \"b\" = 'b''c'"
        );
    }
}
