/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Bytes in a site id.
pub const SITE_ID_LEN: usize = 16;

/// Single-row table holding this database's site id.
pub const TBL_SITE_ID: &str = "crsql_site_id";

/// Key/value table holding the extension version and `config.*` entries.
pub const TBL_MASTER: &str = "crsql_master";

/// Per-peer watermark table. Opaque to the core beyond its shape.
pub const TBL_TRACKED_PEERS: &str = "crsql_tracked_peers";

/// Suffix appended to a base table's name to form its clock table.
pub const CLOCK_TBL_SUFFIX: &str = "__crsql_clock";

/// `__crsql_col_name` sentinel recording a row deletion.
pub const DELETE_SENTINEL: &str = "__crsql_del";

/// `__crsql_col_name` sentinel recording bare row existence (no non-pk
/// data has ever been written).
pub const PKS_ONLY_SENTINEL: &str = "__crsql_pko";

/// Schema version recorded under the `crsqlite_version` master key.
/// `maybe_update_db` migrates anything older on attach.
pub const CRSQLITE_VERSION: i64 = 13_00_00;

/// Master key naming the db_version floor preserved across clock-table
/// compaction.
pub const PRE_COMPACT_DBVERSION_KEY: &str = "pre_compact_dbversion";

/// Enumerates every clock table in the database.
pub const CLOCK_TABLES_SELECT: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '%__crsql_clock'";

/// Separator for the primary-key wire encoding: `quote(pk1) || '|' || ...`
pub const PK_DELIM: char = '|';

/// Rowids handed out by the changes table are slabbed per clock table so
/// they stay unique across union arms.
pub const ROWID_SLAB_SIZE: i64 = 1 << 40;
