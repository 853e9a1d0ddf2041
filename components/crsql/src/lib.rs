/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Conflict-free replicated relations over SQLite.
//!
//! Attaching to a connection (`crsql::load`) registers the `crsql_*`
//! scalar functions and the `crsql_changes` virtual table. A table is
//! lifted into a replicated one with `SELECT crsql_as_crr('tbl')`: from
//! then on a shadow clock table tracks a version per row and column, and
//! ordinary DML on the table is captured by triggers. Peers exchange
//! changes by reading `crsql_changes` on one side and inserting the rows
//! into `crsql_changes` on the other; merges are idempotent,
//! order-insensitive and converge via last-writer-wins per column.

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

mod changes;
mod clock;
mod consts;
mod crr;
mod error;
mod ext;
mod functions;
mod schema;
mod tableinfo;
mod triggers;
mod util;

pub use crate::error::{Error, Result};

use crate::ext::{ExtState, SharedState};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;

/// Attach the extension to a connection: bootstrap the persisted state
/// (site id, master table, peer tracking), run any pending upgrade, and
/// register the functions, the changes virtual table and the transaction
/// hooks. Call once per connection.
pub fn load(conn: &Connection) -> Result<()> {
    schema::create_peer_tracking_table(conn)?;
    let site_id = schema::load_or_create_site_id(conn)?;
    schema::create_master_table(conn)?;
    schema::maybe_update_db(conn)?;

    let state: SharedState = Arc::new(Mutex::new(ExtState::new(site_id)));
    ext::load_config(conn, &state)?;
    functions::register_all(conn, &state)?;
    changes::register_module(conn, &state)?;

    // All writes in one transaction share one next db_version; the hooks
    // close the epoch. Both paths restart seq at 0, and both invalidate the
    // memoized version (after a rollback the advance never persisted).
    let st = state.clone();
    conn.commit_hook(Some(move || {
        let mut state = st.lock();
        state.db_version = -1;
        state.seq = 0;
        state.rows_impacted = 0;
        false
    }));
    let st = state;
    conn.rollback_hook(Some(move || {
        let mut state = st.lock();
        state.db_version = -1;
        state.seq = 0;
    }));

    Ok(())
}
