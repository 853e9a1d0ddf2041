/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

mod conn_ext;
mod maybe_cached;

pub use crate::conn_ext::*;
pub use crate::maybe_cached::*;

/// Escape a string for interpolation into a SQL statement as a quoted
/// identifier. The only character that needs escaping is the double quote,
/// which is escaped by doubling it; the caller supplies the surrounding
/// quotes.
pub fn escape_ident(s: &str) -> String {
    s.replace('"', "\"\"")
}

/// Escape a string for interpolation into a SQL statement as a single-quoted
/// text literal. As with identifiers, quotes are escaped by doubling them.
pub fn escape_text(s: &str) -> String {
    s.replace('\'', "''")
}
