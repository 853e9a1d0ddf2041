/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::consts::{PK_DELIM, ROWID_SLAB_SIZE};
use crate::error::{Error, Result};
use crate::tableinfo::ColumnInfo;
use sql_support::escape_ident;

/// Render columns as a comma separated list of quoted identifiers, each
/// optionally prefixed (e.g. with `NEW.` or `OLD.`).
pub fn as_identifier_list(cols: &[ColumnInfo], prefix: &str) -> String {
    cols.iter()
        .map(|c| format!("{}\"{}\"", prefix, escape_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(",")
}

/// The SELECT expression producing the wire encoding of a row's primary
/// keys: `quote(pk1) || '|' || quote(pk2) || ...`.
pub fn pk_quote_concat(pks: &[ColumnInfo], prefix: &str) -> String {
    pks.iter()
        .map(|c| format!("quote({}\"{}\")", prefix, escape_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(&format!(" || '{}' || ", PK_DELIM))
}

/// A WHERE fragment matching each pk column against the corresponding
/// already-quoted literal, e.g. `"a" = 1 AND "b" = 'x'`. The literals come
/// from `split_quote_concat` and are safe to splice.
pub fn pk_where_list(pks: &[ColumnInfo], literals: &[String]) -> String {
    pks.iter()
        .zip(literals.iter())
        .map(|(c, lit)| format!("\"{}\" = {}", escape_ident(&c.name), lit))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Split the pk wire encoding back into its SQL literal segments.
///
/// Segments are exactly what `quote()` emits: `'text'` with doubled inner
/// quotes, `X'hex'` blobs, or bare numerics. NULL pks are forbidden on the
/// wire, so a NULL segment is an error, as is anything unparseable.
pub fn split_quote_concat(input: &str) -> Result<Vec<String>> {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut pos = 0;

    loop {
        let start = pos;
        if pos >= bytes.len() {
            return Err(Error::MalformedPk(format!("empty segment in {:?}", input)));
        }
        match bytes[pos] {
            b'\'' => {
                pos = scan_quoted(input, pos)?;
            }
            b'X' | b'x' if pos + 1 < bytes.len() && bytes[pos + 1] == b'\'' => {
                pos = scan_quoted(input, pos + 1)?;
            }
            _ => {
                // bare token: number. Runs to the next delimiter.
                while pos < bytes.len() && bytes[pos] != PK_DELIM as u8 {
                    pos += 1;
                }
                let tok = &input[start..pos];
                if tok.is_empty() || tok.eq_ignore_ascii_case("NULL") {
                    return Err(Error::MalformedPk(format!(
                        "NULL or empty pk segment in {:?}",
                        input
                    )));
                }
            }
        }
        segments.push(input[start..pos].to_string());
        if pos == bytes.len() {
            return Ok(segments);
        }
        if bytes[pos] != PK_DELIM as u8 {
            return Err(Error::MalformedPk(format!(
                "unexpected byte at offset {} in {:?}",
                pos, input
            )));
        }
        pos += 1;
    }
}

// Advance past a single-quoted literal starting at `open` (the opening
// quote); doubled quotes are escapes. Returns the offset one past the
// closing quote.
fn scan_quoted(input: &str, open: usize) -> Result<usize> {
    let bytes = input.as_bytes();
    let mut pos = open + 1;
    while pos < bytes.len() {
        if bytes[pos] == b'\'' {
            if pos + 1 < bytes.len() && bytes[pos + 1] == b'\'' {
                pos += 2;
                continue;
            }
            return Ok(pos + 1);
        }
        pos += 1;
    }
    Err(Error::MalformedPk(format!(
        "unterminated quote in {:?}",
        input
    )))
}

/// Map a clock-table rowid into the slab for the given table index so that
/// rowids are unique across the union arms of a changes scan.
pub fn slab_rowid(tbl_idx: usize, rowid: i64) -> i64 {
    (tbl_idx as i64) * ROWID_SLAB_SIZE + rowid % ROWID_SLAB_SIZE
}
