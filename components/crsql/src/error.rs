/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The table can't be lifted into a CRR (no primary key, generated
    /// columns, ...). Nothing was changed.
    #[error("table is not compatible with CRRs: {0}")]
    IncompatibleSchema(String),

    /// Reflection over a table failed - it doesn't exist or its definition
    /// can't be used.
    #[error("schema error: {0}")]
    Schema(String),

    /// A merge named a table that is not a CRR here.
    #[error("no such replicated table: {0}")]
    UnknownTable(String),

    /// Something other than INSERT or SELECT hit the changes table.
    #[error("only INSERT and SELECT statements are allowed against the changes table")]
    Misuse,

    /// The primary-key wire encoding could not be decoded.
    #[error("malformed primary key encoding: {0}")]
    MalformedPk(String),

    #[error("error executing SQL: {0}")]
    Sql(#[from] rusqlite::Error),
}

// Registered functions and virtual-table callbacks must hand errors back to
// SQLite as `rusqlite::Error`; anything of ours rides through as a
// user-function error so the message survives to the caller.
impl From<Error> for rusqlite::Error {
    fn from(e: Error) -> rusqlite::Error {
        match e {
            Error::Sql(e) => e,
            e => rusqlite::Error::UserFunctionError(Box::new(e)),
        }
    }
}
