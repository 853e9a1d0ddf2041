/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::{
    self, types::FromSql, Connection, Params, Result as SqlResult, Row, Savepoint, Transaction,
};
use std::ops::Deref;

use crate::maybe_cached::MaybeCached;

/// This trait exists so that we can use these helpers on
/// `rusqlite::{Transaction, Connection}`. Note that you must import ConnExt
/// in order to call these methods on anything.
pub trait ConnExt {
    /// The method you need to implement to opt in to all of this.
    fn conn(&self) -> &Connection;

    /// Get a cached or uncached statement based on a flag.
    fn prepare_maybe_cached<'conn>(
        &'conn self,
        sql: &str,
        cache: bool,
    ) -> SqlResult<MaybeCached<'conn>> {
        MaybeCached::prepare(self.conn(), sql, cache)
    }

    /// Execute all the provided statements.
    fn execute_all(&self, stmts: &[&str]) -> SqlResult<()> {
        let conn = self.conn();
        for sql in stmts {
            conn.execute(sql, [])?;
        }
        Ok(())
    }

    /// Equivalent to `Connection::execute` but caches the statement so that
    /// subsequent calls will have improved performance.
    fn execute_cached<P: Params>(&self, sql: &str, params: P) -> SqlResult<usize> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.execute(params)
    }

    /// Execute a query that returns a single result column, and return that
    /// result.
    fn query_one<T: FromSql>(&self, sql: &str) -> SqlResult<T> {
        let res: T = self.conn().query_row_and_then(sql, [], |row| row.get(0))?;
        Ok(res)
    }

    /// Like `query_row_and_then` but returns None instead of erroring if no
    /// such row exists, and allows passing a flag to indicate that the
    /// statement should be cached.
    fn try_query_row<T, E, P, F>(
        &self,
        sql: &str,
        params: P,
        mapper: F,
        cache: bool,
    ) -> Result<Option<T>, E>
    where
        Self: Sized,
        P: Params,
        E: From<rusqlite::Error>,
        F: FnOnce(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = MaybeCached::prepare(conn, sql, cache)?;
        let mut rows = stmt.query(params)?;
        Ok(match rows.next()? {
            None => None,
            Some(row) => Some(mapper(row)?),
        })
    }

    /// Execute a query that returns a single optional result column.
    fn try_query_one<T: FromSql, P: Params>(
        &self,
        sql: &str,
        params: P,
        cache: bool,
    ) -> SqlResult<Option<T>>
    where
        Self: Sized,
    {
        self.try_query_row(sql, params, |row| row.get(0), cache)
    }

    /// Open a named savepoint on a shared connection borrow.
    fn unchecked_savepoint<'conn>(&'conn self, name: &str) -> SqlResult<UncheckedSavepoint<'conn>> {
        UncheckedSavepoint::new(self.conn(), name)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl<'conn> ConnExt for Transaction<'conn> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl<'conn> ConnExt for Savepoint<'conn> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

/// rusqlite, in an attempt to save us from ourselves, needs a mutable ref to
/// a connection to open a savepoint. That doesn't work inside SQLite
/// callbacks, where only a shared borrow of the connection exists, so we
/// offer this as an alternative - but the responsibility of pairing names
/// correctly is on our head.
///
/// The savepoint is rolled back and released on drop unless `commit` was
/// called, so an early `?` return cannot leave partial state behind.
pub struct UncheckedSavepoint<'conn> {
    conn: &'conn Connection,
    name: String,
    committed: bool,
}

impl<'conn> UncheckedSavepoint<'conn> {
    pub fn new(conn: &'conn Connection, name: &str) -> SqlResult<Self> {
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(UncheckedSavepoint {
            conn,
            name: name.to_string(),
            committed: false,
        })
    }

    /// Consumes and releases the savepoint, making its writes part of the
    /// enclosing transaction.
    pub fn commit(mut self) -> SqlResult<()> {
        self.conn
            .execute_batch(&format!("RELEASE {}", self.name))?;
        self.committed = true;
        Ok(())
    }

    fn rollback_(&self) -> SqlResult<()> {
        // ROLLBACK TO leaves the savepoint on the stack, so release it too.
        self.conn.execute_batch(&format!(
            "ROLLBACK TO {name}; RELEASE {name}",
            name = self.name
        ))
    }
}

impl<'conn> Deref for UncheckedSavepoint<'conn> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl<'conn> Drop for UncheckedSavepoint<'conn> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.rollback_() {
                log::warn!("Error dropping an unchecked savepoint: {}", e);
            }
        }
    }
}

impl<'conn> ConnExt for UncheckedSavepoint<'conn> {
    #[inline]
    fn conn(&self) -> &Connection {
        self.conn
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn harness() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(x INTEGER)").unwrap();
        conn
    }

    #[test]
    fn test_unchecked_savepoint_commit() {
        let conn = harness();
        let sp = conn.unchecked_savepoint("sp_test").unwrap();
        sp.execute("INSERT INTO t(x) VALUES (1)", []).unwrap();
        sp.commit().unwrap();
        assert_eq!(conn.query_one::<i64>("SELECT count(*) FROM t").unwrap(), 1);
    }

    #[test]
    fn test_unchecked_savepoint_rollback_on_drop() {
        let conn = harness();
        {
            let sp = conn.unchecked_savepoint("sp_test").unwrap();
            sp.execute("INSERT INTO t(x) VALUES (1)", []).unwrap();
            // dropped without commit
        }
        assert_eq!(conn.query_one::<i64>("SELECT count(*) FROM t").unwrap(), 0);
        // the savepoint stack is empty again, so a transaction can be opened
        conn.execute_batch("BEGIN; COMMIT;").unwrap();
    }

    #[test]
    fn test_try_query_one() {
        let conn = harness();
        conn.execute("INSERT INTO t(x) VALUES (42)", []).unwrap();
        assert_eq!(
            conn.try_query_one::<i64, _>("SELECT x FROM t WHERE x = ?", [42], false)
                .unwrap(),
            Some(42)
        );
        assert_eq!(
            conn.try_query_one::<i64, _>("SELECT x FROM t WHERE x = ?", [7], false)
                .unwrap(),
            None
        );
    }
}
