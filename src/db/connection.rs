//! Shared handle to an open replica database.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, Transaction};

use super::error::{DatabaseError, DbResult};
use crate::schema::quote_ident;

/// Cloneable handle to one open replica database.
///
/// All clones share the same connection. Once [`ReplicaDb::close`] runs, every
/// clone reports [`DatabaseError::Closed`].
#[derive(Clone)]
pub struct ReplicaDb {
    name: Arc<str>,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl ReplicaDb {
    pub fn new(name: &str, conn: Connection) -> Self {
        Self {
            name: Arc::from(name),
            conn: Arc::new(Mutex::new(Some(conn))),
        }
    }

    /// Open a standalone in-memory database (for testing).
    pub fn open_in_memory(name: &str) -> DbResult<Self> {
        Ok(Self::new(name, Connection::open_in_memory()?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a closure against the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> DbResult<T>) -> DbResult<T> {
        let guard = self.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| DatabaseError::Closed(self.name.to_string()))?;
        f(conn)
    }

    /// Run a closure inside a transaction.
    ///
    /// Commits when the closure succeeds; rolls back when it fails.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> DbResult<T>) -> DbResult<T> {
        let mut guard = self.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| DatabaseError::Closed(self.name.to_string()))?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> DbResult<i64> {
        self.with_conn(|conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
            Ok(conn.query_row(&sql, [], |row| row.get(0))?)
        })
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&self) -> DbResult<()> {
        let conn = self.lock().take();
        match conn {
            Some(conn) => conn.close().map_err(|(_, e)| e.into()),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Whether two handles refer to the same underlying database.
    pub fn ptr_eq(&self, other: &ReplicaDb) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

impl fmt::Debug for ReplicaDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaDb")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> ReplicaDb {
        let db = ReplicaDb::open_in_memory("test").unwrap();
        db.with_conn(|conn| {
            conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)")?;
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn test_transaction_commits() {
        let db = db();
        db.transaction(|tx| {
            tx.execute("INSERT INTO items (id, label) VALUES (1, 'a')", [])?;
            tx.execute("INSERT INTO items (id, label) VALUES (2, 'b')", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.row_count("items").unwrap(), 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = db();
        let result: DbResult<()> = db.transaction(|tx| {
            tx.execute("INSERT INTO items (id, label) VALUES (1, 'a')", [])?;
            tx.execute("INSERT INTO items (id, label) VALUES (1, 'dup')", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(DatabaseError::Sqlite(_))));
        assert_eq!(db.row_count("items").unwrap(), 0);
    }

    #[test]
    fn test_close_is_shared_and_idempotent() {
        let db = db();
        let clone = db.clone();
        assert!(db.ptr_eq(&clone));

        db.close().unwrap();
        db.close().unwrap();

        assert!(clone.is_closed());
        assert!(matches!(clone.row_count("items"), Err(DatabaseError::Closed(_))));
    }
}
