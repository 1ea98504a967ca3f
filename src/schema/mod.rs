//! Schema registration for local replicas.
//!
//! Declares the tables shapes populate plus two internal tables:
//!
//! ```text
//! _meta                  key -> value (schema_version)
//! _shape_subscriptions   shape_key -> (remote handle, shape_offset, updated_at)
//! ```
//!
//! Registration is idempotent and versioned: when the stored version differs
//! from the registry's, replicated rows and resume offsets are cleared so the
//! next sync re-snapshots.

mod ddl;
pub mod tables;

pub use ddl::{quote_ident, ColumnDef, ColumnType, IndexDef, TableSchema};

use rusqlite::{params, Connection, OptionalExtension};

/// Current local schema version. Bump this when a mirrored table changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Internal key-value table.
pub const META_TABLE: &str = "_meta";

/// Internal table holding per-shape resume state.
pub const SUBSCRIPTIONS_TABLE: &str = "_shape_subscriptions";

/// Errors that can occur while registering the schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Table '{0}' is declared more than once")]
    DuplicateTable(String),

    #[error("Table '{table}' declares primary key column '{column}' that does not exist")]
    MissingPrimaryKeyColumn { table: String, column: String },
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// The set of tables a replica database carries.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    tables: Vec<TableSchema>,
    version: u32,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self {
            tables: tables::all(),
            version: SCHEMA_VERSION,
        }
    }
}

impl SchemaRegistry {
    /// Registry with the default application tables at the given version.
    pub fn new(version: u32) -> Self {
        Self {
            tables: tables::all(),
            version,
        }
    }

    /// Registry with a custom table set.
    pub fn with_tables(version: u32, tables: Vec<TableSchema>) -> SchemaResult<Self> {
        for (i, table) in tables.iter().enumerate() {
            if tables[..i].iter().any(|t| t.name == table.name) {
                return Err(SchemaError::DuplicateTable(table.name.clone()));
            }
            if let Some(column) = table.primary_key.iter().find(|c| !table.has_column(c)) {
                return Err(SchemaError::MissingPrimaryKeyColumn {
                    table: table.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(Self { tables, version })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    /// Look up a mirrored table by name.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Apply all DDL and reconcile the stored schema version.
    ///
    /// Runs in a single transaction; a failure leaves the database untouched.
    pub fn register(&self, conn: &Connection) -> SchemaResult<()> {
        let tx = conn.unchecked_transaction()?;

        tx.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {META_TABLE} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {SUBSCRIPTIONS_TABLE} (
                shape_key TEXT PRIMARY KEY,
                handle TEXT,
                shape_offset TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "
        ))?;

        for table in &self.tables {
            tx.execute_batch(&table.to_batch_sql())?;
        }

        let stored_version: Option<u32> = tx
            .query_row(
                &format!("SELECT value FROM {META_TABLE} WHERE key = 'schema_version'"),
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .optional()?;

        match stored_version {
            Some(v) if v == self.version => {}
            Some(v) => {
                tracing::info!(
                    stored = v,
                    current = self.version,
                    "schema version changed, clearing replicated rows"
                );
                self.clear_replicated(&tx)?;
                self.set_version(&tx)?;
            }
            None => self.set_version(&tx)?,
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete every replicated row and all resume offsets.
    fn clear_replicated(&self, conn: &Connection) -> SchemaResult<()> {
        for table in &self.tables {
            conn.execute(&format!("DELETE FROM {}", quote_ident(&table.name)), [])?;
        }
        conn.execute(&format!("DELETE FROM {SUBSCRIPTIONS_TABLE}"), [])?;
        Ok(())
    }

    fn set_version(&self, conn: &Connection) -> SchemaResult<()> {
        conn.execute(
            &format!("INSERT OR REPLACE INTO {META_TABLE} (key, value) VALUES ('schema_version', ?)"),
            params![self.version.to_string()],
        )?;
        Ok(())
    }
}

/// Read the schema version recorded in a registered database.
pub fn stored_version(conn: &Connection) -> SchemaResult<Option<u32>> {
    let value: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {META_TABLE} WHERE key = 'schema_version'"),
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}
