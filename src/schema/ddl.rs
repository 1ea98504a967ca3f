//! DDL builders for the local replica tables.
//!
//! Tables are declared with builders and rendered to SQLite DDL. Every statement
//! is existence-guarded so registration can run against an already initialized
//! database.
//!
//! ```ignore
//! use shapesync::schema::{ColumnDef, ColumnType, TableSchema};
//!
//! let table = TableSchema::new("documents")
//!     .column(ColumnDef::new("id", ColumnType::Integer).not_null())
//!     .column(ColumnDef::new("title", ColumnType::Text))
//!     .primary_key(["id"])
//!     .index("idx_documents_title", ["title"]);
//!
//! println!("{}", table.to_sql());
//! ```

/// Column storage types, mapped onto SQLite affinities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    /// Stored as INTEGER 0/1.
    Boolean,
    /// Stored as TEXT holding serialized JSON.
    Json,
    /// Stored as TEXT in ISO-8601 form.
    Timestamp,
}

impl ColumnType {
    /// SQLite type name used in DDL.
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text | ColumnType::Json | ColumnType::Timestamp => "TEXT",
        }
    }
}

/// Column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: ColumnType,
    pub nullable: bool,
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Raw SQL default expression (e.g. `0`, `'draft'`).
    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    fn to_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.data_type.sql_name());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// CREATE INDEX statement.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "DDL statements have no effect until converted to SQL with to_sql()"]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn to_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(&self.name),
            quote_ident(&self.table),
            columns.join(", ")
        )
    }
}

/// A locally mirrored table.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "DDL statements have no effect until converted to SQL with to_sql()"]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, col: ColumnDef) -> Self {
        self.columns.push(col);
        self
    }

    pub fn columns(mut self, cols: impl IntoIterator<Item = ColumnDef>) -> Self {
        self.columns.extend(cols);
        self
    }

    pub fn primary_key(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn index(
        mut self,
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let index = IndexDef::new(name, self.name.clone(), columns);
        self.indexes.push(index);
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// CREATE TABLE IF NOT EXISTS statement.
    pub fn to_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnDef::to_sql).collect();
        if !self.primary_key.is_empty() {
            let pk: Vec<String> = self.primary_key.iter().map(|c| quote_ident(c)).collect();
            parts.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            parts.join(", ")
        )
    }

    /// Table DDL followed by its index DDL, ready for `execute_batch`.
    pub fn to_batch_sql(&self) -> String {
        let mut statements = vec![self.to_sql()];
        statements.extend(self.indexes.iter().map(IndexDef::to_sql));
        statements.join(";\n") + ";"
    }
}

/// Quote an SQLite identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
