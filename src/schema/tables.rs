//! The fixed set of application tables populated by shapes.

use super::ddl::{ColumnDef, ColumnType, TableSchema};

pub fn documents() -> TableSchema {
    TableSchema::new("documents")
        .columns([
            ColumnDef::new("id", ColumnType::Integer).not_null(),
            ColumnDef::new("search_space_id", ColumnType::Integer).not_null(),
            ColumnDef::new("title", ColumnType::Text).not_null(),
            ColumnDef::new("document_type", ColumnType::Text).not_null(),
            ColumnDef::new("document_metadata", ColumnType::Json),
            ColumnDef::new("created_at", ColumnType::Timestamp).not_null(),
        ])
        .primary_key(["id"])
        .index("idx_documents_search_space_id", ["search_space_id"])
        .index("idx_documents_type", ["document_type"])
}

pub fn search_source_connectors() -> TableSchema {
    TableSchema::new("search_source_connectors")
        .columns([
            ColumnDef::new("id", ColumnType::Integer).not_null(),
            ColumnDef::new("search_space_id", ColumnType::Integer).not_null(),
            ColumnDef::new("user_id", ColumnType::Text).not_null(),
            ColumnDef::new("name", ColumnType::Text).not_null(),
            ColumnDef::new("connector_type", ColumnType::Text).not_null(),
            ColumnDef::new("is_indexable", ColumnType::Boolean)
                .not_null()
                .default_expr("0"),
            ColumnDef::new("last_indexed_at", ColumnType::Timestamp),
            ColumnDef::new("config", ColumnType::Json),
            ColumnDef::new("created_at", ColumnType::Timestamp).not_null(),
        ])
        .primary_key(["id"])
        .index(
            "idx_connectors_search_space_id",
            ["search_space_id"],
        )
        .index("idx_connectors_user_id", ["user_id"])
}

pub fn notifications() -> TableSchema {
    TableSchema::new("notifications")
        .columns([
            ColumnDef::new("id", ColumnType::Integer).not_null(),
            ColumnDef::new("user_id", ColumnType::Text).not_null(),
            ColumnDef::new("search_space_id", ColumnType::Integer),
            ColumnDef::new("type", ColumnType::Text).not_null(),
            ColumnDef::new("title", ColumnType::Text).not_null(),
            ColumnDef::new("message", ColumnType::Text).not_null(),
            ColumnDef::new("read", ColumnType::Boolean)
                .not_null()
                .default_expr("0"),
            ColumnDef::new("metadata", ColumnType::Json),
            ColumnDef::new("created_at", ColumnType::Timestamp).not_null(),
            ColumnDef::new("updated_at", ColumnType::Timestamp),
        ])
        .primary_key(["id"])
        .index("idx_notifications_user_id", ["user_id"])
        .index("idx_notifications_user_read", ["user_id", "read"])
}

/// Every table a shape may target.
pub fn all() -> Vec<TableSchema> {
    vec![documents(), search_source_connectors(), notifications()]
}
