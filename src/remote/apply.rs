//! Writing shape changes and stream positions to the replica.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::protocol::{ChangeMessage, Operation};
use crate::db::DbResult;
use crate::schema::{quote_ident, SUBSCRIPTIONS_TABLE};
use crate::shape::TransportError;

/// A change with its values converted for SQLite.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub operation: Operation,
    /// Provided columns, in message order.
    pub values: Vec<(String, SqlValue)>,
    /// Primary key values, in key order.
    pub key: Vec<SqlValue>,
}

/// Convert a JSON value to the SQLite value stored for it.
///
/// Booleans become 0/1; arrays and objects are stored as JSON text.
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Validate and convert messages before any of them is written.
pub fn prepare_changes(
    changes: &[ChangeMessage],
    primary_key: &[String],
) -> Result<Vec<RowChange>, TransportError> {
    changes
        .iter()
        .map(|change| {
            let key = primary_key
                .iter()
                .map(|column| {
                    change.value.get(column).map(to_sql_value).ok_or_else(|| {
                        TransportError::Decode(format!(
                            "change {} is missing primary key column '{column}'",
                            change.key
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let values = change
                .value
                .iter()
                .map(|(column, value)| (column.clone(), to_sql_value(value)))
                .collect();
            Ok(RowChange {
                operation: change.headers.operation,
                values,
                key,
            })
        })
        .collect()
}

/// Apply prepared changes to `table`. Returns the number of changes applied.
///
/// Inserts upsert on the primary key, updates touch only provided columns,
/// deletes remove by key. Run inside a transaction.
pub fn apply_changes(
    conn: &Connection,
    table: &str,
    primary_key: &[String],
    changes: &[RowChange],
) -> DbResult<usize> {
    let table_ident = quote_ident(table);
    let key_predicate = primary_key
        .iter()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");

    for change in changes {
        match change.operation {
            Operation::Insert => {
                let columns: Vec<String> =
                    change.values.iter().map(|(c, _)| quote_ident(c)).collect();
                let placeholders = vec!["?"; columns.len()].join(", ");
                let updates: Vec<String> = change
                    .values
                    .iter()
                    .filter(|(c, _)| !primary_key.contains(c))
                    .map(|(c, _)| format!("{0} = excluded.{0}", quote_ident(c)))
                    .collect();
                let conflict_target: Vec<String> =
                    primary_key.iter().map(|c| quote_ident(c)).collect();
                let on_conflict = if updates.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    format!("DO UPDATE SET {}", updates.join(", "))
                };
                let sql = format!(
                    "INSERT INTO {table_ident} ({}) VALUES ({placeholders}) ON CONFLICT ({}) {on_conflict}",
                    columns.join(", "),
                    conflict_target.join(", "),
                );
                conn.execute(&sql, params_from_iter(change.values.iter().map(|(_, v)| v)))?;
            }
            Operation::Update => {
                let assigned: Vec<&(String, SqlValue)> = change
                    .values
                    .iter()
                    .filter(|(c, _)| !primary_key.contains(c))
                    .collect();
                if assigned.is_empty() {
                    continue;
                }
                let sets: Vec<String> = assigned
                    .iter()
                    .map(|(c, _)| format!("{} = ?", quote_ident(c)))
                    .collect();
                let sql = format!(
                    "UPDATE {table_ident} SET {} WHERE {key_predicate}",
                    sets.join(", ")
                );
                let params = assigned.iter().map(|(_, v)| v).chain(change.key.iter());
                conn.execute(&sql, params_from_iter(params))?;
            }
            Operation::Delete => {
                let sql = format!("DELETE FROM {table_ident} WHERE {key_predicate}");
                conn.execute(&sql, params_from_iter(change.key.iter()))?;
            }
        }
    }
    Ok(changes.len())
}

/// Last acknowledged position of a shape stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPosition {
    pub handle: Option<String>,
    pub offset: String,
}

pub fn load_position(conn: &Connection, shape_key: &str) -> DbResult<Option<StreamPosition>> {
    let position = conn
        .query_row(
            &format!("SELECT handle, shape_offset FROM {SUBSCRIPTIONS_TABLE} WHERE shape_key = ?"),
            params![shape_key],
            |row| {
                Ok(StreamPosition {
                    handle: row.get(0)?,
                    offset: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(position)
}

pub fn save_position(conn: &Connection, shape_key: &str, position: &StreamPosition) -> DbResult<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {SUBSCRIPTIONS_TABLE} (shape_key, handle, shape_offset, updated_at)
             VALUES (?, ?, ?, strftime('%s', 'now'))"
        ),
        params![shape_key, position.handle, position.offset],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::protocol::parse_messages;
    use crate::remote::protocol::Message;
    use crate::schema::SchemaRegistry;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        SchemaRegistry::default().register(&conn).unwrap();
        conn
    }

    fn changes(body: &str) -> Vec<ChangeMessage> {
        parse_messages(body)
            .unwrap()
            .into_iter()
            .filter_map(|m| match m {
                Message::Change(c) => Some(c),
                Message::Control { .. } => None,
            })
            .collect()
    }

    fn pk() -> Vec<String> {
        vec!["id".to_string()]
    }

    fn title(conn: &Connection, id: i64) -> Option<String> {
        conn.query_row("SELECT title FROM documents WHERE id = ?", [id], |r| r.get(0))
            .optional()
            .unwrap()
    }

    #[test]
    fn test_insert_update_delete() {
        let conn = conn();
        let batch = changes(
            r#"[
            {"key": "1", "value": {"id": 1, "search_space_id": 7, "title": "a", "document_type": "FILE",
              "document_metadata": {"pages": 3}, "created_at": "2024-01-01"}, "headers": {"operation": "insert"}},
            {"key": "2", "value": {"id": 2, "search_space_id": 7, "title": "b", "document_type": "FILE",
              "created_at": "2024-01-01"}, "headers": {"operation": "insert"}},
            {"key": "1", "value": {"id": 1, "title": "a2"}, "headers": {"operation": "update"}},
            {"key": "2", "value": {"id": 2}, "headers": {"operation": "delete"}}
        ]"#,
        );
        let prepared = prepare_changes(&batch, &pk()).unwrap();
        assert_eq!(apply_changes(&conn, "documents", &pk(), &prepared).unwrap(), 4);

        assert_eq!(title(&conn, 1).as_deref(), Some("a2"));
        assert_eq!(title(&conn, 2), None);
        let metadata: String = conn
            .query_row("SELECT document_metadata FROM documents WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(metadata, r#"{"pages":3}"#);
    }

    #[test]
    fn test_insert_existing_row_upserts() {
        let conn = conn();
        let insert = |t: &str| {
            changes(&format!(
                r#"[{{"key": "1", "value": {{"id": 1, "search_space_id": 1, "title": "{t}",
                   "document_type": "FILE", "created_at": "x"}}, "headers": {{"operation": "insert"}}}}]"#
            ))
        };
        for t in ["first", "second"] {
            let prepared = prepare_changes(&insert(t), &pk()).unwrap();
            apply_changes(&conn, "documents", &pk(), &prepared).unwrap();
        }
        assert_eq!(title(&conn, 1).as_deref(), Some("second"));
    }

    #[test]
    fn test_missing_key_is_decode_error() {
        let batch = changes(r#"[{"key": "x", "value": {"title": "a"}, "headers": {"operation": "delete"}}]"#);
        assert!(matches!(
            prepare_changes(&batch, &pk()),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn test_to_sql_value() {
        assert_eq!(to_sql_value(&Value::Bool(true)), SqlValue::Integer(1));
        assert_eq!(to_sql_value(&serde_json::json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(to_sql_value(&serde_json::json!([1, 2])), SqlValue::Text("[1,2]".into()));
        assert_eq!(to_sql_value(&Value::Null), SqlValue::Null);
    }

    #[test]
    fn test_position_round_trip() {
        let conn = conn();
        assert_eq!(load_position(&conn, "k").unwrap(), None);
        let position = StreamPosition {
            handle: Some("h1".into()),
            offset: "10_2".into(),
        };
        save_position(&conn, "k", &position).unwrap();
        save_position(&conn, "k", &position).unwrap();
        assert_eq!(load_position(&conn, "k").unwrap(), Some(position));
    }
}
