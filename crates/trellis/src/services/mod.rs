//! The entity service layer.
//!
//! Every mutation opens one transaction, performs the entity operation
//! and journals exactly one event per affected row. Batch operations
//! share a transaction uuid and carry the total affected row count so
//! consumers can reconstruct the originating transaction.

pub mod attributes;
pub mod events;
pub mod items;
pub mod relations;

use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};

use trellis_api::{actor, Error, Meta, Result};

use crate::store::TxContext;

/// Converts a JSON patch value into an engine parameter. Nested
/// structures cannot land in a scalar column.
pub(crate) fn to_sql_value(column: &str, value: &Value) -> Result<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(Error::InvalidData(format!(
                    "numeric value for column '{column}' is out of range"
                )))
            }
        }
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(Error::InvalidData(format!(
            "value for column '{column}' must be a scalar"
        ))),
    }
}

/// Extracts the mandatory string `id` from a patch.
pub(crate) fn patch_id(patch: &Map<String, Value>) -> Result<String> {
    match patch.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(_) => Err(Error::InvalidData("id must be a non-empty string".into())),
        None => Err(Error::MissingId),
    }
}

/// Applies a patch as an UPDATE statement.
///
/// `modified_at` and `modified_by` are stamped from the transaction,
/// overriding whatever the patch carries; keys outside `allowed` fail
/// with [`Error::InvalidField`] naming the column. Returns
/// [`Error::NotFound`] when no live row matches.
pub(crate) fn apply_patch(
    ctx: &TxContext<'_>,
    table: &str,
    key_clause: &str,
    key_values: Vec<SqlValue>,
    patch: &Map<String, Value>,
    allowed: &[&str],
    skip: &[&str],
    actor_tag: &str,
    not_found: Error,
) -> Result<()> {
    let mut sets = vec!["modified_at = ?".to_string(), "modified_by = ?".to_string()];
    let mut params: Vec<SqlValue> = vec![
        SqlValue::Integer(ctx.now_ms()),
        SqlValue::Text(actor_tag.to_string()),
    ];

    for (column, value) in patch {
        if skip.contains(&column.as_str())
            || column == "modified_at"
            || column == "modified_by"
        {
            continue;
        }
        if !allowed.contains(&column.as_str()) {
            return Err(Error::InvalidField {
                column: column.clone(),
            });
        }
        sets.push(format!("{column} = ?"));
        params.push(to_sql_value(column, value)?);
    }

    params.extend(key_values);

    let sql = format!(
        "UPDATE {table} SET {} WHERE {key_clause} AND deleted_at IS NULL",
        sets.join(", ")
    );
    let changed = ctx
        .conn()
        .execute(&sql, rusqlite::params_from_iter(params))
        .map_err(crate::store::map_sqlite_err)?;

    if changed == 0 {
        return Err(not_found);
    }
    Ok(())
}

/// Fills the meta envelope of a freshly created row: actor defaults,
/// timestamps, the computed version, and (for the sync actor) the
/// sync version.
pub(crate) fn finish_meta(meta: &mut Meta, computed_version: String, now: i64, actor_tag: &str) {
    if meta.created_by.is_empty() {
        meta.created_by = actor_tag.to_string();
    }
    if meta.modified_by.is_empty() {
        meta.modified_by = actor_tag.to_string();
    }
    if meta.created_at == 0 {
        meta.created_at = now;
    }
    if meta.modified_at == 0 {
        meta.modified_at = now;
    }
    if meta.version.is_empty() {
        meta.version = computed_version;
    }
    if meta.sync_version.is_none() && meta.modified_by == actor::SYNC {
        meta.sync_version = Some(meta.version.clone());
    }
}

/// Serializes an entity to the JSON object used for event bodies.
pub(crate) fn body_of<T: serde::Serialize>(entity: &T) -> Result<Value> {
    serde_json::to_value(entity).map_err(|e| Error::SerializationFailed(e.to_string()))
}

/// Reads the meta envelope from a row. Queries select the meta columns
/// in a fixed order after the entity's own fields:
/// `created_at, modified_at, created_by, modified_by,
/// source_timestamp, sync_policy, version, sync_version`.
pub(crate) fn meta_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Meta> {
    Ok(Meta {
        created_at: row.get(offset)?,
        modified_at: row.get(offset + 1)?,
        created_by: row.get(offset + 2)?,
        modified_by: row.get(offset + 3)?,
        source_timestamp: row.get(offset + 4)?,
        sync_policy: row.get(offset + 5)?,
        version: row.get(offset + 6)?,
        sync_version: row.get(offset + 7)?,
    })
}

pub(crate) const META_COLUMNS: &str =
    "created_at, modified_at, created_by, modified_by, source_timestamp, sync_policy, version, sync_version";
