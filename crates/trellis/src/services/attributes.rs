//! Attribute operations.

use once_cell::sync::Lazy;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use trellis_api::error::ResultExt;
use trellis_api::{Attribute, EntityKind, EntityVersion, Error, EventKind, Result};

use crate::journal;
use crate::store::schema::ATTRIBUTES_TABLE;
use crate::store::version::checksum_of;
use crate::store::{map_sqlite_err, page_bounds, Store, TxContext};

use super::{apply_patch, body_of, finish_meta, meta_from_row, patch_id, META_COLUMNS};

static SELECT_COLUMNS: Lazy<String> =
    Lazy::new(|| format!("id, name, type, value, value_type, item_id, {META_COLUMNS}"));

const PATCH_COLUMNS: &[&str] = &[
    "id",
    "name",
    "type",
    "value",
    "value_type",
    "item_id",
    "created_at",
    "modified_at",
    "created_by",
    "modified_by",
    "source_timestamp",
    "sync_policy",
    "version",
    "sync_version",
];

fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attribute> {
    Ok(Attribute {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        value: row.get(3)?,
        value_type: row.get(4)?,
        item_id: row.get(5)?,
        meta: meta_from_row(row, 6)?,
    })
}

pub fn create(store: &Store, attributes: &[Attribute], actor_tag: &str) -> Result<()> {
    let result = store.with_tx(|ctx| {
        if attributes.len() > 1 {
            ctx.begin_batch(attributes.len() as i64);
        }
        create_tx(ctx, attributes, actor_tag)
    });
    result.with_context(|| {
        if attributes.len() == 1 {
            format!("failed to create attribute '{}'", attributes[0].id)
        } else {
            "failed to create attributes".to_string()
        }
    })
}

pub fn create_tx(ctx: &mut TxContext<'_>, attributes: &[Attribute], actor_tag: &str) -> Result<()> {
    if attributes.is_empty() {
        return Err(Error::InvalidData("an empty slice was given".into()));
    }

    for attribute in attributes {
        let mut row = attribute.clone();
        let computed = checksum_of(&row, ctx.opts.version_algorithm)?;
        finish_meta(&mut row.meta, computed, ctx.now_ms(), actor_tag);

        ctx.conn()
            .execute(
                "INSERT INTO attributes
                 (id, name, type, value, value_type, item_id, created_at, modified_at,
                  created_by, modified_by, source_timestamp, sync_policy, version, sync_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    row.id,
                    row.name,
                    row.kind,
                    row.value,
                    row.value_type,
                    row.item_id,
                    row.meta.created_at,
                    row.meta.modified_at,
                    row.meta.created_by,
                    row.meta.modified_by,
                    row.meta.source_timestamp,
                    row.meta.sync_policy,
                    row.meta.version,
                    row.meta.sync_version,
                ],
            )
            .map_err(map_sqlite_err)?;

        journal::publish(
            ctx,
            EventKind::Created,
            EntityKind::Attribute,
            &row.id,
            actor_tag,
            &body_of(&row)?,
        )?;
    }

    Ok(())
}

pub(crate) fn fetch_by_id(conn: &Connection, id: &str) -> Result<Option<Attribute>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM attributes WHERE id = ?1 AND deleted_at IS NULL",
            *SELECT_COLUMNS
        ),
        [id],
        from_row,
    )
    .optional()
    .map_err(map_sqlite_err)
}

pub(crate) fn fetch_by_item(conn: &Connection, item_id: &str) -> Result<Vec<Attribute>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM attributes WHERE item_id = ?1 AND deleted_at IS NULL ORDER BY id",
            *SELECT_COLUMNS
        ))
        .map_err(map_sqlite_err)?;
    let rows = stmt.query_map([item_id], from_row).map_err(map_sqlite_err)?;
    let mut attributes = Vec::new();
    for row in rows {
        attributes.push(row.map_err(map_sqlite_err)?);
    }
    Ok(attributes)
}

pub fn get_by_id(store: &Store, id: &str) -> Result<Attribute> {
    store
        .with_conn(|conn| fetch_by_id(conn, id)?.ok_or_else(|| Error::not_found("attribute", id)))
        .with_context(|| format!("failed to get attribute '{id}'"))
}

/// The attribute named `name` on a given item.
pub fn get_by_item_and_name(store: &Store, item_id: &str, name: &str) -> Result<Attribute> {
    store
        .with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM attributes
                     WHERE item_id = ?1 AND name = ?2 AND deleted_at IS NULL",
                    *SELECT_COLUMNS
                ),
                params![item_id, name],
                from_row,
            )
            .optional()
            .map_err(map_sqlite_err)?
            .ok_or_else(|| Error::not_found("attribute", name))
        })
        .with_context(|| format!("failed to get attribute '{name}' on item '{item_id}'"))
}

fn query_page(
    store: &Store,
    clause: &str,
    param: Option<&str>,
    page: i64,
    page_size: i64,
) -> Result<Vec<Attribute>> {
    let (limit, offset) = page_bounds(page, page_size, store.options().page_size)?;
    store.with_conn(|conn| {
        let sql = format!(
            "SELECT {} FROM attributes WHERE deleted_at IS NULL {clause} ORDER BY id LIMIT ?1 OFFSET ?2",
            *SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
        let rows = match param {
            Some(p) => stmt
                .query_map(params![limit, offset, p], from_row)
                .map_err(map_sqlite_err)?,
            None => stmt
                .query_map(params![limit, offset], from_row)
                .map_err(map_sqlite_err)?,
        };
        let mut attributes = Vec::new();
        for row in rows {
            attributes.push(row.map_err(map_sqlite_err)?);
        }
        Ok(attributes)
    })
}

pub fn get_all(store: &Store, page: i64, page_size: i64) -> Result<Vec<Attribute>> {
    query_page(store, "", None, page, page_size).context("failed to get all attributes")
}

pub fn get_by_kind(store: &Store, kind: &str, page: i64, page_size: i64) -> Result<Vec<Attribute>> {
    query_page(store, "AND type = ?3", Some(kind), page, page_size)
        .with_context(|| format!("failed to get attributes by type '{kind}'"))
}

pub fn find_by_name(store: &Store, name: &str, page: i64, page_size: i64) -> Result<Vec<Attribute>> {
    query_page(
        store,
        "AND name LIKE '%' || ?3 || '%'",
        Some(name),
        page,
        page_size,
    )
    .with_context(|| format!("failed to find attributes by name '{name}'"))
}

pub fn find_by_kind(store: &Store, kind: &str, page: i64, page_size: i64) -> Result<Vec<Attribute>> {
    query_page(
        store,
        "AND type LIKE '%' || ?3 || '%'",
        Some(kind),
        page,
        page_size,
    )
    .with_context(|| format!("failed to find attributes by type '{kind}'"))
}

pub fn count(store: &Store) -> Result<i64> {
    store.with_conn(|conn| {
        conn.query_row(
            "SELECT COUNT(*) FROM attributes WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )
        .map_err(map_sqlite_err)
    })
}

pub fn version_of(store: &Store, id: &str) -> Result<String> {
    store
        .with_conn(|conn| {
            conn.query_row(
                "SELECT version FROM attributes WHERE id = ?1 AND deleted_at IS NULL",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite_err)?
            .ok_or_else(|| Error::not_found("attribute", id))
        })
        .with_context(|| format!("failed to get version of attribute '{id}'"))
}

pub fn versions(store: &Store, page: i64, page_size: i64) -> Result<Vec<EntityVersion>> {
    let (limit, offset) = page_bounds(page, page_size, store.options().page_size)?;
    store.with_conn(|conn| version_rows(conn, Some((limit, offset))))
}

pub fn all_versions(store: &Store) -> Result<Vec<EntityVersion>> {
    store.with_conn(|conn| version_rows(conn, None))
}

fn version_rows(conn: &Connection, bounds: Option<(i64, i64)>) -> Result<Vec<EntityVersion>> {
    let mut sql = String::from(
        "SELECT id, version, sync_version, modified_at, modified_by
         FROM attributes WHERE deleted_at IS NULL ORDER BY id",
    );
    if bounds.is_some() {
        sql.push_str(" LIMIT ?1 OFFSET ?2");
    }
    let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
    let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<EntityVersion> {
        Ok(EntityVersion {
            id: row.get(0)?,
            version: row.get(1)?,
            sync_version: row.get(2)?,
            modified_at: row.get(3)?,
            modified_by: row.get(4)?,
        })
    };
    let rows = match bounds {
        Some((limit, offset)) => stmt
            .query_map(params![limit, offset], map)
            .map_err(map_sqlite_err)?,
        None => stmt.query_map([], map).map_err(map_sqlite_err)?,
    };
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row.map_err(map_sqlite_err)?);
    }
    Ok(versions)
}

pub(crate) fn sync_policy(conn: &Connection, id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT sync_policy FROM attributes WHERE id = ?1 AND deleted_at IS NULL",
        [id],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map_err(map_sqlite_err)
    .map(|row| row.flatten())
}

pub(crate) fn version_in_tx(conn: &Connection, id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT version FROM attributes WHERE id = ?1 AND deleted_at IS NULL",
        [id],
        |row| row.get(0),
    )
    .optional()
    .map_err(map_sqlite_err)
}

pub fn update_tx(ctx: &mut TxContext<'_>, patch: &Map<String, Value>, actor_tag: &str) -> Result<()> {
    let id = patch_id(patch)?;

    apply_patch(
        ctx,
        ATTRIBUTES_TABLE,
        "id = ?",
        vec![SqlValue::Text(id.clone())],
        patch,
        PATCH_COLUMNS,
        &["id"],
        actor_tag,
        Error::not_found("attribute", id.as_str()),
    )?;

    if !patch.contains_key("version") {
        refresh_version(ctx, &id, actor_tag)?;
    }

    journal::publish(
        ctx,
        EventKind::Updated,
        EntityKind::Attribute,
        &id,
        actor_tag,
        &Value::Object(patch.clone()),
    )
}

fn refresh_version(ctx: &TxContext<'_>, id: &str, actor_tag: &str) -> Result<()> {
    let attribute =
        fetch_by_id(ctx.conn(), id)?.ok_or_else(|| Error::not_found("attribute", id))?;
    let version = checksum_of(&attribute, ctx.opts.version_algorithm)?;
    if actor_tag == trellis_api::actor::SYNC && attribute.meta.sync_version.is_none() {
        ctx.conn()
            .execute(
                "UPDATE attributes SET version = ?1, sync_version = ?1 WHERE id = ?2",
                params![version, id],
            )
            .map_err(map_sqlite_err)?;
    } else {
        ctx.conn()
            .execute(
                "UPDATE attributes SET version = ?1 WHERE id = ?2",
                params![version, id],
            )
            .map_err(map_sqlite_err)?;
    }
    Ok(())
}

pub fn update(store: &Store, patch: &Map<String, Value>, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| update_tx(ctx, patch, actor_tag))
        .context("failed to update attribute")
}

pub fn upsert_tx(ctx: &mut TxContext<'_>, patch: &Map<String, Value>, actor_tag: &str) -> Result<()> {
    match update_tx(ctx, patch, actor_tag) {
        Err(e) if e.is_not_found() => {
            let attribute: Attribute = serde_json::from_value(Value::Object(patch.clone()))
                .map_err(|e| Error::DeserializationFailed(format!("attribute patch: {e}")))?;
            create_tx(ctx, std::slice::from_ref(&attribute), actor_tag)
        }
        other => other,
    }
}

pub fn upsert(store: &Store, patch: &Map<String, Value>, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| upsert_tx(ctx, patch, actor_tag))
        .context("failed to upsert attribute")
}

pub fn delete_tx(ctx: &mut TxContext<'_>, id: &str, actor_tag: &str) -> Result<()> {
    let changed = if ctx.hard_delete() {
        ctx.conn()
            .execute("DELETE FROM attributes WHERE id = ?1", [id])
            .map_err(map_sqlite_err)?
    } else {
        ctx.conn()
            .execute(
                "UPDATE attributes SET deleted_at = ?1, modified_at = ?1, modified_by = ?2
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![ctx.now_ms(), actor_tag, id],
            )
            .map_err(map_sqlite_err)?
    };

    if changed == 0 {
        return Err(Error::not_found("attribute", id));
    }

    journal::publish(
        ctx,
        EventKind::Deleted,
        EntityKind::Attribute,
        id,
        actor_tag,
        &json!({ "id": id }),
    )
}

pub fn delete(store: &Store, id: &str, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| delete_tx(ctx, id, actor_tag))
        .with_context(|| format!("failed to delete attribute '{id}'"))
}

pub fn hard_delete(store: &Store, id: &str, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| {
            ctx.force_hard_delete();
            delete_tx(ctx, id, actor_tag)
        })
        .with_context(|| format!("failed to hard delete attribute '{id}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::services::items;
    use trellis_api::Item;

    fn store_with_item(id: &str) -> Store {
        let store = Store::open(&StoreConfig {
            url: ":memory:".into(),
            ..Default::default()
        })
        .unwrap();
        items::create(
            &store,
            &[Item {
                id: id.into(),
                name: format!("{id}-name"),
                kind: "t".into(),
                ..Default::default()
            }],
            "TEST",
        )
        .unwrap();
        store
    }

    fn attribute(id: &str, name: &str, item_id: &str) -> Attribute {
        Attribute {
            id: id.into(),
            name: name.into(),
            kind: "t".into(),
            value: Some("42".into()),
            value_type: Some("int".into()),
            item_id: item_id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_requires_existing_item() {
        let store = store_with_item("I1");
        create(&store, &[attribute("A1", "a", "I1")], "TEST").unwrap();
        assert_eq!(count(&store).unwrap(), 1);

        let err = create(&store, &[attribute("A2", "a", "ghost")], "TEST").unwrap_err();
        assert!(matches!(err.root(), Error::InvalidData(_)));
    }

    #[test]
    fn test_composite_uniqueness() {
        let store = store_with_item("I1");
        create(&store, &[attribute("A1", "a", "I1")], "TEST").unwrap();
        let err = create(&store, &[attribute("A2", "a", "I1")], "TEST").unwrap_err();
        assert!(matches!(err.root(), Error::Uniqueness(_)));
    }

    #[test]
    fn test_get_by_item_and_name() {
        let store = store_with_item("I1");
        create(&store, &[attribute("A1", "a", "I1")], "TEST").unwrap();
        let got = get_by_item_and_name(&store, "I1", "a").unwrap();
        assert_eq!(got.id, "A1");
        assert_eq!(got.value.as_deref(), Some("42"));
        assert!(get_by_item_and_name(&store, "I1", "b").unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_value() {
        let store = store_with_item("I1");
        create(&store, &[attribute("A1", "a", "I1")], "TEST").unwrap();
        let v1 = version_of(&store, "A1").unwrap();

        let patch = serde_json::from_str(r#"{"id": "A1", "value": "43"}"#).unwrap();
        update(&store, &patch, "TEST").unwrap();

        let got = get_by_id(&store, "A1").unwrap();
        assert_eq!(got.value.as_deref(), Some("43"));
        assert_ne!(got.meta.version, v1);
    }

    #[test]
    fn test_upsert_injected_parent() {
        let store = store_with_item("I1");
        let patch: Map<String, Value> = serde_json::from_str(
            r#"{"id": "A1", "name": "a", "type": "t", "item_id": "I1"}"#,
        )
        .unwrap();
        upsert(&store, &patch, "TEST").unwrap();
        assert_eq!(count(&store).unwrap(), 1);
    }

    #[test]
    fn test_delete() {
        let store = store_with_item("I1");
        create(&store, &[attribute("A1", "a", "I1")], "TEST").unwrap();
        delete(&store, "A1", "TEST").unwrap();
        assert_eq!(count(&store).unwrap(), 0);
        assert!(delete(&store, "A1", "TEST").unwrap_err().is_not_found());
    }
}
