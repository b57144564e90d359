//! Item operations.

use once_cell::sync::Lazy;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use trellis_api::{EntityKind, EntityVersion, Error, EventKind, Item, Result};
use trellis_api::error::ResultExt;

use crate::journal;
use crate::store::schema::ITEMS_TABLE;
use crate::store::version::checksum_of;
use crate::store::{map_sqlite_err, page_bounds, Store, TxContext};

use super::{
    apply_patch, attributes, body_of, finish_meta, meta_from_row, patch_id, relations,
    META_COLUMNS,
};

static SELECT_COLUMNS: Lazy<String> =
    Lazy::new(|| format!("id, name, type, customer_id, edge_mac, {META_COLUMNS}"));

const PATCH_COLUMNS: &[&str] = &[
    "id",
    "name",
    "type",
    "customer_id",
    "edge_mac",
    "created_at",
    "modified_at",
    "created_by",
    "modified_by",
    "source_timestamp",
    "sync_policy",
    "version",
    "sync_version",
];

fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        customer_id: row.get(3)?,
        edge_mac: row.get(4)?,
        attributes: Vec::new(),
        meta: meta_from_row(row, 5)?,
    })
}

/// Affected row count of a batch create: items plus their nested
/// attributes.
pub fn tx_len_of(items: &[Item]) -> i64 {
    items.iter().map(|i| 1 + i.attributes.len() as i64).sum()
}

/// Creates items (and their nested attributes) in one transaction,
/// journalling one event per row under a shared tx uuid when more than
/// one row is affected.
pub fn create(store: &Store, items: &[Item], actor_tag: &str) -> Result<()> {
    let result = store.with_tx(|ctx| {
        let tx_len = tx_len_of(items);
        if tx_len > 1 {
            ctx.begin_batch(tx_len);
        }
        create_tx(ctx, items, actor_tag)
    });
    result.with_context(|| {
        if items.len() == 1 {
            format!("failed to create item '{}'", items[0].id)
        } else {
            "failed to create items".to_string()
        }
    })
}

pub fn create_tx(ctx: &mut TxContext<'_>, items: &[Item], actor_tag: &str) -> Result<()> {
    if items.is_empty() {
        return Err(Error::InvalidData("an empty slice was given".into()));
    }

    for item in items {
        let mut row = item.clone();
        let computed = checksum_of(&row, ctx.opts.version_algorithm)?;
        finish_meta(&mut row.meta, computed, ctx.now_ms(), actor_tag);

        insert(ctx, &row)?;

        // Nested attributes journal their own rows; keep them out of
        // the item's event body
        let mut body = row.clone();
        body.attributes = Vec::new();
        journal::publish(
            ctx,
            EventKind::Created,
            EntityKind::Item,
            &row.id,
            actor_tag,
            &body_of(&body)?,
        )?;

        for attribute in &item.attributes {
            let mut attribute = attribute.clone();
            if attribute.item_id.is_empty() {
                attribute.item_id = row.id.clone();
            } else if attribute.item_id != row.id {
                return Err(Error::InvalidData(format!(
                    "cannot create an attribute on item '{}' while creating item '{}'",
                    attribute.item_id, row.id
                )));
            }
            attributes::create_tx(ctx, std::slice::from_ref(&attribute), actor_tag)?;
        }
    }

    Ok(())
}

fn insert(ctx: &TxContext<'_>, item: &Item) -> Result<()> {
    ctx.conn()
        .execute(
            "INSERT INTO items
             (id, name, type, customer_id, edge_mac, created_at, modified_at,
              created_by, modified_by, source_timestamp, sync_policy, version, sync_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                item.id,
                item.name,
                item.kind,
                item.customer_id,
                item.edge_mac,
                item.meta.created_at,
                item.meta.modified_at,
                item.meta.created_by,
                item.meta.modified_by,
                item.meta.source_timestamp,
                item.meta.sync_policy,
                item.meta.version,
                item.meta.sync_version,
            ],
        )
        .map_err(map_sqlite_err)?;
    Ok(())
}

pub(crate) fn fetch_by_id(conn: &Connection, id: &str) -> Result<Option<Item>> {
    conn.query_row(
        &format!("SELECT {} FROM items WHERE id = ?1 AND deleted_at IS NULL", *SELECT_COLUMNS),
        [id],
        from_row,
    )
    .optional()
    .map_err(map_sqlite_err)
}

pub(crate) fn exists(conn: &Connection, id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM items WHERE id = ?1 AND deleted_at IS NULL",
        [id],
        |_| Ok(()),
    )
    .optional()
    .map_err(map_sqlite_err)
    .map(|found| found.is_some())
}

fn exists_err(conn: &Connection, id: &str) -> Result<()> {
    if exists(conn, id)? {
        Ok(())
    } else {
        Err(Error::not_found("item", id))
    }
}

pub fn get_by_id(store: &Store, id: &str) -> Result<Item> {
    store
        .with_conn(|conn| fetch_by_id(conn, id)?.ok_or_else(|| Error::not_found("item", id)))
        .with_context(|| format!("failed to get item '{id}'"))
}

pub fn get_by_name(store: &Store, name: &str) -> Result<Item> {
    store
        .with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM items WHERE name = ?1 AND deleted_at IS NULL",
                    *SELECT_COLUMNS
                ),
                [name],
                from_row,
            )
            .optional()
            .map_err(map_sqlite_err)?
            .ok_or_else(|| Error::not_found("item", name))
        })
        .with_context(|| format!("failed to get item '{name}'"))
}

fn query_page(store: &Store, clause: &str, param: Option<&str>, page: i64, page_size: i64) -> Result<Vec<Item>> {
    let (limit, offset) = page_bounds(page, page_size, store.options().page_size)?;
    store.with_conn(|conn| {
        let sql = format!(
            "SELECT {} FROM items WHERE deleted_at IS NULL {clause} ORDER BY id LIMIT ?1 OFFSET ?2",
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
        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(map_sqlite_err)?);
        }
        Ok(items)
    })
}

pub fn get_all(store: &Store, page: i64, page_size: i64) -> Result<Vec<Item>> {
    query_page(store, "", None, page, page_size).context("failed to get all items")
}

/// Exact type match, paged.
pub fn get_by_kind(store: &Store, kind: &str, page: i64, page_size: i64) -> Result<Vec<Item>> {
    query_page(store, "AND type = ?3", Some(kind), page, page_size)
        .with_context(|| format!("failed to get items by type '{kind}'"))
}

/// Substring name match, paged.
pub fn find_by_name(store: &Store, name: &str, page: i64, page_size: i64) -> Result<Vec<Item>> {
    query_page(
        store,
        "AND name LIKE '%' || ?3 || '%'",
        Some(name),
        page,
        page_size,
    )
    .with_context(|| format!("failed to find items by name '{name}'"))
}

/// Substring type match, paged.
pub fn find_by_kind(store: &Store, kind: &str, page: i64, page_size: i64) -> Result<Vec<Item>> {
    query_page(
        store,
        "AND type LIKE '%' || ?3 || '%'",
        Some(kind),
        page,
        page_size,
    )
    .with_context(|| format!("failed to find items by type '{kind}'"))
}

pub fn count(store: &Store) -> Result<i64> {
    store.with_conn(|conn| {
        conn.query_row(
            "SELECT COUNT(*) FROM items WHERE deleted_at IS NULL",
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
                "SELECT version FROM items WHERE id = ?1 AND deleted_at IS NULL",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite_err)?
            .ok_or_else(|| Error::not_found("item", id))
        })
        .with_context(|| format!("failed to get version of item '{id}'"))
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
         FROM items WHERE deleted_at IS NULL ORDER BY id",
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
        "SELECT sync_policy FROM items WHERE id = ?1 AND deleted_at IS NULL",
        [id],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map_err(map_sqlite_err)
    .map(|row| row.flatten())
}

pub(crate) fn version_in_tx(conn: &Connection, id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT version FROM items WHERE id = ?1 AND deleted_at IS NULL",
        [id],
        |row| row.get(0),
    )
    .optional()
    .map_err(map_sqlite_err)
}

/// Attributes attached to an item.
pub fn attributes_of(store: &Store, id: &str) -> Result<Vec<trellis_api::Attribute>> {
    store
        .with_conn(|conn| {
            exists_err(conn, id)?;
            attributes::fetch_by_item(conn, id)
        })
        .with_context(|| format!("failed to get attributes of item '{id}'"))
}

/// Items reachable from `id` through relations where it is the parent.
pub fn children_of(store: &Store, id: &str) -> Result<Vec<Item>> {
    traversal(store, id, "child_id", "parent_id")
        .with_context(|| format!("failed to get children of item '{id}'"))
}

/// Items reachable from `id` through relations where it is the child.
pub fn parents_of(store: &Store, id: &str) -> Result<Vec<Item>> {
    traversal(store, id, "parent_id", "child_id")
        .with_context(|| format!("failed to get parents of item '{id}'"))
}

fn traversal(store: &Store, id: &str, select_side: &str, match_side: &str) -> Result<Vec<Item>> {
    store.with_conn(|conn| {
        exists_err(conn, id)?;
        let sql = format!(
            "SELECT {} FROM items
             WHERE id IN (SELECT {select_side} FROM relations
                          WHERE {match_side} = ?1 AND deleted_at IS NULL)
               AND deleted_at IS NULL
             ORDER BY id",
            *SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
        let rows = stmt.query_map([id], from_row).map_err(map_sqlite_err)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(map_sqlite_err)?);
        }
        Ok(items)
    })
}

/// All relations touching an item, as parent or child.
pub fn relations_of(store: &Store, id: &str) -> Result<Vec<trellis_api::Relation>> {
    store
        .with_conn(|conn| {
            exists_err(conn, id)?;
            relations::fetch_touching(conn, id)
        })
        .with_context(|| format!("failed to get relations of item '{id}'"))
}

/// Applies a patch to an item. A nested `attributes` list is split off
/// and upserted with the parent's id injected; the batch row count
/// grows accordingly.
pub fn update_tx(ctx: &mut TxContext<'_>, patch: &Map<String, Value>, actor_tag: &str) -> Result<()> {
    let id = patch_id(patch)?;

    let mut item_patch = patch.clone();
    item_patch.remove("attributes");
    let attr_patches = attribute_patches(patch)?;

    if !attr_patches.is_empty() && ctx.tx_len() == 0 {
        ctx.begin_batch(1 + attr_patches.len() as i64);
    }

    apply_patch(
        ctx,
        ITEMS_TABLE,
        "id = ?",
        vec![SqlValue::Text(id.clone())],
        &item_patch,
        PATCH_COLUMNS,
        &["id", "attributes"],
        actor_tag,
        Error::not_found("item", id.as_str()),
    )?;

    if !item_patch.contains_key("version") {
        refresh_version(ctx, &id, actor_tag)?;
    }

    journal::publish(
        ctx,
        EventKind::Updated,
        EntityKind::Item,
        &id,
        actor_tag,
        &Value::Object(item_patch),
    )?;

    for mut attr_patch in attr_patches {
        attr_patch.insert("item_id".into(), Value::String(id.clone()));
        attributes::upsert_tx(ctx, &attr_patch, actor_tag)?;
    }

    Ok(())
}

fn attribute_patches(patch: &Map<String, Value>) -> Result<Vec<Map<String, Value>>> {
    match patch.get("attributes") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| match entry {
                Value::Object(map) => Ok(map.clone()),
                _ => Err(Error::InvalidData(
                    "attribute patches must be JSON objects".into(),
                )),
            })
            .collect(),
        Some(_) => Err(Error::InvalidData("attributes field must be a list".into())),
    }
}

/// Recomputes the content-addressed version after a patch that did not
/// carry one.
fn refresh_version(ctx: &TxContext<'_>, id: &str, actor_tag: &str) -> Result<()> {
    let item = fetch_by_id(ctx.conn(), id)?.ok_or_else(|| Error::not_found("item", id))?;
    let version = checksum_of(&item, ctx.opts.version_algorithm)?;
    if actor_tag == trellis_api::actor::SYNC && item.meta.sync_version.is_none() {
        ctx.conn()
            .execute(
                "UPDATE items SET version = ?1, sync_version = ?1 WHERE id = ?2",
                params![version, id],
            )
            .map_err(map_sqlite_err)?;
    } else {
        ctx.conn()
            .execute(
                "UPDATE items SET version = ?1 WHERE id = ?2",
                params![version, id],
            )
            .map_err(map_sqlite_err)?;
    }
    Ok(())
}

pub fn update(store: &Store, patch: &Map<String, Value>, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| update_tx(ctx, patch, actor_tag))
        .context("failed to update item")
}

/// Update falling back to create when the row does not exist.
pub fn upsert_tx(ctx: &mut TxContext<'_>, patch: &Map<String, Value>, actor_tag: &str) -> Result<()> {
    match update_tx(ctx, patch, actor_tag) {
        Err(e) if e.is_not_found() => {
            let item: Item = serde_json::from_value(Value::Object(patch.clone()))
                .map_err(|e| Error::DeserializationFailed(format!("item patch: {e}")))?;
            create_tx(ctx, std::slice::from_ref(&item), actor_tag)
        }
        other => other,
    }
}

pub fn upsert(store: &Store, patch: &Map<String, Value>, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| upsert_tx(ctx, patch, actor_tag))
        .context("failed to upsert item")
}

/// Deletes an item, cascading to its attributes and relations. Soft
/// delete (when enabled and not overridden) marks the rows instead of
/// erasing them; the engine's foreign keys cascade hard deletes.
pub fn delete_tx(ctx: &mut TxContext<'_>, id: &str, actor_tag: &str) -> Result<()> {
    let changed = if ctx.hard_delete() {
        ctx.conn()
            .execute("DELETE FROM items WHERE id = ?1", [id])
            .map_err(map_sqlite_err)?
    } else {
        let now = ctx.now_ms();
        let changed = ctx
            .conn()
            .execute(
                "UPDATE items SET deleted_at = ?1, modified_at = ?1, modified_by = ?2
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![now, actor_tag, id],
            )
            .map_err(map_sqlite_err)?;
        if changed > 0 {
            // Cascade, mirroring what the engine does on hard delete
            ctx.conn()
                .execute(
                    "UPDATE attributes SET deleted_at = ?1 WHERE item_id = ?2 AND deleted_at IS NULL",
                    params![now, id],
                )
                .map_err(map_sqlite_err)?;
            ctx.conn()
                .execute(
                    "UPDATE relations SET deleted_at = ?1
                     WHERE (parent_id = ?2 OR child_id = ?2) AND deleted_at IS NULL",
                    params![now, id],
                )
                .map_err(map_sqlite_err)?;
        }
        changed
    };

    if changed == 0 {
        return Err(Error::not_found("item", id));
    }

    journal::publish(
        ctx,
        EventKind::Deleted,
        EntityKind::Item,
        id,
        actor_tag,
        &json!({ "id": id }),
    )
}

pub fn delete(store: &Store, id: &str, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| delete_tx(ctx, id, actor_tag))
        .with_context(|| format!("failed to delete item '{id}'"))
}

pub fn hard_delete(store: &Store, id: &str, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| {
            ctx.force_hard_delete();
            delete_tx(ctx, id, actor_tag)
        })
        .with_context(|| format!("failed to hard delete item '{id}'"))
}
