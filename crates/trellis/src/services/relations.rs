//! Relation operations.
//!
//! Relations carry no mutable business fields, so there is no patch
//! update here: they are created, deleted, or reparented as a whole.

use once_cell::sync::Lazy;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use trellis_api::error::ResultExt;
use trellis_api::{EntityKind, EntityVersion, Error, EventKind, Relation, Result};

use crate::journal;
use crate::store::version::checksum_of;
use crate::store::{map_sqlite_err, page_bounds, Store, TxContext};

use super::{body_of, finish_meta, meta_from_row, META_COLUMNS};

static SELECT_COLUMNS: Lazy<String> =
    Lazy::new(|| format!("parent_id, child_id, {META_COLUMNS}"));

fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        parent_id: row.get(0)?,
        child_id: row.get(1)?,
        meta: meta_from_row(row, 2)?,
    })
}

pub fn create(store: &Store, relations: &[Relation], actor_tag: &str) -> Result<()> {
    let result = store.with_tx(|ctx| {
        if relations.len() > 1 {
            ctx.begin_batch(relations.len() as i64);
        }
        create_tx(ctx, relations, actor_tag)
    });
    result.with_context(|| {
        if relations.len() == 1 {
            format!("failed to create relation '{}'", relations[0].composite_id())
        } else {
            "failed to create relations".to_string()
        }
    })
}

pub fn create_tx(ctx: &mut TxContext<'_>, relations: &[Relation], actor_tag: &str) -> Result<()> {
    if relations.is_empty() {
        return Err(Error::InvalidData("an empty slice was given".into()));
    }

    for relation in relations {
        if relation.parent_id.is_empty() || relation.child_id.is_empty() {
            return Err(Error::MissingId);
        }

        let mut row = relation.clone();
        let computed = checksum_of(&row, ctx.opts.version_algorithm)?;
        finish_meta(&mut row.meta, computed, ctx.now_ms(), actor_tag);

        ctx.conn()
            .execute(
                "INSERT INTO relations
                 (parent_id, child_id, created_at, modified_at, created_by, modified_by,
                  source_timestamp, sync_policy, version, sync_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.parent_id,
                    row.child_id,
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
            EntityKind::Relation,
            &row.composite_id(),
            actor_tag,
            &body_of(&row)?,
        )?;
    }

    Ok(())
}

pub(crate) fn fetch(conn: &Connection, parent_id: &str, child_id: &str) -> Result<Option<Relation>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM relations
             WHERE parent_id = ?1 AND child_id = ?2 AND deleted_at IS NULL",
            *SELECT_COLUMNS
        ),
        params![parent_id, child_id],
        from_row,
    )
    .optional()
    .map_err(map_sqlite_err)
}

/// Relations where the item appears on either side.
pub(crate) fn fetch_touching(conn: &Connection, item_id: &str) -> Result<Vec<Relation>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM relations
             WHERE (parent_id = ?1 OR child_id = ?1) AND deleted_at IS NULL
             ORDER BY parent_id, child_id",
            *SELECT_COLUMNS
        ))
        .map_err(map_sqlite_err)?;
    let rows = stmt.query_map([item_id], from_row).map_err(map_sqlite_err)?;
    let mut relations = Vec::new();
    for row in rows {
        relations.push(row.map_err(map_sqlite_err)?);
    }
    Ok(relations)
}

pub fn get(store: &Store, parent_id: &str, child_id: &str) -> Result<Relation> {
    store
        .with_conn(|conn| {
            fetch(conn, parent_id, child_id)?.ok_or_else(|| Error::NotFound {
                kind: "relation",
                id: format!("{parent_id}->{child_id}"),
            })
        })
        .with_context(|| {
            format!("failed to get relation between parent '{parent_id}' and child '{child_id}'")
        })
}

pub fn get_all(store: &Store, page: i64, page_size: i64) -> Result<Vec<Relation>> {
    let (limit, offset) = page_bounds(page, page_size, store.options().page_size)?;
    store
        .with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM relations WHERE deleted_at IS NULL
                     ORDER BY parent_id, child_id LIMIT ?1 OFFSET ?2",
                    *SELECT_COLUMNS
                ))
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map(params![limit, offset], from_row)
                .map_err(map_sqlite_err)?;
            let mut relations = Vec::new();
            for row in rows {
                relations.push(row.map_err(map_sqlite_err)?);
            }
            Ok(relations)
        })
        .context("failed to get all relations")
}

pub fn count(store: &Store) -> Result<i64> {
    store.with_conn(|conn| {
        conn.query_row(
            "SELECT COUNT(*) FROM relations WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )
        .map_err(map_sqlite_err)
    })
}

pub fn versions(store: &Store, page: i64, page_size: i64) -> Result<Vec<EntityVersion>> {
    let (limit, offset) = page_bounds(page, page_size, store.options().page_size)?;
    store.with_conn(|conn| version_rows(conn, Some((limit, offset))))
}

pub fn all_versions(store: &Store) -> Result<Vec<EntityVersion>> {
    store.with_conn(|conn| version_rows(conn, None))
}

fn version_rows(conn: &Connection, bounds: Option<(i64, i64)>) -> Result<Vec<EntityVersion>> {
    // The composite id is the relation's identity on the wire
    let mut sql = String::from(
        "SELECT parent_id || '->' || child_id, version, sync_version, modified_at, modified_by
         FROM relations WHERE deleted_at IS NULL ORDER BY parent_id, child_id",
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

pub(crate) fn sync_policy(conn: &Connection, parent_id: &str, child_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT sync_policy FROM relations
         WHERE parent_id = ?1 AND child_id = ?2 AND deleted_at IS NULL",
        params![parent_id, child_id],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map_err(map_sqlite_err)
    .map(|row| row.flatten())
}

pub(crate) fn version_in_tx(
    conn: &Connection,
    parent_id: &str,
    child_id: &str,
) -> Result<Option<String>> {
    conn.query_row(
        "SELECT version FROM relations
         WHERE parent_id = ?1 AND child_id = ?2 AND deleted_at IS NULL",
        params![parent_id, child_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(map_sqlite_err)
}

pub fn delete_tx(
    ctx: &mut TxContext<'_>,
    parent_id: &str,
    child_id: &str,
    actor_tag: &str,
) -> Result<()> {
    if parent_id.is_empty() || child_id.is_empty() {
        return Err(Error::MissingId);
    }

    let changed = if ctx.hard_delete() {
        ctx.conn()
            .execute(
                "DELETE FROM relations WHERE parent_id = ?1 AND child_id = ?2",
                params![parent_id, child_id],
            )
            .map_err(map_sqlite_err)?
    } else {
        ctx.conn()
            .execute(
                "UPDATE relations SET deleted_at = ?1, modified_at = ?1, modified_by = ?2
                 WHERE parent_id = ?3 AND child_id = ?4 AND deleted_at IS NULL",
                params![ctx.now_ms(), actor_tag, parent_id, child_id],
            )
            .map_err(map_sqlite_err)?
    };

    if changed == 0 {
        return Err(Error::NotFound {
            kind: "relation",
            id: format!("{parent_id}->{child_id}"),
        });
    }

    journal::publish(
        ctx,
        EventKind::Deleted,
        EntityKind::Relation,
        &format!("{parent_id}->{child_id}"),
        actor_tag,
        &json!({ "parent_id": parent_id, "child_id": child_id }),
    )
}

pub fn delete(store: &Store, parent_id: &str, child_id: &str, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| delete_tx(ctx, parent_id, child_id, actor_tag))
        .with_context(|| {
            format!("failed to delete relation with parent '{parent_id}' and child '{child_id}'")
        })
}

pub fn hard_delete(store: &Store, parent_id: &str, child_id: &str, actor_tag: &str) -> Result<()> {
    store
        .with_tx(|ctx| {
            ctx.force_hard_delete();
            delete_tx(ctx, parent_id, child_id, actor_tag)
        })
        .with_context(|| {
            format!("failed to delete relation with parent '{parent_id}' and child '{child_id}'")
        })
}

/// Reparents a child: one UPDATE on the relation row, never a
/// delete/create pair. The row's version is refreshed since its
/// content changed.
pub fn reparent(
    store: &Store,
    parent_id: &str,
    child_id: &str,
    new_parent_id: &str,
    actor_tag: &str,
) -> Result<()> {
    store
        .with_tx(|ctx| {
            let changed = ctx
                .conn()
                .execute(
                    "UPDATE relations SET parent_id = ?1, modified_by = ?2, modified_at = ?3
                     WHERE parent_id = ?4 AND child_id = ?5 AND deleted_at IS NULL",
                    params![
                        new_parent_id,
                        actor_tag,
                        ctx.now_ms(),
                        parent_id,
                        child_id
                    ],
                )
                .map_err(map_sqlite_err)?;
            if changed == 0 {
                return Err(Error::NotFound {
                    kind: "relation",
                    id: format!("{parent_id}->{child_id}"),
                });
            }

            let row = fetch(ctx.conn(), new_parent_id, child_id)?.ok_or_else(|| {
                Error::NotFound {
                    kind: "relation",
                    id: format!("{new_parent_id}->{child_id}"),
                }
            })?;
            let version = checksum_of(&row, ctx.opts.version_algorithm)?;
            ctx.conn()
                .execute(
                    "UPDATE relations SET version = ?1 WHERE parent_id = ?2 AND child_id = ?3",
                    params![version, new_parent_id, child_id],
                )
                .map_err(map_sqlite_err)?;

            journal::publish(
                ctx,
                EventKind::Updated,
                EntityKind::Relation,
                &row.composite_id(),
                actor_tag,
                &json!({ "parent_id": new_parent_id, "child_id": child_id }),
            )
        })
        .with_context(|| {
            format!("failed to move child '{child_id}' from '{parent_id}' to '{new_parent_id}'")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::services::items;
    use trellis_api::{EventKind, Item};

    fn store_with_items(ids: &[&str]) -> Store {
        let store = Store::open(&StoreConfig {
            url: ":memory:".into(),
            ..Default::default()
        })
        .unwrap();
        for id in ids {
            items::create(
                &store,
                &[Item {
                    id: (*id).into(),
                    name: format!("{id}-name"),
                    kind: "t".into(),
                    ..Default::default()
                }],
                "TEST",
            )
            .unwrap();
        }
        store
    }

    fn relation(parent: &str, child: &str) -> Relation {
        Relation {
            parent_id: parent.into(),
            child_id: child.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = store_with_items(&["P", "C"]);
        create(&store, &[relation("P", "C")], "TEST").unwrap();

        let got = get(&store, "P", "C").unwrap();
        assert_eq!(got.composite_id(), "P->C");
        assert!(!got.meta.version.is_empty());
        assert_eq!(count(&store).unwrap(), 1);
    }

    #[test]
    fn test_create_unknown_endpoint_fails() {
        let store = store_with_items(&["P"]);
        let err = create(&store, &[relation("P", "ghost")], "TEST").unwrap_err();
        assert!(matches!(err.root(), Error::InvalidData(_)));
    }

    #[test]
    fn test_delete_missing_ids() {
        let store = store_with_items(&["P", "C"]);
        assert!(matches!(
            delete(&store, "", "C", "TEST").unwrap_err().root(),
            Error::MissingId
        ));
        assert!(delete(&store, "P", "C", "TEST").unwrap_err().is_not_found());
    }

    #[test]
    fn test_reparent_is_single_update() {
        let store = store_with_items(&["P1", "P2", "C"]);
        create(&store, &[relation("P1", "C")], "TEST").unwrap();
        // Settle the queue so only the move's event remains
        store
            .with_tx(|ctx| crate::journal::drain(ctx, 10, |_| Ok(())))
            .unwrap();

        reparent(&store, "P1", "C", "P2", "MOVER").unwrap();

        assert!(get(&store, "P1", "C").is_err());
        let moved = get(&store, "P2", "C").unwrap();
        assert_eq!(moved.meta.modified_by, "MOVER");

        let events = crate::journal::peek(&store, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventKind::Updated);
        assert_eq!(events[0].entity_id, "P2->C");
    }

    #[test]
    fn test_versions_use_composite_ids() {
        let store = store_with_items(&["P", "C"]);
        create(&store, &[relation("P", "C")], "TEST").unwrap();
        let listed = all_versions(&store).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "P->C");
    }
}
