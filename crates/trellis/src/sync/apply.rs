//! Inbound sync application.
//!
//! A sync message is applied in one store transaction: any failing
//! entry rolls the whole message back. Multi-entry messages are
//! bucketed by `(entity kind, action)` and applied in a fixed order,
//! kinds {ITEM, ATTRIBUTE, RELATION} by actions {CREATE, UPDATE,
//! DELETE}, so parent rows exist before children are inserted.
//! Deletes use the hard variant even when soft delete is on: the
//! server's delete is authoritative.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use trellis_api::error::ResultExt;
use trellis_api::{
    actor, Attribute, EntityKind, Error, Item, Relation, Result, SyncAction, SyncEntry,
    SyncMessage, SYNC_POLICY_DONT_SYNC,
};

use crate::services::{attributes, items, relations};
use crate::store::{Store, TxContext};

/// Applies a full sync message atomically.
pub fn apply(store: &Store, message: &SyncMessage) -> Result<()> {
    if message.is_empty() {
        return Ok(());
    }

    // Fast path: one entry, no grouping fields
    if message.len() == 1 {
        return store
            .with_tx(|ctx| {
                ctx.force_hard_delete();
                apply_entry(ctx, &message[0])
            })
            .context("failed to handle sync message");
    }

    let mut buckets: BTreeMap<(EntityKind, SyncAction), Vec<&SyncEntry>> = BTreeMap::new();
    for entry in message {
        buckets
            .entry((entry.entity_type, entry.action))
            .or_default()
            .push(entry);
    }

    store
        .with_tx(|ctx| {
            ctx.force_hard_delete();

            let tx_len: i64 = message.iter().map(payload_rows).sum();
            ctx.set_batch(Uuid::new_v4().to_string(), tx_len);

            for kind in EntityKind::ALL {
                for action in SyncAction::ALL {
                    if let Some(entries) = buckets.get(&(kind, action)) {
                        for entry in entries {
                            apply_entry(ctx, entry)?;
                        }
                    }
                }
            }
            Ok(())
        })
        .context("failed to handle sync message")
}

/// Rows a payload contributes to the batch length: the entity itself
/// plus any nested attributes.
fn payload_rows(entry: &SyncEntry) -> i64 {
    match &entry.payload {
        Some(payload) => {
            let nested = payload
                .get("attributes")
                .and_then(Value::as_array)
                .map(|a| a.len() as i64)
                .unwrap_or(0);
            1 + nested
        }
        None => 0,
    }
}

fn apply_entry(ctx: &mut TxContext<'_>, entry: &SyncEntry) -> Result<()> {
    // Rows flagged DONT_SYNC are never touched by the protocol
    let sync_policy = match entry.entity_type {
        EntityKind::Item => items::sync_policy(ctx.conn(), &entry.entity_id)?,
        EntityKind::Attribute => attributes::sync_policy(ctx.conn(), &entry.entity_id)?,
        EntityKind::Relation => {
            let (parent_id, child_id) = Relation::parse_composite_id(&entry.entity_id)?;
            relations::sync_policy(ctx.conn(), &parent_id, &child_id)?
        }
    };

    if sync_policy.as_deref() == Some(SYNC_POLICY_DONT_SYNC) {
        tracing::debug!(
            entity_id = %entry.entity_id,
            "sync policy excludes entity, skipping synchronization"
        );
        return Ok(());
    }

    // Idempotence: an entity already at the incoming version is left
    // alone
    if entry.action != SyncAction::Delete && !entry.version.is_empty() {
        let current = match entry.entity_type {
            EntityKind::Item => items::version_in_tx(ctx.conn(), &entry.entity_id)?,
            EntityKind::Attribute => attributes::version_in_tx(ctx.conn(), &entry.entity_id)?,
            EntityKind::Relation => {
                let (parent_id, child_id) = Relation::parse_composite_id(&entry.entity_id)?;
                relations::version_in_tx(ctx.conn(), &parent_id, &child_id)?
            }
        };
        if current.as_deref() == Some(entry.version.as_str()) {
            tracing::debug!(
                entity_id = %entry.entity_id,
                version = %entry.version,
                "entity already at requested version"
            );
            return Ok(());
        }
    }

    // The server's version is authoritative: stamp it into the payload
    // so the store does not recompute it
    let payload = entry.payload.as_ref().map(|payload| {
        let mut payload = payload.clone();
        if entry.action != SyncAction::Delete && !entry.version.is_empty() {
            payload.insert("version".into(), Value::String(entry.version.clone()));
            payload.insert("sync_version".into(), Value::String(entry.version.clone()));
        }
        payload
    });

    match entry.action {
        SyncAction::Create => create_entry(ctx, entry, payload)?,
        SyncAction::Update => update_entry(ctx, entry, payload)?,
        SyncAction::Delete => delete_entry(ctx, entry)?,
    }

    Ok(())
}

fn update_entry(
    ctx: &mut TxContext<'_>,
    entry: &SyncEntry,
    payload: Option<Map<String, Value>>,
) -> Result<()> {
    let result = match entry.entity_type {
        EntityKind::Relation => {
            // Relations carry no mutable fields: an UPDATE is an
            // existence check, falling through to CREATE when missing
            let (parent_id, child_id) = Relation::parse_composite_id(&entry.entity_id)?;
            match relations::fetch(ctx.conn(), &parent_id, &child_id)? {
                Some(_) => Ok(()),
                None => Err(Error::NotFound {
                    kind: "relation",
                    id: entry.entity_id.clone(),
                }),
            }
        }
        EntityKind::Item | EntityKind::Attribute => {
            let mut patch = payload.clone().ok_or_else(|| {
                Error::InvalidData(format!(
                    "sync update for '{}' carries no payload",
                    entry.entity_id
                ))
            })?;
            patch.insert("id".into(), Value::String(entry.entity_id.clone()));
            if entry.entity_type == EntityKind::Item {
                items::update_tx(ctx, &patch, actor::SYNC)
            } else {
                attributes::update_tx(ctx, &patch, actor::SYNC)
            }
        }
    };

    match result {
        Err(e) if e.is_not_found() => create_entry(ctx, entry, payload),
        other => other,
    }
}

fn delete_entry(ctx: &mut TxContext<'_>, entry: &SyncEntry) -> Result<()> {
    let result = match entry.entity_type {
        EntityKind::Item => items::delete_tx(ctx, &entry.entity_id, actor::SYNC),
        EntityKind::Attribute => attributes::delete_tx(ctx, &entry.entity_id, actor::SYNC),
        EntityKind::Relation => {
            let (parent_id, child_id) = Relation::parse_composite_id(&entry.entity_id)?;
            relations::delete_tx(ctx, &parent_id, &child_id, actor::SYNC)
        }
    };

    match result {
        Err(e) if e.is_not_found() => {
            // Already gone; the outcome the server asked for
            tracing::debug!(
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                "entity to delete does not exist"
            );
            Ok(())
        }
        other => other,
    }
}

fn create_entry(
    ctx: &mut TxContext<'_>,
    entry: &SyncEntry,
    payload: Option<Map<String, Value>>,
) -> Result<()> {
    let payload = payload.ok_or_else(|| {
        Error::InvalidData(format!(
            "sync create for '{}' carries no payload",
            entry.entity_id
        ))
    })?;
    let payload = Value::Object(payload);

    match entry.entity_type {
        EntityKind::Item => {
            let mut item: Item = deserialize(payload, "item")?;
            if item.id.is_empty() {
                item.id = entry.entity_id.clone();
            }
            if !entry.version.is_empty() {
                item.meta.sync_version = Some(entry.version.clone());
            }
            items::create_tx(ctx, std::slice::from_ref(&item), actor::SYNC)
        }
        EntityKind::Attribute => {
            let mut attribute: Attribute = deserialize(payload, "attribute")?;
            if attribute.id.is_empty() {
                attribute.id = entry.entity_id.clone();
            }
            if !entry.version.is_empty() {
                attribute.meta.sync_version = Some(entry.version.clone());
            }
            attributes::create_tx(ctx, std::slice::from_ref(&attribute), actor::SYNC)
        }
        EntityKind::Relation => {
            let mut relation: Relation = deserialize(payload, "relation")?;
            if relation.parent_id.is_empty() || relation.child_id.is_empty() {
                let (parent_id, child_id) = Relation::parse_composite_id(&entry.entity_id)?;
                relation.parent_id = parent_id;
                relation.child_id = child_id;
            }
            if !entry.version.is_empty() {
                relation.meta.version = entry.version.clone();
                relation.meta.sync_version = Some(entry.version.clone());
            }
            relations::create_tx(ctx, std::slice::from_ref(&relation), actor::SYNC)
        }
    }
}

fn deserialize<T: serde::de::DeserializeOwned>(payload: Value, kind: &str) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| Error::DeserializationFailed(format!("sync {kind} payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::journal;
    use serde_json::json;

    fn memory_store() -> Store {
        Store::open(&StoreConfig {
            url: ":memory:".into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn entry(
        entity_type: EntityKind,
        entity_id: &str,
        action: SyncAction,
        version: &str,
        payload: Option<Value>,
    ) -> SyncEntry {
        SyncEntry {
            entity_type,
            entity_id: entity_id.into(),
            version: version.into(),
            action,
            payload: payload.map(|p| match p {
                Value::Object(map) => map,
                _ => panic!("payload must be an object"),
            }),
        }
    }

    fn create_item_entry(id: &str, version: &str) -> SyncEntry {
        entry(
            EntityKind::Item,
            id,
            SyncAction::Create,
            version,
            Some(json!({"id": id, "name": format!("{id}-name"), "type": "t"})),
        )
    }

    #[test]
    fn test_single_create() {
        let store = memory_store();
        apply(&store, &vec![create_item_entry("I1", "v1")]).unwrap();

        let item = items::get_by_id(&store, "I1").unwrap();
        assert_eq!(item.meta.version, "v1");
        assert_eq!(item.meta.sync_version.as_deref(), Some("v1"));
        assert_eq!(item.meta.modified_by, actor::SYNC);
    }

    #[test]
    fn test_idempotent_replay() {
        let store = memory_store();
        let message = vec![create_item_entry("I1", "v7")];
        apply(&store, &message).unwrap();
        // Replaying the identical message is a no-op
        apply(&store, &message).unwrap();

        assert_eq!(items::count(&store).unwrap(), 1);
        let item = items::get_by_id(&store, "I1").unwrap();
        assert_eq!(item.meta.sync_version.as_deref(), Some("v7"));
    }

    #[test]
    fn test_kind_ordering_lets_relations_follow_items() {
        let store = memory_store();
        // Deliberately scrambled: the relation and child arrive before
        // the parent
        let message = vec![
            entry(
                EntityKind::Relation,
                "P->C",
                SyncAction::Create,
                "vr",
                Some(json!({"parent_id": "P", "child_id": "C"})),
            ),
            create_item_entry("C", "vc"),
            create_item_entry("P", "vp"),
        ];
        apply(&store, &message).unwrap();

        assert_eq!(items::count(&store).unwrap(), 2);
        assert_eq!(relations::count(&store).unwrap(), 1);
        relations::get(&store, "P", "C").unwrap();
    }

    #[test]
    fn test_batch_shares_tx_uuid_and_len() {
        let store = memory_store();
        let message = vec![create_item_entry("I1", "v1"), create_item_entry("I2", "v2")];
        apply(&store, &message).unwrap();

        let events = journal::peek(&store, 10).unwrap();
        assert_eq!(events.len(), 2);
        let uuid = events[0].tx_uuid.clone().unwrap();
        for event in &events {
            assert_eq!(event.tx_uuid.as_deref(), Some(uuid.as_str()));
            assert_eq!(event.tx_len, 2);
        }
    }

    #[test]
    fn test_update_falls_through_to_create() {
        let store = memory_store();
        let message = vec![entry(
            EntityKind::Item,
            "I1",
            SyncAction::Update,
            "v1",
            Some(json!({"name": "fresh", "type": "t"})),
        )];
        apply(&store, &message).unwrap();

        let item = items::get_by_id(&store, "I1").unwrap();
        assert_eq!(item.name, "fresh");
        assert_eq!(item.meta.version, "v1");
    }

    #[test]
    fn test_update_patches_existing() {
        let store = memory_store();
        apply(&store, &vec![create_item_entry("I1", "v1")]).unwrap();
        apply(
            &store,
            &vec![entry(
                EntityKind::Item,
                "I1",
                SyncAction::Update,
                "v2",
                Some(json!({"name": "renamed"})),
            )],
        )
        .unwrap();

        let item = items::get_by_id(&store, "I1").unwrap();
        assert_eq!(item.name, "renamed");
        assert_eq!(item.meta.version, "v2");
        assert_eq!(item.meta.sync_version.as_deref(), Some("v2"));
    }

    #[test]
    fn test_delete_is_benign_when_missing() {
        let store = memory_store();
        let message = vec![entry(EntityKind::Item, "ghost", SyncAction::Delete, "", None)];
        apply(&store, &message).unwrap();
    }

    #[test]
    fn test_delete_is_hard_even_with_soft_delete_on() {
        let store = Store::open(&StoreConfig {
            url: ":memory:".into(),
            soft_delete: true,
            ..Default::default()
        })
        .unwrap();
        apply(&store, &vec![create_item_entry("I1", "v1")]).unwrap();
        apply(
            &store,
            &vec![entry(EntityKind::Item, "I1", SyncAction::Delete, "", None)],
        )
        .unwrap();

        // The row is physically gone, not soft-deleted
        let raw: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
                    .map_err(crate::store::map_sqlite_err)
            })
            .unwrap();
        assert_eq!(raw, 0);
    }

    #[test]
    fn test_dont_sync_policy_blocks_all_actions() {
        let store = memory_store();
        items::create(
            &store,
            &[Item {
                id: "I1".into(),
                name: "local".into(),
                kind: "t".into(),
                meta: trellis_api::Meta {
                    sync_policy: Some(SYNC_POLICY_DONT_SYNC.into()),
                    ..Default::default()
                },
                ..Default::default()
            }],
            "TEST",
        )
        .unwrap();

        for action in [SyncAction::Update, SyncAction::Delete] {
            apply(
                &store,
                &vec![entry(
                    EntityKind::Item,
                    "I1",
                    action,
                    "v9",
                    Some(json!({"name": "hijacked"})),
                )],
            )
            .unwrap();
        }

        let item = items::get_by_id(&store, "I1").unwrap();
        assert_eq!(item.name, "local");
    }

    #[test]
    fn test_failing_entry_rolls_back_whole_message() {
        let store = memory_store();
        // The relation's parent is deleted in the same message before
        // relations apply, so the create hits a foreign key error and
        // nothing survives
        let message = vec![
            create_item_entry("P", "vp"),
            create_item_entry("C", "vc"),
            entry(
                EntityKind::Relation,
                "P->C",
                SyncAction::Create,
                "vr",
                Some(json!({"parent_id": "P", "child_id": "C"})),
            ),
            entry(EntityKind::Item, "P", SyncAction::Delete, "", None),
        ];
        assert!(apply(&store, &message).is_err());

        assert_eq!(items::count(&store).unwrap(), 0);
        assert_eq!(relations::count(&store).unwrap(), 0);
        assert_eq!(journal::count(&store).unwrap(), 0);
    }
}
