//! The event journal.
//!
//! Every entity mutation journals one event row in the same
//! transaction; the sync worker drains rows to the transport and
//! removes exactly what it delivered. Coalescing keeps the queue
//! minimal while the link is down:
//!
//! - a DELETED cancels an outstanding CREATED by the same actor
//!   instead of being stored (the pair is a no-op downstream);
//! - an UPDATED merges into the last outstanding CREATED or UPDATED by
//!   the same actor (top-level body patch merge, timestamp refreshed);
//! - everything else inserts a new row tagged with the transaction
//!   context's grouping fields.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use trellis_api::{EntityKind, Error, Event, EventKind, Result};

use crate::store::{map_sqlite_err, Store, TxContext};

const EVENT_COLUMNS: &str =
    "id, event_type, entity_type, entity_id, triggered_by, tx_uuid, tx_len, tx_index, timestamp, body";

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(1)?;
    let entity_type: String = row.get(2)?;
    Ok(Event {
        id: row.get(0)?,
        event_type: event_type.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown event kind '{event_type}'").into(),
            )
        })?,
        entity_type: entity_type.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown entity kind '{entity_type}'").into(),
            )
        })?,
        entity_id: row.get(3)?,
        triggered_by: row.get(4)?,
        tx_uuid: row.get(5)?,
        tx_len: row.get(6)?,
        tx_index: row.get(7)?,
        timestamp: row.get(8)?,
        body: row.get(9)?,
    })
}

/// Journals one mutation, applying the coalescing rules.
pub fn publish(
    ctx: &mut TxContext<'_>,
    event_type: EventKind,
    entity_type: EntityKind,
    entity_id: &str,
    triggered_by: &str,
    body: &Value,
) -> Result<()> {
    let timestamp = ctx.now_ms();

    match event_type {
        EventKind::Deleted => {
            let cancelled = ctx
                .conn()
                .execute(
                    "DELETE FROM events_queue
                     WHERE entity_type = ?1 AND entity_id = ?2
                       AND triggered_by = ?3 AND event_type = ?4",
                    params![
                        entity_type.as_str(),
                        entity_id,
                        triggered_by,
                        EventKind::Created.as_str()
                    ],
                )
                .map_err(map_sqlite_err)?;
            if cancelled > 0 {
                // The create never left the device; the pair is a no-op
                tracing::debug!(%entity_type, entity_id, "delete cancelled outstanding create");
                return Ok(());
            }
        }
        EventKind::Updated => {
            if try_merge_update(ctx, entity_type, entity_id, triggered_by, body, timestamp)? {
                return Ok(());
            }
        }
        EventKind::Created => {}
    }

    let body_text =
        serde_json::to_string(body).map_err(|e| Error::SerializationFailed(e.to_string()))?;

    ctx.conn()
        .execute(
            "INSERT INTO events_queue
             (event_type, entity_type, entity_id, triggered_by,
              tx_uuid, tx_len, tx_index, timestamp, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event_type.as_str(),
                entity_type.as_str(),
                entity_id,
                triggered_by,
                ctx.tx_uuid(),
                ctx.tx_len(),
                ctx.tx_index(),
                timestamp,
                body_text,
            ],
        )
        .map_err(map_sqlite_err)?;

    tracing::debug!(%event_type, %entity_type, entity_id, "event journalled");

    ctx.inc_tx_index();
    Ok(())
}

/// Merges an UPDATED body into the last outstanding CREATED or UPDATED
/// row by the same actor. Returns true when a merge happened.
fn try_merge_update(
    ctx: &TxContext<'_>,
    entity_type: EntityKind,
    entity_id: &str,
    triggered_by: &str,
    patch: &Value,
    timestamp: i64,
) -> Result<bool> {
    let mut previous = last_of_type(ctx.conn(), EventKind::Created, entity_type, entity_id)?;
    if previous.is_none() {
        previous = last_of_type(ctx.conn(), EventKind::Updated, entity_type, entity_id)?;
    }

    let Some(previous) = previous else {
        return Ok(false);
    };
    if previous.triggered_by != triggered_by {
        // A different actor's event must not absorb this change
        return Ok(false);
    }

    let mut body = previous.body_object()?;
    if let Value::Object(patch) = patch {
        for (key, value) in patch {
            body.insert(key.clone(), value.clone());
        }
    }
    let body_text = serde_json::to_string(&body)
        .map_err(|e| Error::SerializationFailed(e.to_string()))?;

    ctx.conn()
        .execute(
            "UPDATE events_queue SET timestamp = ?1, body = ?2 WHERE id = ?3",
            params![timestamp, body_text, previous.id],
        )
        .map_err(map_sqlite_err)?;

    tracing::debug!(%entity_type, entity_id, event_id = previous.id, "update merged into outstanding event");
    Ok(true)
}

fn last_of_type(
    conn: &Connection,
    event_type: EventKind,
    entity_type: EntityKind,
    entity_id: &str,
) -> Result<Option<Event>> {
    conn.query_row(
        &format!(
            "SELECT {EVENT_COLUMNS} FROM events_queue
             WHERE event_type = ?1 AND entity_type = ?2 AND entity_id = ?3
             ORDER BY id DESC LIMIT 1"
        ),
        params![event_type.as_str(), entity_type.as_str(), entity_id],
        event_from_row,
    )
    .optional()
    .map_err(map_sqlite_err)
}

fn first_events(conn: &Connection, limit: i64) -> Result<Vec<Event>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events_queue
             ORDER BY id ASC, timestamp LIMIT ?1"
        ))
        .map_err(map_sqlite_err)?;
    let rows = stmt
        .query_map([limit], event_from_row)
        .map_err(map_sqlite_err)?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row.map_err(map_sqlite_err)?);
    }
    Ok(events)
}

/// The oldest `limit` events in delivery order, left in place.
pub fn peek(store: &Store, limit: i64) -> Result<Vec<Event>> {
    store.with_conn(|conn| first_events(conn, limit))
}

/// The newest `limit` events, newest first.
pub fn last(store: &Store, limit: i64) -> Result<Vec<Event>> {
    store.with_conn(|conn| {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events_queue
                 ORDER BY id DESC, timestamp LIMIT ?1"
            ))
            .map_err(map_sqlite_err)?;
        let rows = stmt
            .query_map([limit], event_from_row)
            .map_err(map_sqlite_err)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(map_sqlite_err)?);
        }
        Ok(events)
    })
}

pub fn count(store: &Store) -> Result<i64> {
    store.with_conn(|conn| {
        conn.query_row("SELECT COUNT(*) FROM events_queue", [], |row| row.get(0))
            .map_err(map_sqlite_err)
    })
}

/// Delivers up to `limit` oldest events through `deliver` and deletes
/// exactly those rows. Runs inside the caller's transaction: a
/// `deliver` failure rolls everything back and no rows are removed.
///
/// Returns [`Error::NotFound`] when the queue is empty, which the
/// worker treats as "no work".
pub fn drain(
    ctx: &mut TxContext<'_>,
    limit: i64,
    deliver: impl FnOnce(&[Event]) -> Result<()>,
) -> Result<usize> {
    let events = first_events(ctx.conn(), limit)?;
    if events.is_empty() {
        return Err(Error::not_found("event", "queue"));
    }

    deliver(&events)?;

    for event in &events {
        ctx.conn()
            .execute("DELETE FROM events_queue WHERE id = ?1", [event.id])
            .map_err(map_sqlite_err)?;
    }

    Ok(events.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use serde_json::json;

    fn memory_store() -> Store {
        Store::open(&StoreConfig {
            url: ":memory:".into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn publish_one(
        store: &Store,
        event_type: EventKind,
        entity_id: &str,
        actor: &str,
        body: Value,
    ) {
        store
            .with_tx(|ctx| publish(ctx, event_type, EntityKind::Item, entity_id, actor, &body))
            .unwrap();
    }

    #[test]
    fn test_publish_and_peek_order() {
        let store = memory_store();
        publish_one(&store, EventKind::Created, "I1", "TEST", json!({"id": "I1"}));
        publish_one(&store, EventKind::Created, "I2", "TEST", json!({"id": "I2"}));

        let events = peek(&store, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].entity_id, "I1");
        assert_eq!(events[1].entity_id, "I2");
        assert!(events[0].id < events[1].id);
        // Peek leaves rows in place
        assert_eq!(count(&store).unwrap(), 2);
    }

    #[test]
    fn test_delete_cancels_outstanding_create() {
        let store = memory_store();
        publish_one(&store, EventKind::Created, "I1", "TEST", json!({"id": "I1"}));
        publish_one(&store, EventKind::Deleted, "I1", "TEST", json!({"id": "I1"}));
        assert_eq!(count(&store).unwrap(), 0);
    }

    #[test]
    fn test_delete_without_create_is_stored() {
        let store = memory_store();
        publish_one(&store, EventKind::Deleted, "I1", "TEST", json!({"id": "I1"}));
        let events = peek(&store, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventKind::Deleted);
    }

    #[test]
    fn test_update_merges_into_create() {
        let store = memory_store();
        publish_one(
            &store,
            EventKind::Created,
            "I1",
            "TEST",
            json!({"id": "I1", "name": "old", "type": "t"}),
        );
        publish_one(&store, EventKind::Updated, "I1", "TEST", json!({"name": "new"}));

        let events = peek(&store, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventKind::Created);
        let body = events[0].body_object().unwrap();
        assert_eq!(body["name"], "new");
        assert_eq!(body["type"], "t");
    }

    #[test]
    fn test_update_by_other_actor_does_not_merge() {
        let store = memory_store();
        publish_one(&store, EventKind::Created, "I1", "ACTOR_A", json!({"id": "I1"}));
        publish_one(&store, EventKind::Updated, "I1", "ACTOR_B", json!({"name": "n"}));

        let events = peek(&store, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventKind::Created);
        assert_eq!(events[1].event_type, EventKind::Updated);
    }

    #[test]
    fn test_delete_by_other_actor_does_not_cancel() {
        let store = memory_store();
        publish_one(&store, EventKind::Created, "I1", "ACTOR_A", json!({"id": "I1"}));
        publish_one(&store, EventKind::Deleted, "I1", "ACTOR_B", json!({"id": "I1"}));
        assert_eq!(count(&store).unwrap(), 2);
    }

    #[test]
    fn test_drain_removes_delivered_rows() {
        let store = memory_store();
        publish_one(&store, EventKind::Created, "I1", "TEST", json!({"id": "I1"}));
        publish_one(&store, EventKind::Created, "I2", "TEST", json!({"id": "I2"}));

        let mut delivered = Vec::new();
        let drained = store
            .with_tx(|ctx| {
                drain(ctx, 10, |events| {
                    delivered = events.to_vec();
                    Ok(())
                })
            })
            .unwrap();

        assert_eq!(drained, 2);
        assert_eq!(delivered.len(), 2);
        assert_eq!(count(&store).unwrap(), 0);
    }

    #[test]
    fn test_drain_failure_rolls_back() {
        let store = memory_store();
        publish_one(&store, EventKind::Created, "I1", "TEST", json!({"id": "I1"}));

        let result = store.with_tx(|ctx| {
            drain(ctx, 10, |_| Err(Error::Transport("broker gone".into())))
        });
        assert!(result.is_err());
        assert_eq!(count(&store).unwrap(), 1);
    }

    #[test]
    fn test_drain_empty_queue_is_not_found() {
        let store = memory_store();
        let result = store.with_tx(|ctx| drain(ctx, 10, |_| Ok(())));
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn test_drain_respects_limit() {
        let store = memory_store();
        for i in 0..5 {
            publish_one(
                &store,
                EventKind::Created,
                &format!("I{i}"),
                "TEST",
                json!({"id": format!("I{i}")}),
            );
        }
        let drained = store.with_tx(|ctx| drain(ctx, 2, |_| Ok(()))).unwrap();
        assert_eq!(drained, 2);
        assert_eq!(count(&store).unwrap(), 3);
        // Remaining events keep delivery order
        let remaining = peek(&store, 10).unwrap();
        assert_eq!(remaining[0].entity_id, "I2");
    }
}
