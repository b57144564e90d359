//! Table definitions and migrations.

use rusqlite::Connection;

use trellis_api::{EntityKind, Error, Result};

use super::map_sqlite_err;

pub const ITEMS_TABLE: &str = "items";
pub const ATTRIBUTES_TABLE: &str = "attributes";
pub const RELATIONS_TABLE: &str = "relations";
pub const EVENTS_TABLE: &str = "events_queue";

pub const ALL_TABLES: [&str; 4] = [ITEMS_TABLE, ATTRIBUTES_TABLE, RELATIONS_TABLE, EVENTS_TABLE];

pub fn table_of(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Item => ITEMS_TABLE,
        EntityKind::Attribute => ATTRIBUTES_TABLE,
        EntityKind::Relation => RELATIONS_TABLE,
    }
}

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id               TEXT PRIMARY KEY NOT NULL,
    name             TEXT NOT NULL UNIQUE,
    type             TEXT NOT NULL,
    customer_id      TEXT,
    edge_mac         TEXT,
    created_at       INTEGER NOT NULL,
    modified_at      INTEGER NOT NULL,
    created_by       TEXT NOT NULL,
    modified_by      TEXT NOT NULL,
    source_timestamp INTEGER NOT NULL DEFAULT 0,
    sync_policy      TEXT,
    version          TEXT NOT NULL,
    sync_version     TEXT,
    deleted_at       INTEGER
);

CREATE INDEX IF NOT EXISTS idx_items_type ON items (type);

CREATE TABLE IF NOT EXISTS attributes (
    id               TEXT PRIMARY KEY NOT NULL,
    name             TEXT NOT NULL,
    type             TEXT NOT NULL,
    value            TEXT,
    value_type       TEXT,
    item_id          TEXT NOT NULL
                     REFERENCES items (id) ON UPDATE CASCADE ON DELETE CASCADE,
    created_at       INTEGER NOT NULL,
    modified_at      INTEGER NOT NULL,
    created_by       TEXT NOT NULL,
    modified_by      TEXT NOT NULL,
    source_timestamp INTEGER NOT NULL DEFAULT 0,
    sync_policy      TEXT,
    version          TEXT NOT NULL,
    sync_version     TEXT,
    deleted_at       INTEGER,
    UNIQUE (item_id, name)
);

CREATE INDEX IF NOT EXISTS idx_attributes_type ON attributes (type);
CREATE INDEX IF NOT EXISTS idx_attributes_item_id ON attributes (item_id);

CREATE TABLE IF NOT EXISTS relations (
    parent_id        TEXT NOT NULL
                     REFERENCES items (id) ON UPDATE CASCADE ON DELETE CASCADE,
    child_id         TEXT NOT NULL
                     REFERENCES items (id) ON UPDATE CASCADE ON DELETE CASCADE,
    created_at       INTEGER NOT NULL,
    modified_at      INTEGER NOT NULL,
    created_by       TEXT NOT NULL,
    modified_by      TEXT NOT NULL,
    source_timestamp INTEGER NOT NULL DEFAULT 0,
    sync_policy      TEXT,
    version          TEXT NOT NULL,
    sync_version     TEXT,
    deleted_at       INTEGER,
    PRIMARY KEY (parent_id, child_id)
);

CREATE INDEX IF NOT EXISTS idx_relations_child_id ON relations (child_id);

CREATE TABLE IF NOT EXISTS events_queue (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type   TEXT NOT NULL,
    entity_type  TEXT NOT NULL,
    entity_id    TEXT NOT NULL,
    triggered_by TEXT NOT NULL,
    tx_uuid      TEXT,
    tx_len       INTEGER NOT NULL DEFAULT 0,
    tx_index     INTEGER NOT NULL DEFAULT 0,
    timestamp    INTEGER NOT NULL,
    body         TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_events_entity
    ON events_queue (entity_type, entity_id, triggered_by);
"#;

fn has_table(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .map_err(map_sqlite_err)?;
    Ok(count > 0)
}

/// Creates missing tables. With `always` the DDL runs unconditionally
/// (it is idempotent), matching the always-migrate configuration.
pub fn migrate(conn: &Connection, always: bool) -> Result<()> {
    let mut should_migrate = always;
    if !should_migrate {
        for table in ALL_TABLES {
            if !has_table(conn, table)? {
                should_migrate = true;
                break;
            }
        }
    }

    if should_migrate {
        conn.execute_batch(DDL)
            .map_err(|e| Error::Store(format!("migrations failed: {e}")))?;
        tracing::debug!("store migrations applied");
    }

    Ok(())
}
