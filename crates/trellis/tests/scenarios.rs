//! End-to-end store scenarios exercised through the service layer.

use serde_json::{json, Map, Value};

use trellis::config::StoreConfig;
use trellis::journal;
use trellis::services::{attributes, items, relations};
use trellis::Store;
use trellis_api::{Attribute, EventKind, Item};

fn memory_store() -> Store {
    Store::open(&StoreConfig {
        url: ":memory:".into(),
        ..Default::default()
    })
    .unwrap()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

#[test]
fn test_batch_create_with_nested_attributes() {
    let store = memory_store();

    let root = Item {
        id: "I1".into(),
        name: "N1".into(),
        kind: "T".into(),
        attributes: vec![
            Attribute {
                id: "A1".into(),
                name: "a".into(),
                kind: "T".into(),
                ..Default::default()
            },
            Attribute {
                id: "A2".into(),
                name: "b".into(),
                kind: "T".into(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    items::create(&store, &[root], "TEST").unwrap();

    assert_eq!(items::count(&store).unwrap(), 1);
    assert_eq!(attributes::count(&store).unwrap(), 2);

    let events = journal::peek(&store, 10).unwrap();
    assert_eq!(events.len(), 3);
    let tx_uuid = events[0].tx_uuid.clone().expect("shared tx uuid");
    let mut indexes: Vec<i64> = events
        .iter()
        .map(|event| {
            assert_eq!(event.tx_uuid.as_deref(), Some(tx_uuid.as_str()));
            assert_eq!(event.tx_len, 3);
            event.tx_index
        })
        .collect();
    indexes.sort();
    assert_eq!(indexes, vec![0, 1, 2]);
}

#[test]
fn test_coalesced_update() {
    let store = memory_store();
    items::create(
        &store,
        &[Item {
            id: "I1".into(),
            name: "N1".into(),
            kind: "T".into(),
            ..Default::default()
        }],
        "ACTOR_A",
    )
    .unwrap();

    let patch = object(json!({"id": "I1", "name": "N2"}));
    items::update(&store, &patch, "ACTOR_A").unwrap();

    let events = journal::peek(&store, 10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventKind::Created);
    let body = events[0].body_object().unwrap();
    assert_eq!(body["name"], "N2");

    // The store row reflects the update too
    assert_eq!(items::get_by_id(&store, "I1").unwrap().name, "N2");
}

#[test]
fn test_delete_cancels_create() {
    let store = memory_store();
    items::create(
        &store,
        &[Item {
            id: "I1".into(),
            name: "N1".into(),
            kind: "T".into(),
            ..Default::default()
        }],
        "ACTOR_A",
    )
    .unwrap();

    items::delete(&store, "I1", "ACTOR_A").unwrap();

    assert_eq!(journal::count(&store).unwrap(), 0);
    assert_eq!(items::count(&store).unwrap(), 0);
}

#[test]
fn test_update_by_other_actor_stays_separate() {
    let store = memory_store();
    items::create(
        &store,
        &[Item {
            id: "I1".into(),
            name: "N1".into(),
            kind: "T".into(),
            ..Default::default()
        }],
        "ACTOR_A",
    )
    .unwrap();

    let patch = object(json!({"id": "I1", "name": "N2"}));
    items::update(&store, &patch, "ACTOR_B").unwrap();

    let events = journal::peek(&store, 10).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventKind::Created);
    assert_eq!(events[0].triggered_by, "ACTOR_A");
    assert_eq!(events[1].event_type, EventKind::Updated);
    assert_eq!(events[1].triggered_by, "ACTOR_B");
}

#[test]
fn test_item_update_with_nested_attribute_upserts() {
    let store = memory_store();
    items::create(
        &store,
        &[Item {
            id: "I1".into(),
            name: "N1".into(),
            kind: "T".into(),
            ..Default::default()
        }],
        "TEST",
    )
    .unwrap();

    let patch = object(json!({
        "id": "I1",
        "name": "N2",
        "attributes": [
            {"id": "A1", "name": "a", "type": "T", "value": "1"}
        ]
    }));
    items::update(&store, &patch, "TEST").unwrap();

    assert_eq!(items::get_by_id(&store, "I1").unwrap().name, "N2");
    let attrs = items::attributes_of(&store, "I1").unwrap();
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs[0].id, "A1");
    assert_eq!(attrs[0].item_id, "I1");

    // Second pass updates the same attribute instead of duplicating it
    let patch = object(json!({
        "id": "I1",
        "attributes": [
            {"id": "A1", "value": "2"}
        ]
    }));
    items::update(&store, &patch, "TEST").unwrap();
    let attrs = items::attributes_of(&store, "I1").unwrap();
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs[0].value.as_deref(), Some("2"));
}

#[test]
fn test_reparent_keeps_graph_consistent() {
    let store = memory_store();
    for (id, name) in [("P1", "p1"), ("P2", "p2"), ("C", "c")] {
        items::create(
            &store,
            &[Item {
                id: id.into(),
                name: name.into(),
                kind: "T".into(),
                ..Default::default()
            }],
            "TEST",
        )
        .unwrap();
    }
    relations::create(
        &store,
        &[trellis_api::Relation {
            parent_id: "P1".into(),
            child_id: "C".into(),
            ..Default::default()
        }],
        "TEST",
    )
    .unwrap();

    relations::reparent(&store, "P1", "C", "P2", "TEST").unwrap();

    assert_eq!(relations::count(&store).unwrap(), 1);
    assert!(items::children_of(&store, "P1").unwrap().is_empty());
    let children = items::children_of(&store, "P2").unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, "C");
}
