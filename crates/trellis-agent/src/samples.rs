//! Sample wire messages, printed by `trellis-agent messages` so a
//! server-side integration can be built against concrete payloads.

use serde_json::json;

use trellis_api::{
    CommandKind, CommandResponse, Connected, Disconnected, EntityKind, EntityVersion, EventKind,
    EventMessage, ServerCommand, SyncAction, SyncEntry, Versions,
};

fn print_one<T: serde::Serialize>(title: &str, message: &T) {
    println!("# {title}");
    println!(
        "{}\n",
        serde_json::to_string_pretty(message).expect("samples are serializable")
    );
}

pub fn print_samples() {
    print_one(
        "connected",
        &Connected {
            device_id: "aabbccddeeff".into(),
            timestamp: Some(1_700_000_000_000),
            telemetry: None,
        },
    );

    print_one(
        "disconnected (last will carries timestamp: null)",
        &Disconnected {
            device_id: "aabbccddeeff".into(),
            timestamp: None,
        },
    );

    let mut versions = std::collections::BTreeMap::new();
    versions.insert(
        EntityKind::Item,
        vec![EntityVersion {
            id: "item-1".into(),
            version: "6c9d1f3a-0000-5000-8000-000000000000".into(),
            sync_version: None,
            modified_at: 1_700_000_000_000,
            modified_by: "HTTP_API".into(),
        }],
    );
    print_one(
        "versions",
        &Versions {
            timestamp: 1_700_000_000_000,
            versions,
        },
    );

    print_one(
        "events (outbound batch)",
        &vec![EventMessage {
            id: 1,
            entity_type: EntityKind::Item,
            entity_id: "item-1".into(),
            triggered_by: "HTTP_API".into(),
            tx_uuid: Some("0e4e4a31-1d5a-4a8e-93c8-9f3f3c1a2b4d".into()),
            tx_type: EventKind::Created,
            tx_len: 2,
            tx_index: 0,
            timestamp: 1_700_000_000_000,
            body: json!({"id": "item-1", "name": "pump-7", "type": "device"})
                .as_object()
                .cloned(),
        }],
    );

    print_one(
        "sync (inbound batch)",
        &vec![SyncEntry {
            entity_type: EntityKind::Item,
            entity_id: "item-1".into(),
            version: "6c9d1f3a-0000-5000-8000-000000000000".into(),
            action: SyncAction::Create,
            payload: json!({"id": "item-1", "name": "pump-7", "type": "device"})
                .as_object()
                .cloned(),
        }],
    );

    print_one(
        "server command",
        &ServerCommand {
            uuid: "f3b0a6de-7c41-4f0a-a5cf-2f4b1f9b6f10".into(),
            command_type: CommandKind::GetEntity,
            entity_type: Some(EntityKind::Item),
            entity_id: "item-1".into(),
            body: None,
        },
    );

    print_one(
        "command response",
        &CommandResponse {
            uuid: "f3b0a6de-7c41-4f0a-a5cf-2f4b1f9b6f10".into(),
            success: true,
            error: None,
            body: json!({"id": "item-1", "name": "pump-7", "type": "device"})
                .as_object()
                .cloned(),
        },
    );
}
