//! Server command handling.

use serde_json::{Map, Value};

use trellis_api::{CommandKind, EntityKind, Error, Result, ServerCommand};

use crate::services::{attributes, items};
use crate::store::Store;
use crate::telemetry;

/// What a command resolves to: a response body, or a request to
/// republish the full versions snapshot.
#[derive(Debug)]
pub enum CommandOutcome {
    Body(Option<Map<String, Value>>),
    PublishVersions,
}

pub fn run(store: &Store, command: &ServerCommand) -> Result<CommandOutcome> {
    match command.command_type {
        CommandKind::GetVersion => version_body(store, command).map(CommandOutcome::Body),
        CommandKind::GetAllVersions => Ok(CommandOutcome::PublishVersions),
        CommandKind::GetEntity => entity_body(store, command).map(CommandOutcome::Body),
        CommandKind::GetTelemetry => telemetry_body(store).map(CommandOutcome::Body),
        CommandKind::Unknown => Err(Error::InvalidData("unknown command type".into())),
    }
}

fn version_body(store: &Store, command: &ServerCommand) -> Result<Option<Map<String, Value>>> {
    let version = match command.entity_type {
        Some(EntityKind::Item) => items::version_of(store, &command.entity_id)?,
        Some(EntityKind::Attribute) => attributes::version_of(store, &command.entity_id)?,
        Some(other) => {
            return Err(Error::InvalidEntityType(other.to_string()));
        }
        None => return Err(Error::InvalidEntityType(String::new())),
    };

    let mut body = Map::new();
    body.insert("version".into(), Value::String(version));
    Ok(Some(body))
}

fn entity_body(store: &Store, command: &ServerCommand) -> Result<Option<Map<String, Value>>> {
    let entity = match command.entity_type {
        Some(EntityKind::Item) => {
            serde_json::to_value(items::get_by_id(store, &command.entity_id)?)
        }
        Some(EntityKind::Attribute) => {
            serde_json::to_value(attributes::get_by_id(store, &command.entity_id)?)
        }
        Some(other) => return Err(Error::InvalidEntityType(other.to_string())),
        None => return Err(Error::InvalidEntityType(String::new())),
    }
    .map_err(|e| Error::SerializationFailed(e.to_string()))?;

    match entity {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(Error::SerializationFailed(
            "entity did not serialize to a JSON object".into(),
        )),
    }
}

fn telemetry_body(store: &Store) -> Result<Option<Map<String, Value>>> {
    let data = telemetry::snapshot(store)?;
    match serde_json::to_value(data) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(Error::SerializationFailed(
            "telemetry did not serialize to a JSON object".into(),
        )),
        Err(e) => Err(Error::SerializationFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::services::items;
    use trellis_api::Item;

    fn store_with_item() -> Store {
        let store = Store::open(&StoreConfig {
            url: ":memory:".into(),
            ..Default::default()
        })
        .unwrap();
        items::create(
            &store,
            &[Item {
                id: "I1".into(),
                name: "one".into(),
                kind: "t".into(),
                ..Default::default()
            }],
            "TEST",
        )
        .unwrap();
        store
    }

    fn command(kind: CommandKind, entity_type: Option<EntityKind>, entity_id: &str) -> ServerCommand {
        ServerCommand {
            uuid: "u1".into(),
            command_type: kind,
            entity_type,
            entity_id: entity_id.into(),
            body: None,
        }
    }

    #[test]
    fn test_get_version() {
        let store = store_with_item();
        let expected = items::version_of(&store, "I1").unwrap();

        let outcome = run(
            &store,
            &command(CommandKind::GetVersion, Some(EntityKind::Item), "I1"),
        )
        .unwrap();
        match outcome {
            CommandOutcome::Body(Some(body)) => {
                assert_eq!(body["version"], Value::String(expected));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_get_entity() {
        let store = store_with_item();
        let outcome = run(
            &store,
            &command(CommandKind::GetEntity, Some(EntityKind::Item), "I1"),
        )
        .unwrap();
        match outcome {
            CommandOutcome::Body(Some(body)) => {
                assert_eq!(body["id"], "I1");
                assert_eq!(body["name"], "one");
                assert_eq!(body["type"], "t");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_get_entity_unknown_kind() {
        let store = store_with_item();
        let err = run(
            &store,
            &command(CommandKind::GetVersion, Some(EntityKind::Relation), "P->C"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidEntityType(_)));
    }

    #[test]
    fn test_get_all_versions_delegates() {
        let store = store_with_item();
        let outcome = run(&store, &command(CommandKind::GetAllVersions, None, "")).unwrap();
        assert!(matches!(outcome, CommandOutcome::PublishVersions));
    }

    #[test]
    fn test_unknown_command_errors() {
        let store = store_with_item();
        assert!(run(&store, &command(CommandKind::Unknown, None, "")).is_err());
    }

    #[test]
    fn test_get_telemetry() {
        let store = store_with_item();
        let outcome = run(&store, &command(CommandKind::GetTelemetry, None, "")).unwrap();
        match outcome {
            CommandOutcome::Body(Some(body)) => {
                assert_eq!(body["items_count"], 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
