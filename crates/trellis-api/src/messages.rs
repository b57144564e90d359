use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::entity::{EntityKind, EntityVersion, EventKind};

/// Posted to the connected topic after a session is established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connected {
    pub device_id: String,
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Value>,
}

/// Posted to the disconnected topic on graceful disconnect, and
/// registered as the transport's last will with `timestamp: null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disconnected {
    pub device_id: String,
    pub timestamp: Option<i64>,
}

/// A paged snapshot of entity versions, keyed by entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versions {
    pub timestamp: i64,
    pub versions: BTreeMap<EntityKind, Vec<EntityVersion>>,
}

/// Outbound wire form of a journalled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: i64,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub triggered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_uuid: Option<String>,
    pub tx_type: EventKind,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tx_len: i64,
    pub tx_index: i64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Map<String, Value>>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Action requested by a sync entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncAction {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl SyncAction {
    pub const ALL: [SyncAction; 3] = [SyncAction::Create, SyncAction::Update, SyncAction::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "CREATE",
            SyncAction::Update => "UPDATE",
            SyncAction::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for SyncAction {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(SyncAction::Create),
            "UPDATE" => Ok(SyncAction::Update),
            "DELETE" => Ok(SyncAction::Delete),
            other => Err(crate::error::Error::InvalidAction(other.to_string())),
        }
    }
}

/// One entry of an inbound sync batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub entity_type: EntityKind,
    pub entity_id: String,
    #[serde(default)]
    pub version: String,
    pub action: SyncAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

/// An inbound sync message: an ordered list of entries applied as one
/// transaction.
pub type SyncMessage = Vec<SyncEntry>;

/// Server-initiated query kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "GET_VERSION")]
    GetVersion,
    #[serde(rename = "GET_ALL_VERSIONS")]
    GetAllVersions,
    #[serde(rename = "GET_ENTITY")]
    GetEntity,
    #[serde(rename = "GET_TELEMETRY")]
    GetTelemetry,
    /// Unrecognized commands still produce a failure response carrying
    /// the originating uuid, so they must survive deserialization.
    #[serde(other)]
    Unknown,
}

/// A server-initiated query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub uuid: String,
    pub command_type: CommandKind,
    /// Absent and empty-string forms both mean "no entity kind"; some
    /// senders serialize their zero value instead of omitting the
    /// field.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "entity_kind_or_empty"
    )]
    pub entity_type: Option<EntityKind>,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Map<String, Value>>,
}

fn entity_kind_or_empty<'de, D>(deserializer: D) -> Result<Option<EntityKind>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(kind) => kind.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Reply to a [`ServerCommand`], published to a topic derived from the
/// command's uuid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub uuid: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Map<String, Value>>,
}

impl CommandResponse {
    pub fn ok(uuid: impl Into<String>, body: Option<Map<String, Value>>) -> Self {
        CommandResponse {
            uuid: uuid.into(),
            success: true,
            error: None,
            body,
        }
    }

    pub fn err(uuid: impl Into<String>, error: impl ToString) -> Self {
        CommandResponse {
            uuid: uuid.into(),
            success: false,
            error: Some(error.to_string()),
            body: None,
        }
    }
}
