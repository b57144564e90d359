use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Separator of the two halves of a relation's composite id.
pub const COMPOSITE_ID_SEPARATOR: &str = "->";

/// The three entity kinds of the domain graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "ITEM")]
    Item,
    #[serde(rename = "ATTRIBUTE")]
    Attribute,
    #[serde(rename = "RELATION")]
    Relation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Item, EntityKind::Attribute, EntityKind::Relation];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Item => "ITEM",
            EntityKind::Attribute => "ATTRIBUTE",
            EntityKind::Relation => "RELATION",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ITEM" => Ok(EntityKind::Item),
            "ATTRIBUTE" => Ok(EntityKind::Attribute),
            "RELATION" => Ok(EntityKind::Relation),
            other => Err(Error::InvalidEntityType(other.to_string())),
        }
    }
}

/// Kinds of journalled mutation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "ENTITY_CREATED")]
    Created,
    #[serde(rename = "ENTITY_UPDATED")]
    Updated,
    #[serde(rename = "ENTITY_DELETED")]
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "ENTITY_CREATED",
            EventKind::Updated => "ENTITY_UPDATED",
            EventKind::Deleted => "ENTITY_DELETED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTITY_CREATED" => Ok(EventKind::Created),
            "ENTITY_UPDATED" => Ok(EventKind::Updated),
            "ENTITY_DELETED" => Ok(EventKind::Deleted),
            other => Err(Error::InvalidData(format!("unknown event kind '{other}'"))),
        }
    }
}

/// Metadata envelope shared by all entity kinds.
///
/// Timestamps are integer milliseconds since the Unix epoch, UTC unless
/// the store is configured for localtime. `version` is the
/// content-addressed checksum of the row's non-meta fields;
/// `sync_version` is the version last acknowledged through the sync
/// protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub modified_at: i64,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub modified_by: String,
    #[serde(default)]
    pub source_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub sync_version: Option<String>,
}

/// A node of the entity graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_mac: Option<String>,
    /// Nested attributes, accepted on create/update and expanded into
    /// their own rows. Never stored on the item itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,
    #[serde(flatten)]
    pub meta: Meta,
}

/// A property attached to an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub item_id: String,
    #[serde(flatten)]
    pub meta: Meta,
}

/// A parent/child edge between two items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub child_id: String,
    #[serde(flatten)]
    pub meta: Meta,
}

impl Relation {
    /// The canonical `parent_id->child_id` form used in events and on
    /// the wire.
    pub fn composite_id(&self) -> String {
        format!("{}{}{}", self.parent_id, COMPOSITE_ID_SEPARATOR, self.child_id)
    }

    /// Splits a composite id back into `(parent_id, child_id)`.
    pub fn parse_composite_id(id: &str) -> Result<(String, String), Error> {
        match id.split_once(COMPOSITE_ID_SEPARATOR) {
            Some((parent, child)) if !parent.is_empty() && !child.is_empty() => {
                Ok((parent.to_string(), child.to_string()))
            }
            _ => Err(Error::InvalidData(format!(
                "malformed relation composite id '{id}'"
            ))),
        }
    }
}

/// A journalled mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub event_type: EventKind,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub triggered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_uuid: Option<String>,
    #[serde(default)]
    pub tx_len: i64,
    #[serde(default)]
    pub tx_index: i64,
    pub timestamp: i64,
    /// Serialized entity (for creates/deletes) or patch (for updates).
    #[serde(default)]
    pub body: String,
}

impl Event {
    /// Deserializes the event body into a JSON object.
    pub fn body_object(&self) -> Result<serde_json::Map<String, serde_json::Value>, Error> {
        serde_json::from_str(&self.body).map_err(|e| {
            Error::DeserializationFailed(format!("event body is not a JSON object: {e}"))
        })
    }
}

/// Row projection returned by version queries and published in
/// `Versions` snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub sync_version: Option<String>,
    pub modified_at: i64,
    pub modified_by: String,
}
