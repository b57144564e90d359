pub mod entity;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export entity types
pub use entity::{
    Attribute, EntityKind, EntityVersion, Event, EventKind, Item, Meta, Relation,
    COMPOSITE_ID_SEPARATOR,
};

// Re-export error types
pub use error::{Error, Result};

// Re-export wire messages
pub use messages::{
    CommandKind, CommandResponse, Connected, Disconnected, EventMessage, ServerCommand,
    SyncAction, SyncEntry, SyncMessage, Versions,
};

// Re-export transport capability traits
pub use transport::{TransportClient, TransportHandler};

/// Actor tags identifying the origin of a mutation.
/// They end up in `created_by` / `modified_by` / `triggered_by` columns
/// and on the wire, so they are part of the protocol.
pub mod actor {
    pub const SYNC: &str = "SYNC";
    pub const HTTP_API: &str = "HTTP_API";
}

/// Sync policy value that excludes a row from the sync protocol.
pub const SYNC_POLICY_DONT_SYNC: &str = "DONT_SYNC";

/// Meta columns stripped from an entity's JSON form before its version
/// checksum is computed.
pub const META_FIELDS: &[&str] = &[
    "version",
    "sync_version",
    "created_at",
    "modified_at",
    "deleted_at",
];
