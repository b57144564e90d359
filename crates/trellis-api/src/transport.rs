use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::messages::{CommandResponse, EventMessage, ServerCommand, SyncMessage, Versions};

/// Callbacks invoked by a transport client as the session changes or
/// inbound messages arrive.
///
/// Handlers may be called from the transport's own tasks, concurrently
/// with the owner's loop; implementations must serialize their own
/// state.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// A session was established.
    async fn on_connected(&self);

    /// The session was lost. `error` is `None` on a locally requested
    /// disconnect.
    async fn on_disconnected(&self, error: Option<Error>);

    /// A sync batch arrived on one of the sync topics.
    async fn on_sync(&self, message: SyncMessage);

    /// A server command arrived on the commands topic.
    async fn on_command(&self, command: ServerCommand);
}

/// The transport capability of the sync worker.
///
/// One concrete implementation speaks MQTT with a retained session and
/// a last-will disconnect notification; tests substitute a stub. Any
/// wait that exceeds its bound returns [`Error::Timeout`]; operations
/// attempted without a session return [`Error::NotConnected`].
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Registers the callback handler. Must be called before
    /// [`connect`](Self::connect).
    fn set_handler(&self, handler: Arc<dyn TransportHandler>);

    /// Opens a session. On success the `connected` callback fires; on
    /// loss `disconnected` fires with a classified error.
    async fn connect(&self) -> Result<()>;

    /// Publishes the graceful-disconnect notification when so
    /// configured, then closes the session.
    async fn disconnect(&self) -> Result<()>;

    /// Registers for the inbound topic families: global sync,
    /// device-specific sync, and commands.
    async fn subscribe(&self) -> Result<()>;

    /// Publishes an entity-version snapshot, paged by the configured
    /// maximum entities per message.
    async fn publish_versions(&self, versions: Versions) -> Result<()>;

    /// Publishes a batch of events, returning once the transport has
    /// accepted them per its QoS.
    async fn publish_events(&self, events: Vec<EventMessage>) -> Result<()>;

    /// Publishes a command response to the topic derived from the
    /// originating command's uuid, retrying with backoff up to the
    /// configured cap.
    async fn publish_command_response(&self, response: CommandResponse) -> Result<()>;
}
