//! Local HTTP API adapter.
//!
//! Exposes the entity services to in-process and loopback consumers.
//! Mutations are tagged with the `HTTP_API` actor and flow through the
//! same transactional service layer as everything else, so every write
//! journals its event. Error taxonomy maps onto HTTP statuses:
//! not-found is 404, bad input is 400, the rest is 500; bodies carry a
//! single `error` field with the message chain.

mod routes;

use tokio::net::TcpListener;
use tracing::info;

use trellis::config::HttpConfig;
use trellis::Store;
use trellis_api::{Error, Result};

pub use routes::router;

/// Binds and serves the API until the process stops.
pub async fn serve(config: &HttpConfig, store: Store) -> Result<()> {
    if !config.enabled {
        return Err(Error::ServerDisabled);
    }

    let address = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&address).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            Error::NameAlreadyTaken(address.clone())
        } else {
            Error::Transport(format!("failed to bind '{address}': {e}"))
        }
    })?;

    info!(%address, "http api listening");

    axum::serve(listener, router(store))
        .await
        .map_err(|e| Error::Transport(format!("http server failed: {e}")))
}
