//! The worker ping channel.
//!
//! A process-wide request/reply pair: callers post a reply slot, the
//! worker loop answers `pong` between ticks. The health check uses
//! this to assert the loop is alive and scheduling.

use once_cell::sync::Lazy;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use trellis_api::{Error, Result};

pub(crate) type PingRequest = oneshot::Sender<&'static str>;

pub(crate) const PONG: &str = "pong";

struct PingChannel {
    tx: mpsc::Sender<PingRequest>,
    rx: Mutex<mpsc::Receiver<PingRequest>>,
}

static CHANNEL: Lazy<PingChannel> = Lazy::new(|| {
    let (tx, rx) = mpsc::channel(1);
    PingChannel {
        tx,
        rx: Mutex::new(rx),
    }
});

/// The receiving side, claimed by the worker loop for its lifetime.
pub(crate) fn receiver() -> &'static Mutex<mpsc::Receiver<PingRequest>> {
    &CHANNEL.rx
}

/// Pings the worker. Both the request post and the reply wait are
/// bounded by `timeout`.
pub async fn ping(timeout: Duration) -> Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();

    tokio::time::timeout(timeout, CHANNEL.tx.send(reply_tx))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|_| Error::Transport("ping channel closed".into()))?;

    match tokio::time::timeout(timeout, reply_rx).await {
        Ok(Ok(reply)) if reply == PONG => {
            tracing::trace!("sync worker ping success");
            Ok(())
        }
        Ok(Ok(other)) => Err(Error::Transport(format!("invalid ping reply '{other}'"))),
        Ok(Err(_)) => Err(Error::Transport("ping reply dropped".into())),
        Err(_) => Err(Error::Timeout),
    }
}
