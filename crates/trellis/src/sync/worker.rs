//! The sync worker.
//!
//! One task owns the state-machine loop; the transport delivers
//! inbound messages from its own tasks into the handler callbacks.
//! The FSM mutex is the serialization point between the two sides.
//!
//! The loop is driven by a ticker: on success the backoff resets and
//! the ticker drops to the minimum sleep; on error the backoff grows
//! (randomized, capped); an empty queue during draining resets the
//! ticker to the initial interval without growing the backoff. The
//! inbound handler nudges the loop after a handled sync batch, but the
//! nudge is throttled so bursts of inbound traffic don't keep the
//! store locked by back-to-back drains.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use trellis_api::{
    CommandResponse, EntityKind, Error, Event, EventMessage, Result, ServerCommand, SyncMessage,
    TransportClient, TransportHandler, Versions,
};

use crate::config::SyncConfig;
use crate::journal;
use crate::ping;
use crate::services::{attributes, items, relations};
use crate::store::Store;
use crate::sync::commands::{self, CommandOutcome};
use crate::sync::fsm::{Fsm, FsmEvent, State};
use crate::sync::apply;
use crate::telemetry;
use crate::time;

/// Callback invoked after every successfully applied sync batch.
pub type SyncListener = Box<dyn Fn(&SyncMessage) + Send + Sync>;

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    errors: AtomicU64,
    messages_received: AtomicU64,
    panics: AtomicU64,
    published_events: AtomicU64,
}

/// Point-in-time view of the worker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub cycles: u64,
    pub errors: u64,
    pub messages_received: u64,
    pub panics: u64,
    pub published_events: u64,
}

pub struct Worker {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    store: Store,
    client: Arc<dyn TransportClient>,
    fsm: Mutex<Fsm>,
    nudge: Notify,
    stopped: Notify,
    last_sync: Mutex<Option<Instant>>,
    listeners: RwLock<Vec<SyncListener>>,
    counters: Counters,
}

impl Worker {
    pub fn new(store: Store, client: Arc<dyn TransportClient>, config: SyncConfig) -> Worker {
        Worker {
            inner: Arc::new(Inner {
                config,
                store,
                client,
                fsm: Mutex::new(Fsm::new()),
                nudge: Notify::new(),
                stopped: Notify::new(),
                last_sync: Mutex::new(None),
                listeners: RwLock::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Registers the transport callbacks and spawns the supervised
    /// loop task.
    pub fn start(&self) {
        self.inner.client.set_handler(Arc::new(Handler {
            inner: self.inner.clone(),
        }));
        tokio::spawn(supervise(self.inner.clone()));
        info!("sync worker started");
    }

    /// Cooperative stop: fires the terminal FSM event, disconnects the
    /// transport, and waits (bounded) for the loop to finish. A timed
    /// out wait is logged, not fatal.
    pub async fn stop(&self) -> Result<()> {
        self.inner.fire(FsmEvent::Stop);
        self.inner.client.disconnect().await?;

        match tokio::time::timeout(
            self.inner.config.stop_timeout(),
            self.inner.stopped.notified(),
        )
        .await
        {
            Ok(()) => info!("sync worker stopped"),
            Err(_) => warn!("sync worker stop timed out"),
        }
        Ok(())
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.inner.counters;
        CounterSnapshot {
            cycles: c.cycles.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            panics: c.panics.load(Ordering::Relaxed),
            published_events: c.published_events.load(Ordering::Relaxed),
        }
    }

    /// Registers a callback fired after every successfully applied
    /// sync batch.
    pub fn add_sync_listener(&self, listener: SyncListener) {
        self.inner.listeners.write().unwrap().push(listener);
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }
}

struct Handler {
    inner: Arc<Inner>,
}

#[async_trait]
impl TransportHandler for Handler {
    async fn on_connected(&self) {
        self.inner.handle_connected();
    }

    async fn on_disconnected(&self, error: Option<Error>) {
        self.inner.handle_disconnected(error);
    }

    async fn on_sync(&self, message: SyncMessage) {
        self.inner.handle_sync(message).await;
    }

    async fn on_command(&self, command: ServerCommand) {
        self.inner.handle_command(command).await;
    }
}

/// Restarts the loop task if it panics; signals completion when it
/// exits cleanly.
async fn supervise(inner: Arc<Inner>) {
    loop {
        let handle = tokio::spawn(run_loop(inner.clone()));
        match handle.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                inner.record_panic("worker loop");
            }
            Err(_) => break,
        }
    }
    inner.stopped.notify_one();
}

async fn run_loop(inner: Arc<Inner>) {
    let mut backoff = inner.config.backoff.build();
    backoff.reset();
    let mut interval = inner.config.backoff.initial_interval();

    if !inner.do_work(&mut backoff, &mut interval).await {
        return;
    }

    // Claim the process-wide ping channel; a second concurrent worker
    // simply doesn't service pings
    let mut ping_rx = ping::receiver().try_lock().ok();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if !inner.do_work(&mut backoff, &mut interval).await {
                    return;
                }
            }
            _ = inner.nudge.notified() => {
                if !inner.do_work(&mut backoff, &mut interval).await {
                    return;
                }
            }
            request = recv_ping(&mut ping_rx) => {
                if let Some(reply) = request {
                    let _ = reply.send(ping::PONG);
                }
            }
        }
        inner.counters.cycles.fetch_add(1, Ordering::Relaxed);
    }
}

async fn recv_ping(
    rx: &mut Option<tokio::sync::MutexGuard<'static, tokio::sync::mpsc::Receiver<ping::PingRequest>>>,
) -> Option<ping::PingRequest> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Inner {
    fn state(&self) -> State {
        self.fsm.lock().unwrap().state()
    }

    fn fire(&self, event: FsmEvent) {
        let mut fsm = self.fsm.lock().unwrap();
        self.fire_locked(&mut fsm, event);
    }

    fn fire_locked(&self, fsm: &mut Fsm, event: FsmEvent) {
        match fsm.apply(event) {
            Some(next) => trace!(%event, state = %next, "sync worker transition"),
            None => debug!(%event, state = %fsm.state(), "dropping forbidden sync worker transition"),
        }
        self.nudge.notify_one();
    }

    /// One scheduling cycle. Returns false once the FSM is stopped.
    async fn do_work(&self, backoff: &mut ExponentialBackoff, interval: &mut Duration) -> bool {
        let state = self.state();
        trace!(%state, "sync worker state");

        if state == State::Stopped {
            info!("sync worker routine stopped");
            return false;
        }

        let result: Result<()> = match state {
            State::Connecting => {
                debug!("sync worker connecting...");
                match self.client.connect().await {
                    Ok(()) => {
                        self.handle_connected();
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            State::Subscribing => {
                debug!("sync worker subscribing...");
                match self.client.subscribe().await {
                    Ok(()) => {
                        info!("sync worker subscribed");
                        self.fire(FsmEvent::Subscribed);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            State::PublishingVersions => {
                if self.config.publish_versions_on_connect {
                    match self.publish_versions().await {
                        Ok(()) => {
                            info!("sync worker published versions");
                            self.fire(FsmEvent::VersionsPublished);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    // Nothing to publish; the phase completes at once
                    self.fire(FsmEvent::VersionsPublished);
                    Ok(())
                }
            }
            State::Draining => self.drain_events(),
            State::Stopped => unreachable!("handled above"),
        };

        match result {
            Ok(()) => {
                backoff.reset();
                *interval = self.config.min_sleep_time();
                trace!("sync worker cycle ok");
            }
            Err(e) if e.is_not_found() => {
                // Empty queue: idle at the initial interval, backoff
                // untouched
                *interval = self.config.backoff.initial_interval();
            }
            Err(e) => {
                if e.is_not_connected() {
                    error!("sync worker not connected");
                } else {
                    error!(error = %e, "sync worker error");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                }
                *interval = backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.config.backoff.max_interval());
            }
        }

        true
    }

    fn handle_connected(&self) {
        // Hold the FSM lock across the check and the event so a
        // concurrent callback cannot interleave
        let mut fsm = self.fsm.lock().unwrap();
        if fsm.state() == State::Connecting {
            info!("sync worker connected");
            self.fire_locked(&mut fsm, FsmEvent::Connected);
        } else {
            debug!(state = %fsm.state(), "connected callback while not connecting");
        }
    }

    fn handle_disconnected(&self, error: Option<Error>) {
        let mut fsm = self.fsm.lock().unwrap();
        if fsm.state() != State::Connecting {
            if let Some(e) = error {
                error!(error = %e, "sync worker disconnected");
            }
            self.fire_locked(&mut fsm, FsmEvent::Disconnected);
        } else {
            debug!(state = %fsm.state(), "disconnected callback while connecting");
        }
    }

    async fn handle_sync(&self, message: SyncMessage) {
        telemetry::set_last_message_received_ts();

        let result = catch_unwind(AssertUnwindSafe(|| apply::apply(&self.store, &message)));
        match result {
            Err(_) => self.record_panic("sync handler"),
            Ok(Err(e)) => error!(error = %e, "failed to handle sync message"),
            Ok(Ok(())) => {
                debug!("sync message handled");
                telemetry::set_last_sync_ts();
                self.throttled_nudge();
                self.notify_listeners(&message);
            }
        }

        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Nudges the drain loop, unless a sync batch was handled within
    /// the last initial-backoff interval. Inbound bursts would
    /// otherwise drive drains in lockstep and keep the store busy.
    fn throttled_nudge(&self) {
        let mut last = self.last_sync.lock().unwrap();
        if last.map_or(true, |t| t.elapsed() >= self.config.backoff.initial_interval()) {
            debug!("sync handled, signaling drain");
            self.nudge.notify_one();
        }
        *last = Some(Instant::now());
    }

    fn notify_listeners(&self, message: &SyncMessage) {
        for listener in self.listeners.read().unwrap().iter() {
            listener(message);
        }
    }

    async fn handle_command(&self, command: ServerCommand) {
        telemetry::set_last_message_received_ts();
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        debug!(uuid = %command.uuid, kind = ?command.command_type, "received server command");

        let outcome = catch_unwind(AssertUnwindSafe(|| commands::run(&self.store, &command)));
        let response = match outcome {
            Err(_) => {
                self.record_panic("command handler");
                CommandResponse::err(&command.uuid, "command handler panicked")
            }
            Ok(Err(e)) => CommandResponse::err(&command.uuid, &e),
            Ok(Ok(CommandOutcome::Body(body))) => CommandResponse::ok(&command.uuid, body),
            Ok(Ok(CommandOutcome::PublishVersions)) => match self.publish_versions().await {
                Ok(()) => CommandResponse::ok(&command.uuid, None),
                Err(e) => CommandResponse::err(&command.uuid, &e),
            },
        };

        if let Err(e) = self.client.publish_command_response(response).await {
            error!(error = %e, "failed to publish command response");
        }
    }

    async fn publish_versions(&self) -> Result<()> {
        debug!("sync worker publishing versions...");
        let snapshot = self.versions_snapshot()?;
        self.client.publish_versions(snapshot).await
    }

    fn versions_snapshot(&self) -> Result<Versions> {
        let mut versions = BTreeMap::new();
        versions.insert(EntityKind::Item, items::all_versions(&self.store)?);
        versions.insert(EntityKind::Attribute, attributes::all_versions(&self.store)?);
        versions.insert(EntityKind::Relation, relations::all_versions(&self.store)?);
        Ok(Versions {
            timestamp: time::timestamp_ms(),
            versions,
        })
    }

    /// Drains journalled events: delivery and row removal share one
    /// store transaction, so a failed publish leaves the queue
    /// untouched. The transport call is async while the transaction is
    /// synchronous, hence the block-in-place bridge at this single
    /// call site.
    fn drain_events(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::current();
        let client = self.client.clone();
        let max_events = self.config.max_events_per_drain;

        let count = tokio::task::block_in_place(|| {
            self.store.with_tx(|ctx| {
                journal::drain(ctx, max_events, |events| {
                    let messages = events
                        .iter()
                        .map(event_message)
                        .collect::<Result<Vec<_>>>()?;
                    handle.block_on(client.publish_events(messages))
                })
            })
        })?;

        debug!(count, "events dequeued");
        self.counters
            .published_events
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }

    fn record_panic(&self, context: &'static str) {
        error!(context, "sync worker recovered from panic");
        self.counters.panics.fetch_add(1, Ordering::Relaxed);
    }
}

fn event_message(event: &Event) -> Result<EventMessage> {
    let body = if event.body.is_empty() {
        None
    } else {
        Some(event.body_object()?)
    };
    Ok(EventMessage {
        id: event.id,
        entity_type: event.entity_type,
        entity_id: event.entity_id.clone(),
        triggered_by: event.triggered_by.clone(),
        tx_uuid: event.tx_uuid.clone(),
        tx_type: event.event_type,
        tx_len: event.tx_len,
        tx_index: event.tx_index,
        timestamp: event.timestamp,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_message_round_trip() {
        let event = Event {
            id: 7,
            event_type: trellis_api::EventKind::Created,
            entity_type: EntityKind::Item,
            entity_id: "I1".into(),
            triggered_by: "TEST".into(),
            tx_uuid: Some("u".into()),
            tx_len: 3,
            tx_index: 1,
            timestamp: 42,
            body: r#"{"id":"I1","name":"n"}"#.into(),
        };
        let message = event_message(&event).unwrap();
        assert_eq!(message.id, 7);
        assert_eq!(message.tx_type, trellis_api::EventKind::Created);
        assert_eq!(message.body.unwrap()["name"], "n");
    }

    #[test]
    fn test_event_message_empty_body() {
        let event = Event {
            id: 1,
            event_type: trellis_api::EventKind::Deleted,
            entity_type: EntityKind::Relation,
            entity_id: "P->C".into(),
            triggered_by: "TEST".into(),
            tx_uuid: None,
            tx_len: 0,
            tx_index: 0,
            timestamp: 1,
            body: String::new(),
        };
        assert!(event_message(&event).unwrap().body.is_none());
    }
}
