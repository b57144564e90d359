//! Worker integration tests against a stubbed transport.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use trellis::config::{StoreConfig, SyncConfig};
use trellis::services::items;
use trellis::sync::State;
use trellis::{journal, Store, Worker};
use trellis_api::{
    actor, CommandKind, CommandResponse, EntityKind, Error, EventKind, EventMessage, Item,
    Result, ServerCommand, SyncAction, SyncEntry, TransportClient, TransportHandler, Versions,
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_millis(20);

#[derive(Default)]
struct StubState {
    connected: bool,
    subscribed: bool,
    refuse_connect: bool,
    versions: Vec<Versions>,
    events: Vec<EventMessage>,
    responses: Vec<CommandResponse>,
}

#[derive(Default)]
struct StubClient {
    state: Mutex<StubState>,
    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
}

impl StubClient {
    fn new() -> Arc<StubClient> {
        Arc::new(StubClient::default())
    }

    fn refusing() -> Arc<StubClient> {
        let client = StubClient::new();
        client.state.lock().unwrap().refuse_connect = true;
        client
    }

    fn handler(&self) -> Arc<dyn TransportHandler> {
        self.handler
            .lock()
            .unwrap()
            .clone()
            .expect("handler registered")
    }

    fn allow_connect(&self) {
        self.state.lock().unwrap().refuse_connect = false;
    }

    fn with_state<T>(&self, f: impl FnOnce(&StubState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }
}

#[async_trait]
impl TransportClient for StubClient {
    fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_connect {
            return Err(Error::NotConnected);
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            state.subscribed = false;
        }
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.on_disconnected(None).await;
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<()> {
        self.state.lock().unwrap().subscribed = true;
        Ok(())
    }

    async fn publish_versions(&self, versions: Versions) -> Result<()> {
        self.state.lock().unwrap().versions.push(versions);
        Ok(())
    }

    async fn publish_events(&self, events: Vec<EventMessage>) -> Result<()> {
        self.state.lock().unwrap().events.extend(events);
        Ok(())
    }

    async fn publish_command_response(&self, response: CommandResponse) -> Result<()> {
        self.state.lock().unwrap().responses.push(response);
        Ok(())
    }
}

fn memory_store() -> Store {
    Store::open(&StoreConfig {
        url: ":memory:".into(),
        ..Default::default()
    })
    .unwrap()
}

fn test_config(publish_versions: bool) -> SyncConfig {
    let mut config = SyncConfig {
        publish_versions_on_connect: publish_versions,
        min_sleep_time_ms: 5,
        stop_timeout_ms: 2_000,
        ..Default::default()
    };
    config.backoff.initial_interval_ms = 20;
    config.backoff.max_interval_ms = 500;
    config
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(TICK).await;
    }
    panic!("timed out waiting for {what}");
}

fn item(id: &str, name: &str) -> Item {
    Item {
        id: id.into(),
        name: name.into(),
        kind: "t".into(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_worker_reaches_draining_in_order() {
    let store = memory_store();
    let client = StubClient::new();
    let worker = Worker::new(store, client.clone(), test_config(true));

    worker.start();
    wait_until(|| worker.state() == State::Draining, "draining state").await;

    client.with_state(|s| {
        assert!(s.connected);
        assert!(s.subscribed);
        assert_eq!(s.versions.len(), 1);
    });

    worker.stop().await.unwrap();
    assert_eq!(worker.state(), State::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_versions_skipped_when_disabled() {
    let store = memory_store();
    let client = StubClient::new();
    let worker = Worker::new(store, client.clone(), test_config(false));

    worker.start();
    wait_until(|| worker.state() == State::Draining, "draining state").await;

    client.with_state(|s| assert!(s.versions.is_empty()));
    worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_inbound_sync_applies_and_drains() {
    let store = memory_store();
    let client = StubClient::new();
    let worker = Worker::new(store.clone(), client.clone(), test_config(false));

    worker.start();
    wait_until(|| worker.state() == State::Draining, "draining state").await;

    let message = vec![SyncEntry {
        entity_type: EntityKind::Item,
        entity_id: "I1".into(),
        version: String::new(),
        action: SyncAction::Create,
        payload: Some(
            json!({"id": "I1", "name": "node", "type": "sensor"})
                .as_object()
                .unwrap()
                .clone(),
        ),
    }];
    client.handler().on_sync(message).await;

    wait_until(|| client.with_state(|s| s.events.len() == 1), "published event").await;

    client.with_state(|s| {
        let event = &s.events[0];
        assert_eq!(event.tx_type, EventKind::Created);
        assert_eq!(event.entity_type, EntityKind::Item);
        assert_eq!(event.triggered_by, actor::SYNC);
        assert_eq!(event.entity_id, "I1");
        let body = event.body.as_ref().unwrap();
        assert_eq!(body["name"], "node");
        assert_eq!(body["type"], "sensor");
    });

    let created = items::get_by_id(&store, "I1").unwrap();
    assert_eq!(created.name, "node");
    assert_eq!(created.meta.modified_by, actor::SYNC);
    assert_eq!(journal::count(&store).unwrap(), 0);

    worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_commands() {
    let store = memory_store();
    let client = StubClient::new();
    let worker = Worker::new(store.clone(), client.clone(), test_config(false));

    worker.start();
    wait_until(|| worker.state() == State::Draining, "draining state").await;

    items::create(&store, &[item("I1", "one")], "TEST").unwrap();

    let mut command = ServerCommand {
        uuid: "cmd-1".into(),
        command_type: CommandKind::GetEntity,
        entity_type: Some(EntityKind::Item),
        entity_id: "I1".into(),
        body: None,
    };
    client.handler().on_command(command.clone()).await;

    wait_until(|| client.with_state(|s| s.responses.len() == 1), "command response").await;
    client.with_state(|s| {
        let response = &s.responses[0];
        assert!(response.success);
        assert_eq!(response.uuid, "cmd-1");
        assert!(response.error.is_none());
        let body = response.body.as_ref().unwrap();
        assert_eq!(body["id"], "I1");
        assert_eq!(body["name"], "one");
    });

    // Unknown commands come back as failures carrying the uuid
    command.uuid = "cmd-2".into();
    command.command_type = CommandKind::Unknown;
    client.handler().on_command(command.clone()).await;
    wait_until(|| client.with_state(|s| s.responses.len() == 2), "error response").await;
    client.with_state(|s| {
        let response = &s.responses[1];
        assert!(!response.success);
        assert!(response.error.is_some());
    });

    let expected_version = items::version_of(&store, "I1").unwrap();
    command.uuid = "cmd-3".into();
    command.command_type = CommandKind::GetVersion;
    client.handler().on_command(command.clone()).await;
    wait_until(|| client.with_state(|s| s.responses.len() == 3), "version response").await;
    client.with_state(|s| {
        let response = &s.responses[2];
        assert!(response.success);
        assert_eq!(
            response.body.as_ref().unwrap()["version"],
            json!(expected_version)
        );
    });

    // GET_ALL_VERSIONS republishes the snapshot
    command.uuid = "cmd-4".into();
    command.command_type = CommandKind::GetAllVersions;
    client.handler().on_command(command).await;
    wait_until(|| client.with_state(|s| s.responses.len() == 4), "versions response").await;
    client.with_state(|s| {
        assert!(s.responses[3].success);
        assert_eq!(s.versions.len(), 1);
        assert_eq!(s.versions[0].versions[&EntityKind::Item].len(), 1);
    });

    worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_disconnect_returns_to_connecting() {
    let store = memory_store();
    let client = StubClient::new();
    let worker = Worker::new(store, client.clone(), test_config(false));

    worker.start();
    wait_until(|| worker.state() == State::Draining, "draining state").await;

    // Keep reconnect attempts failing so the state is observable
    client.state.lock().unwrap().refuse_connect = true;
    client
        .handler()
        .on_disconnected(Some(Error::Transport("link lost".into())))
        .await;

    wait_until(|| worker.state() == State::Connecting, "connecting state").await;

    // The link comes back and the worker walks the phases again
    client.allow_connect();
    wait_until(|| worker.state() == State::Draining, "draining after reconnect").await;

    worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_reconnect_drains_queued_events_in_order() {
    let store = memory_store();
    let client = StubClient::refusing();
    let worker = Worker::new(store.clone(), client.clone(), test_config(false));

    worker.start();

    // Local mutations while the link is down pile up in the journal
    for (id, name) in [("I1", "one"), ("I2", "two"), ("I3", "three")] {
        items::create(&store, &[item(id, name)], "TEST").unwrap();
    }
    assert_eq!(journal::count(&store).unwrap(), 3);
    assert_eq!(worker.state(), State::Connecting);

    client.allow_connect();
    wait_until(|| client.with_state(|s| s.events.len() == 3), "drained events").await;

    client.with_state(|s| {
        let ids: Vec<&str> = s.events.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["I1", "I2", "I3"]);
    });
    assert_eq!(journal::count(&store).unwrap(), 0);

    worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_ping_answered_between_ticks() {
    let store = memory_store();
    let client = StubClient::new();
    let worker = Worker::new(store, client, test_config(false));

    worker.start();
    wait_until(|| worker.state() == State::Draining, "draining state").await;

    trellis::ping::ping(Duration::from_secs(5)).await.unwrap();

    worker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_sync_listener_and_counters() {
    let store = memory_store();
    let client = StubClient::new();
    let worker = Worker::new(store, client.clone(), test_config(false));

    let seen = Arc::new(Mutex::new(0usize));
    let seen_clone = seen.clone();
    worker.add_sync_listener(Box::new(move |message| {
        *seen_clone.lock().unwrap() += message.len();
    }));

    worker.start();
    wait_until(|| worker.state() == State::Draining, "draining state").await;

    let message = vec![SyncEntry {
        entity_type: EntityKind::Item,
        entity_id: "I1".into(),
        version: "v1".into(),
        action: SyncAction::Create,
        payload: Some(
            json!({"id": "I1", "name": "n", "type": "t"})
                .as_object()
                .unwrap()
                .clone(),
        ),
    }];
    client.handler().on_sync(message).await;

    wait_until(|| *seen.lock().unwrap() == 1, "listener notified").await;
    let counters = worker.counters();
    assert_eq!(counters.messages_received, 1);
    assert_eq!(counters.panics, 0);
    assert!(counters.cycles > 0);

    worker.stop().await.unwrap();
}
