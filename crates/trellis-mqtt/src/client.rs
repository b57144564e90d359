use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use backoff::backoff::Backoff;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, LastWill, MqttOptions, Packet, Publish, QoS,
    SubscribeFilter, TlsConfiguration, Transport,
};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use trellis::codec::Codec;
use trellis::config::{MqttConfig, SyncConfig};
use trellis::env::Environment;
use trellis::time;
use trellis_api::{
    CommandResponse, Connected, Disconnected, Error, EventMessage, Result, ServerCommand,
    SyncMessage, TransportClient, TransportHandler, Versions,
};

/// Supplies the telemetry snapshot attached to connect notifications.
pub type TelemetrySource = Arc<dyn Fn() -> Option<serde_json::Value> + Send + Sync>;

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Inbound routing state shared with the event-loop task.
struct Shared {
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,
    codec: Codec,
    sync_global_topic: String,
    sync_device_topic: String,
    commands_topic: String,
    order_matters: bool,
    /// Set during a locally requested disconnect so the connection
    /// teardown isn't reported as a failure.
    closing: AtomicBool,
}

impl Shared {
    fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler.read().unwrap().clone()
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport").finish_non_exhaustive()
    }
}

pub struct MqttTransport {
    conf: MqttConfig,
    sync_conf: SyncConfig,
    device_id: String,
    connected_topic: String,
    disconnected_topic: String,
    events_topic: String,
    command_response_template: String,
    env: Arc<Environment>,
    shared: Arc<Shared>,
    client: RwLock<Option<AsyncClient>>,
    telemetry_source: RwLock<Option<TelemetrySource>>,
}

impl MqttTransport {
    /// Builds the transport, expanding every fixed topic template
    /// against the environment. The command-response topic keeps its
    /// `{uuid}` placeholder, bound per response.
    pub fn new(
        conf: MqttConfig,
        sync_conf: SyncConfig,
        parent_env: Arc<Environment>,
    ) -> Result<MqttTransport> {
        if conf.storage_type != "memory" {
            return Err(Error::Config(format!(
                "unsupported MQTT storage type '{}': this client keeps unsent packets in memory",
                conf.storage_type
            )));
        }

        let env = Arc::new(Environment::new(Some(parent_env)));
        env.set("username", conf.username.clone());

        let device_id = env
            .get("deviceId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Config("deviceId is not set in the environment".into()))?;

        let shared = Arc::new(Shared {
            handler: RwLock::new(None),
            codec: Codec::new(conf.codec),
            sync_global_topic: env.expand(&conf.topics.sync_global)?,
            sync_device_topic: env.expand(&conf.topics.sync_device)?,
            commands_topic: env.expand(&conf.topics.commands)?,
            order_matters: conf.order_matters,
            closing: AtomicBool::new(false),
        });

        Ok(MqttTransport {
            connected_topic: env.expand(&conf.topics.connected)?,
            disconnected_topic: env.expand(&conf.topics.disconnected)?,
            events_topic: env.expand(&conf.topics.events)?,
            command_response_template: conf.topics.command_response.clone(),
            device_id,
            env,
            shared,
            client: RwLock::new(None),
            telemetry_source: RwLock::new(None),
            conf,
            sync_conf,
        })
    }

    /// Attaches a telemetry provider queried for connect
    /// notifications.
    pub fn set_telemetry_source(&self, source: TelemetrySource) {
        *self.telemetry_source.write().unwrap() = Some(source);
    }

    fn mqtt_options(&self) -> Result<MqttOptions> {
        let conf = &self.conf;

        let mut client_id = conf.client_id.clone();
        if conf.randomize_client_id {
            client_id = format!("{client_id}-{}", Uuid::new_v4());
        }

        let mut options = MqttOptions::new(client_id, conf.host.clone(), conf.port);
        options.set_keep_alive(conf.keep_alive());
        options.set_clean_session(conf.clean_session);

        if !conf.username.is_empty() {
            options.set_credentials(conf.username.clone(), conf.password.clone());
        }

        if conf.tls.enabled || conf.scheme == "ssl" {
            options.set_transport(Transport::tls_with_config(self.tls_config()?));
        }

        if conf.last_will_enabled {
            let will = Disconnected {
                device_id: self.device_id.clone(),
                timestamp: None,
            };
            let payload = self.shared.codec.serialize(&will)?;
            options.set_last_will(LastWill::new(
                self.disconnected_topic.clone(),
                payload,
                qos_from(conf.pub_qos)?,
                conf.pub_retained,
            ));
        }

        Ok(options)
    }

    fn tls_config(&self) -> Result<TlsConfiguration> {
        let ca_file = self.conf.tls.ca_file.as_ref().ok_or_else(|| {
            Error::Config("TLS is enabled but no CA file is configured".into())
        })?;
        let ca = std::fs::read(ca_file)
            .map_err(|e| Error::Config(format!("failed to read CA file '{ca_file}': {e}")))?;
        if self.conf.tls.cert_file.is_some() || self.conf.tls.key_file.is_some() {
            warn!("client certificate authentication is not supported, ignoring cert/key files");
        }
        Ok(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        })
    }

    fn current_client(&self) -> Result<AsyncClient> {
        self.client
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::NotConnected)
    }

    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client = self.current_client()?;
        let publish = client.publish(topic, qos_from(self.conf.pub_qos)?, self.conf.pub_retained, payload);
        match tokio::time::timeout(self.conf.comms_timeout(), publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    fn telemetry(&self) -> Option<serde_json::Value> {
        if !self.sync_conf.telemetry_enabled {
            return None;
        }
        self.telemetry_source
            .read()
            .unwrap()
            .as_ref()
            .and_then(|source| source())
    }
}

#[async_trait]
impl TransportClient for MqttTransport {
    fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.shared.handler.write().unwrap() = Some(handler);
    }

    async fn connect(&self) -> Result<()> {
        let options = self.mqtt_options()?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        self.shared.closing.store(false, Ordering::SeqCst);
        let (connack_tx, connack_rx) = oneshot::channel();
        tokio::spawn(run_event_loop(event_loop, self.shared.clone(), connack_tx));

        *self.client.write().unwrap() = Some(client);

        match tokio::time::timeout(self.conf.comms_timeout(), connack_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                *self.client.write().unwrap() = None;
                return Err(Error::NotConnected.context("session closed before acknowledgment"));
            }
            Err(_) => {
                *self.client.write().unwrap() = None;
                return Err(Error::Timeout);
            }
        }

        let message = Connected {
            device_id: self.device_id.clone(),
            timestamp: Some(time::timestamp_ms()),
            telemetry: self.telemetry(),
        };
        let payload = self.shared.codec.serialize(&message)?;
        self.publish_raw(&self.connected_topic, payload).await?;

        info!(topic = %self.connected_topic, "mqtt session established");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let client = { self.client.write().unwrap().take() };
        let Some(client) = client else {
            return Ok(());
        };

        if self.sync_conf.notify_graceful_disconnect {
            let message = Disconnected {
                device_id: self.device_id.clone(),
                timestamp: Some(time::timestamp_ms()),
            };
            let payload = self.shared.codec.serialize(&message)?;
            let publish = client.publish(
                &self.disconnected_topic,
                qos_from(self.conf.pub_qos)?,
                self.conf.pub_retained,
                payload,
            );
            if let Ok(Err(_)) | Err(_) =
                tokio::time::timeout(self.conf.comms_timeout(), publish).await
            {
                warn!("failed to publish graceful disconnect notification");
            }
        }

        self.shared.closing.store(true, Ordering::SeqCst);
        let _ = client.disconnect().await;
        debug!("mqtt session closed");
        Ok(())
    }

    async fn subscribe(&self) -> Result<()> {
        let client = self.current_client()?;
        let qos = qos_from(self.conf.sub_qos)?;
        let filters = vec![
            SubscribeFilter::new(self.shared.sync_global_topic.clone(), qos),
            SubscribeFilter::new(self.shared.sync_device_topic.clone(), qos),
            SubscribeFilter::new(self.shared.commands_topic.clone(), qos),
        ];

        match tokio::time::timeout(self.conf.comms_timeout(), client.subscribe_many(filters)).await
        {
            Ok(Ok(())) => {
                debug!(
                    global = %self.shared.sync_global_topic,
                    device = %self.shared.sync_device_topic,
                    commands = %self.shared.commands_topic,
                    "subscribed to inbound topics"
                );
                Ok(())
            }
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn publish_versions(&self, versions: Versions) -> Result<()> {
        // One page per entity kind chunk, bounded by the configured
        // message size
        let page_size = self.conf.max_entities_per_message.max(1);
        for (kind, entries) in &versions.versions {
            if entries.is_empty() {
                continue;
            }
            for chunk in entries.chunks(page_size) {
                let mut page = std::collections::BTreeMap::new();
                page.insert(*kind, chunk.to_vec());
                let message = Versions {
                    timestamp: versions.timestamp,
                    versions: page,
                };
                let payload = self.shared.codec.serialize(&message)?;
                self.publish_raw(&self.events_topic, payload).await?;
            }
        }
        Ok(())
    }

    async fn publish_events(&self, events: Vec<EventMessage>) -> Result<()> {
        let page_size = self.conf.max_entities_per_message.max(1);
        for chunk in events.chunks(page_size) {
            let payload = self.shared.codec.serialize(&chunk.to_vec())?;
            self.publish_raw(&self.events_topic, payload).await?;
        }
        Ok(())
    }

    async fn publish_command_response(&self, response: CommandResponse) -> Result<()> {
        let topic_env = Environment::new(Some(self.env.clone()));
        topic_env.set("uuid", response.uuid.clone());
        let topic = topic_env.expand(&self.command_response_template)?;

        let payload = self.shared.codec.serialize(&response)?;

        let mut backoff = self.sync_conf.backoff.build();
        let max_interval = self.sync_conf.backoff.max_interval();
        let mut attempts: u32 = 0;

        loop {
            match self.publish_raw(&topic, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if self.conf.max_retries > 0 && attempts >= self.conf.max_retries {
                        return Err(e.context("command response publish retries exhausted"));
                    }
                    let interval = backoff.next_backoff().unwrap_or(max_interval);
                    if self.conf.max_retries == 0 && interval >= max_interval {
                        return Err(e.context("command response publish backoff exhausted"));
                    }
                    warn!(error = %e, attempts, "retrying command response publish");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    shared: Arc<Shared>,
    connack: oneshot::Sender<()>,
) {
    let mut connack = Some(connack);
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!("mqtt connection acknowledged");
                if let Some(tx) = connack.take() {
                    let _ = tx.send(());
                }
                if let Some(handler) = shared.handler() {
                    handler.on_connected().await;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                route(&shared, publish).await;
            }
            Ok(event) => trace!(?event, "mqtt event"),
            Err(e) => {
                let closing = shared.closing.load(Ordering::SeqCst);
                if let Some(handler) = shared.handler() {
                    let error = if closing { None } else { Some(classify(e)) };
                    handler.on_disconnected(error).await;
                }
                // The worker owns reconnection; this session is done
                break;
            }
        }
    }
}

async fn route(shared: &Arc<Shared>, publish: Publish) {
    let Some(handler) = shared.handler() else {
        return;
    };
    let topic = publish.topic.as_str();

    if topic == shared.sync_global_topic || topic == shared.sync_device_topic {
        match shared.codec.deserialize::<SyncMessage>(&publish.payload) {
            Ok(message) => dispatch_sync(shared, handler, message).await,
            Err(e) => warn!(%topic, error = %e, "dropping undecodable sync message"),
        }
    } else if topic == shared.commands_topic {
        match shared.codec.deserialize::<ServerCommand>(&publish.payload) {
            Ok(command) => dispatch_command(shared, handler, command).await,
            Err(e) => warn!(%topic, error = %e, "dropping undecodable command message"),
        }
    } else {
        trace!(%topic, "message on unrouted topic");
    }
}

async fn dispatch_sync(shared: &Arc<Shared>, handler: Arc<dyn TransportHandler>, message: SyncMessage) {
    if shared.order_matters {
        handler.on_sync(message).await;
    } else {
        tokio::spawn(async move { handler.on_sync(message).await });
    }
}

async fn dispatch_command(
    shared: &Arc<Shared>,
    handler: Arc<dyn TransportHandler>,
    command: ServerCommand,
) {
    if shared.order_matters {
        handler.on_command(command).await;
    } else {
        tokio::spawn(async move { handler.on_command(command).await });
    }
}

fn qos_from(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::Config(format!("invalid MQTT QoS level {other}"))),
    }
}

fn classify(error: ConnectionError) -> Error {
    match &error {
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Error::Timeout,
        _ => Error::Transport(error.to_string()),
    }
}
