//! Agent configuration.
//!
//! Every option has a default; the daemon overlays a TOML file on top
//! of `Config::default()`. Unknown keys are rejected so a typo in a
//! deployment file fails loudly instead of silently reverting to a
//! default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use backoff::ExponentialBackoff;

use crate::codec::CodecKind;
use crate::store::version::VersionAlgorithm;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub mqtt: MqttConfig,
    pub sync: SyncConfig,
    pub http: HttpConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log filter, `tracing_subscriber::EnvFilter` syntax.
    pub level: String,
    /// `pretty` or `json`.
    pub format: LogFormat,
    /// Log to this file instead of stderr when set.
    pub file: Option<String>,
    /// Redact password-like values when echoing configuration.
    pub redact_passwords: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            format: LogFormat::Pretty,
            file: None,
            redact_passwords: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Path of the SQLite database, or `:memory:`.
    pub url: String,
    /// Transactions slower than this are logged at warning level.
    pub slow_query_threshold_ms: u64,
    /// Algorithm for content-addressed row versions.
    pub version_algorithm: VersionAlgorithm,
    /// Run migrations on every open instead of only when tables are
    /// missing.
    pub always_migrate: bool,
    /// Default page size for paged queries called with `page_size: 0`.
    pub page_size: i64,
    /// Soft delete rows (set `deleted_at`) instead of erasing them.
    pub soft_delete: bool,
    /// Stamp rows with localtime instead of UTC.
    pub localtime_timestamps: bool,
    /// Batch inserts are split into chunks of this size.
    pub create_batch_size: usize,
    /// SQLite write-ahead logging.
    pub wal_enabled: bool,
    /// Keep the SQLite temporary store in memory.
    pub mem_temp_store: bool,
    /// SQLite page cache size in bytes. 0 keeps the engine default.
    pub cache_size_bytes: u64,
    /// Force `synchronous = FULL`; otherwise NORMAL is set when WAL is
    /// enabled.
    pub synchronous_full: bool,
    /// SQLite busy timeout. 0 keeps the engine default.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            url: "trellis.db".into(),
            slow_query_threshold_ms: 5_000,
            version_algorithm: VersionAlgorithm::Sha1,
            always_migrate: false,
            page_size: 20,
            soft_delete: false,
            localtime_timestamps: false,
            create_batch_size: 100,
            wal_enabled: false,
            mem_temp_store: false,
            cache_size_bytes: 0,
            synchronous_full: false,
            busy_timeout_ms: 0,
        }
    }
}

impl StoreConfig {
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    /// `tcp` or `ssl`.
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Append a random UUID to the client id. Defeats persistent
    /// sessions, since the broker sees a new client on every start.
    pub randomize_client_id: bool,
    pub username: String,
    pub password: String,
    pub tls: TlsConfig,
    /// Quality of service for subscriptions.
    pub sub_qos: u8,
    /// Quality of service for publishes.
    pub pub_qos: u8,
    /// Drop the broker-side session on every connect. Set to false for
    /// a persistent session that buffers missed QoS >= 1 messages.
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    /// Bound on every network wait.
    pub comms_timeout_ms: u64,
    /// Register the disconnected notification as the session's last
    /// will.
    pub last_will_enabled: bool,
    /// Wire codec for all messages.
    pub codec: CodecKind,
    /// Maximum attempts for retried publishes (command responses).
    /// 0 retries until the backoff interval reaches its cap.
    pub max_retries: u32,
    /// Publish all messages as retained.
    pub pub_retained: bool,
    /// Entity payloads per message; larger snapshots and batches are
    /// split.
    pub max_entities_per_message: usize,
    /// Handle inbound messages strictly in arrival order instead of
    /// concurrently.
    pub order_matters: bool,
    /// Backend for unsent protocol packets. Only `memory` is
    /// supported by this client.
    pub storage_type: String,
    pub storage_path: String,
    pub topics: TopicsConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            scheme: "tcp".into(),
            host: "localhost".into(),
            port: 1883,
            client_id: "trellis".into(),
            randomize_client_id: false,
            username: String::new(),
            password: String::new(),
            tls: TlsConfig::default(),
            sub_qos: 1,
            pub_qos: 1,
            clean_session: true,
            keep_alive_secs: 60,
            comms_timeout_ms: 30_000,
            last_will_enabled: true,
            codec: CodecKind::Json,
            max_retries: 0,
            pub_retained: false,
            max_entities_per_message: 50,
            order_matters: false,
            storage_type: "memory".into(),
            storage_path: "./mqtt-messages".into(),
            topics: TopicsConfig::default(),
        }
    }
}

impl MqttConfig {
    pub fn comms_timeout(&self) -> Duration {
        Duration::from_millis(self.comms_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

/// Topic templates, expanded against the variable environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopicsConfig {
    pub connected: String,
    pub disconnected: String,
    pub events: String,
    pub sync_global: String,
    pub sync_device: String,
    pub commands: String,
    pub command_response: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        TopicsConfig {
            connected: "/trellis/device/{deviceId}/connected".into(),
            disconnected: "/trellis/device/{deviceId}/disconnected".into(),
            events: "/trellis/device/{deviceId}/events".into(),
            sync_global: "/trellis/sync".into(),
            sync_device: "/trellis/device/{deviceId}/sync".into(),
            commands: "/trellis/device/{deviceId}/commands".into(),
            command_response: "/trellis/device/{deviceId}/commands/{uuid}/response".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Kind of synchronization client. `mqtt` is the only one
    /// implemented.
    pub client_kind: String,
    /// Publish a full entity-version snapshot after every connect, to
    /// let the server drive a complete re-synchronization.
    pub publish_versions_on_connect: bool,
    /// Attach a telemetry snapshot to the connected notification.
    pub telemetry_enabled: bool,
    /// Publish a disconnect notification before a graceful disconnect.
    pub notify_graceful_disconnect: bool,
    /// Maximum journalled events drained per cycle.
    pub max_events_per_drain: i64,
    /// Bound on the wait for the worker to stop.
    pub stop_timeout_ms: u64,
    /// Minimum pause between worker cycles. Throttles outgoing traffic
    /// and CPU.
    pub min_sleep_time_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            client_kind: "mqtt".into(),
            publish_versions_on_connect: false,
            telemetry_enabled: true,
            notify_graceful_disconnect: true,
            max_events_per_drain: 100,
            stop_timeout_ms: 10_000,
            min_sleep_time_ms: 0,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn min_sleep_time(&self) -> Duration {
        Duration::from_millis(self.min_sleep_time_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_interval_ms: u64,
    /// Each interval is drawn from
    /// `[interval * (1 - factor), interval * (1 + factor)]`.
    pub randomization_factor: f64,
    pub multiplier: f64,
    /// Cap on the un-randomized interval.
    pub max_interval_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_interval_ms: 500,
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval_ms: 60_000,
        }
    }
}

impl BackoffConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Builds the exponential backoff driving the worker ticker. No
    /// elapsed-time cutoff: the worker keeps retrying at the capped
    /// interval forever.
    pub fn build(&self) -> ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval())
            .with_randomization_factor(self.randomization_factor)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_interval())
            .with_max_elapsed_time(None)
            .build()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceIdSource {
    #[default]
    Mac,
    Hostname,
    Config,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub device_id_source: DeviceIdSource,
    pub device_id: String,
    pub customer_id: String,
    pub tenant_id: String,
    pub tenant_name: String,
    /// Custom variables layered into the environment.
    pub variables: HashMap<String, String>,
    pub case_sensitive_variables: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.page_size, 20);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.max_entities_per_message, 50);
        assert_eq!(config.sync.max_events_per_drain, 100);
        assert!(config.mqtt.last_will_enabled);
        assert!(!config.sync.publish_versions_on_connect);
        assert_eq!(config.device.device_id_source, DeviceIdSource::Mac);
    }

    #[test]
    fn test_backoff_build() {
        let config = BackoffConfig::default();
        let mut backoff = config.build();
        // With no elapsed-time cutoff the backoff never yields None
        for _ in 0..64 {
            let interval = backoff::backoff::Backoff::next_backoff(&mut backoff)
                .expect("backoff should not stop");
            assert!(interval <= config.max_interval() * 2);
        }
    }
}
