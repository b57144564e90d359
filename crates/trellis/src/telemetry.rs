//! Process telemetry.
//!
//! The sync worker stamps the shared state as messages arrive and sync
//! batches land; `snapshot` assembles the full picture answered to
//! GET_TELEMETRY commands and attached to connect notifications.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use trellis_api::Result;

use crate::services::{attributes, items, relations};
use crate::store::Store;
use crate::time;

#[derive(Debug, Default)]
struct TelemetryState {
    last_sync_ts: i64,
    last_received_message_ts: i64,
}

static STATE: Lazy<RwLock<TelemetryState>> = Lazy::new(|| RwLock::new(TelemetryState::default()));

pub fn set_last_sync_ts() {
    STATE.write().unwrap().last_sync_ts = time::timestamp_ms();
}

pub fn last_sync_ts() -> i64 {
    STATE.read().unwrap().last_sync_ts
}

pub fn set_last_message_received_ts() {
    STATE.write().unwrap().last_received_message_ts = time::timestamp_ms();
}

pub fn last_message_received_ts() -> i64 {
    STATE.read().unwrap().last_received_message_ts
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryData {
    pub application_uptime: i64,
    pub system_uptime: Option<i64>,
    pub in_container: bool,
    pub timestamp_utc: i64,
    pub timestamp_local: i64,
    pub last_sync_ts: i64,
    pub last_received_message_ts: i64,
    pub store_file_size: i64,
    pub items_count: i64,
    pub attributes_count: i64,
    pub relations_count: i64,
}

pub fn snapshot(store: &Store) -> Result<TelemetryData> {
    let state = STATE.read().unwrap();

    Ok(TelemetryData {
        application_uptime: time::uptime_ms(),
        system_uptime: time::system_uptime_ms(),
        in_container: time::in_container(),
        timestamp_utc: time::timestamp_ms(),
        timestamp_local: time::timestamp_local_ms(),
        last_sync_ts: state.last_sync_ts,
        last_received_message_ts: state.last_received_message_ts,
        store_file_size: store.size()?,
        items_count: items::count(store)?,
        attributes_count: attributes::count(store)?,
        relations_count: relations::count(store)?,
    })
}
