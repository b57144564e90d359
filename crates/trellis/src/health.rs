//! Health probes.
//!
//! Healthy means: the engine enforces foreign keys, the integrity
//! check is clean, and the sync worker answers a ping.

use serde::Serialize;
use std::time::Duration;

use trellis_api::Error;

use crate::ping;
use crate::store::Store;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HealthReport {
    fn failed(error: impl ToString, details: Option<serde_json::Value>) -> Self {
        HealthReport {
            healthy: false,
            error: Some(error.to_string()),
            details,
        }
    }
}

pub async fn check(store: &Store) -> HealthReport {
    match store.foreign_keys_enabled() {
        Ok(true) => {}
        Ok(false) => {
            return HealthReport::failed(
                Error::ForeignKeysDisabled,
                Some(serde_json::json!("foreign keys are not enabled")),
            )
        }
        Err(e) => return HealthReport::failed(e, None),
    }

    match store.integrity_check() {
        Ok(anomalies) if anomalies.is_empty() => {}
        Ok(anomalies) => {
            return HealthReport::failed(
                Error::Store("integrity check reported anomalies".into()),
                Some(serde_json::json!(anomalies)),
            )
        }
        Err(e) => return HealthReport::failed(e, None),
    }

    if let Err(e) = ping::ping(PING_TIMEOUT).await {
        tracing::error!(error = %e, "failed to ping sync worker");
        return HealthReport::failed(e, None);
    }

    HealthReport {
        healthy: true,
        error: None,
        details: None,
    }
}
