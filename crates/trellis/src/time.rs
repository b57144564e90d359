use chrono::{Local, Utc};
use once_cell::sync::Lazy;

// Application start timestamp, captured on first access. `init` is
// called from the binary entrypoint so the uptime baseline is the
// process start, not the first telemetry query.
static START_MS: Lazy<i64> = Lazy::new(timestamp_ms);

/// Pins the application start timestamp. Call once, early.
pub fn init() {
    Lazy::force(&START_MS);
}

/// Milliseconds since the Unix epoch, UTC.
pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Milliseconds since the Unix epoch, shifted by the local UTC offset.
/// Only used for telemetry display; rows are stamped with
/// [`timestamp_ms`] unless the store is configured for localtime.
pub fn timestamp_local_ms() -> i64 {
    let now = Local::now();
    now.timestamp_millis() + i64::from(now.offset().local_minus_utc()) * 1000
}

/// Application uptime in milliseconds.
pub fn uptime_ms() -> i64 {
    timestamp_ms() - *START_MS
}

/// System uptime in milliseconds, where the platform exposes it.
pub fn system_uptime_ms() -> Option<i64> {
    let raw = std::fs::read_to_string("/proc/uptime").ok()?;
    let seconds: f64 = raw.split_whitespace().next()?.parse().ok()?;
    Some((seconds * 1000.0) as i64)
}

/// Whether the process is running inside a container.
pub fn in_container() -> bool {
    std::path::Path::new("/.dockerenv").exists()
}
