//! MQTT transport client.
//!
//! The concrete [`TransportClient`](trellis_api::TransportClient)
//! implementation: a retained-session pub/sub client with a last-will
//! disconnect notification. Topic strings are templates expanded
//! against the variable environment.

mod client;

pub use client::{MqttTransport, TelemetrySource};
