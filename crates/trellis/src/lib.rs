pub mod codec;
pub mod config;
pub mod env;
pub mod health;
pub mod journal;
pub mod ping;
pub mod services;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod time;

pub use store::{Store, TxContext};
pub use sync::worker::Worker;

// The API crate is part of this crate's public surface.
pub use trellis_api as api;
