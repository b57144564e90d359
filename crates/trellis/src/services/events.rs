//! Read-side queries over the event journal, exposed to local APIs and
//! telemetry. Mutation of the queue happens only through
//! [`crate::journal`].

use trellis_api::{Error, Event, Result};
use trellis_api::error::ResultExt;

use crate::journal;
use crate::store::Store;

/// The oldest `limit` events in delivery order.
pub fn first(store: &Store, limit: i64) -> Result<Vec<Event>> {
    journal::peek(store, limit).context("failed to get first events")
}

/// The newest `limit` events.
pub fn last(store: &Store, limit: i64) -> Result<Vec<Event>> {
    journal::last(store, limit).context("failed to get last events")
}

/// The single oldest undelivered event.
pub fn first_one(store: &Store) -> Result<Event> {
    journal::peek(store, 1)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found("event", "queue"))
}

pub fn count(store: &Store) -> Result<i64> {
    journal::count(store).context("failed to get events count")
}
