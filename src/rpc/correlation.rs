//! Correlation store pairing request ids with their responses.
//!
//! Callers `reserve` a slot before the request goes on the wire, the
//! listener `publish`es the response when it arrives, and the caller blocks
//! in `await_and_take` until the slot fills, the connection dies, or the
//! timeout elapses. Waiters sleep on a condition variable that is notified on
//! every publish and on disconnect, so there is no polling and no missed
//! wakeup: arrival is always checked under the same lock the publisher holds.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::client::ClientError;
use crate::models::Response;

enum Slot {
    Pending,
    Arrived(Response),
}

#[derive(Default)]
struct Slots {
    entries: HashMap<String, Slot>,
    closed: bool,
}

/// Thread-safe map from request id to pending or arrived response.
pub(crate) struct CorrelationStore {
    slots: Mutex<Slots>,
    arrived: Condvar,
}

impl CorrelationStore {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            arrived: Condvar::new(),
        }
    }

    /// Insert an empty slot for `id`.
    ///
    /// # Errors
    ///
    /// `ClientError::ConnectionClosed` once the store has been disconnected.
    pub(crate) fn reserve(&self, id: &str) -> Result<(), ClientError> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(ClientError::ConnectionClosed);
        }
        slots.entries.insert(id.to_string(), Slot::Pending);
        Ok(())
    }

    /// Store a response under its id and wake waiters. Last write wins.
    pub(crate) fn publish(&self, response: Response) {
        let mut slots = self.slots.lock();
        if slots.closed {
            debug!("Dropping response {} on a closed connection", response.id);
            return;
        }
        if !matches!(slots.entries.get(&response.id), Some(Slot::Pending)) {
            debug!("Response {} has no pending slot", response.id);
        }
        slots
            .entries
            .insert(response.id.clone(), Slot::Arrived(response));
        drop(slots);
        self.arrived.notify_all();
    }

    /// Block until the response for `id` arrives, then remove and return it.
    ///
    /// Exactly one caller can take a given response. On timeout the slot is
    /// left in place; a late response fills it and is reclaimed by `disconnect`.
    ///
    /// # Errors
    ///
    /// - `ClientError::ResponseTimeout` if nothing arrives within `timeout`
    /// - `ClientError::ConnectionClosed` if the store is disconnected first
    pub(crate) fn await_and_take(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();

        loop {
            if let Some(response) = take_arrived(&mut slots, id) {
                return Ok(response);
            }
            if slots.closed {
                return Err(ClientError::ConnectionClosed);
            }
            if self.arrived.wait_until(&mut slots, deadline).timed_out() {
                if let Some(response) = take_arrived(&mut slots, id) {
                    return Ok(response);
                }
                if slots.closed {
                    return Err(ClientError::ConnectionClosed);
                }
                return Err(ClientError::ResponseTimeout {
                    id: id.to_string(),
                    timeout,
                });
            }
        }
    }

    /// Drop the slot for a request that never made it onto the wire.
    pub(crate) fn discard(&self, id: &str) {
        self.slots.lock().entries.remove(id);
    }

    /// Refuse new slots, drop every slot and wake every waiter.
    pub(crate) fn disconnect(&self) {
        let mut slots = self.slots.lock();
        slots.closed = true;
        slots.entries.clear();
        drop(slots);
        self.arrived.notify_all();
    }

    /// Number of slots currently held.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }
}

fn take_arrived(slots: &mut Slots, id: &str) -> Option<Response> {
    if !matches!(slots.entries.get(id), Some(Slot::Arrived(_))) {
        return None;
    }
    match slots.entries.remove(id) {
        Some(Slot::Arrived(response)) => Some(response),
        _ => None,
    }
}
