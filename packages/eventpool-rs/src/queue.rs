//! Per-recipient queue.
//!
//! Holds the FIFO of pending records, the records pulled but still tracked,
//! and the FIFO of suspended pulls. `waiters` is only ever non-empty while
//! `pending` is empty: an emit hands its record to the oldest live waiter
//! instead of queueing it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::trace;

use crate::record::{EventId, EventRecord};

/// A pull suspended on an empty queue.
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) tx: oneshot::Sender<Arc<EventRecord>>,
}

#[derive(Default)]
pub(crate) struct RecipientQueue {
    pub(crate) pending: VecDeque<Arc<EventRecord>>,
    pub(crate) active: HashMap<EventId, Arc<EventRecord>>,
    pub(crate) waiters: VecDeque<Waiter>,
}

impl RecipientQueue {
    /// Hand `record` to the oldest live waiter, or queue it at the back.
    pub(crate) fn deliver(&mut self, record: Arc<EventRecord>) {
        if let Some(record) = self.hand_off(record) {
            self.pending.push_back(record);
        }
    }

    /// Like `deliver`, but a record nobody takes goes back to the front.
    ///
    /// Used when a cancelled pull gives back a record it never returned.
    pub(crate) fn redeliver(&mut self, record: Arc<EventRecord>) {
        if let Some(record) = self.hand_off(record) {
            self.pending.push_front(record);
        }
    }

    fn hand_off(&mut self, mut record: Arc<EventRecord>) -> Option<Arc<EventRecord>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(record) {
                Ok(()) => {
                    trace!(waiter = waiter.id, "handed record to suspended pull");
                    return None;
                }
                // Receiver gone: that pull was dropped, try the next one
                Err(returned) => record = returned,
            }
        }
        Some(record)
    }

    /// Remove a waiter. Returns false if an emit already took it.
    pub(crate) fn withdraw(&mut self, waiter_id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == waiter_id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty() && self.waiters.is_empty()
    }
}
