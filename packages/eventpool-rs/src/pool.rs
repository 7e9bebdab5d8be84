//! The event pool: per-recipient queues with pull-based delivery.
//!
//! Producers [`emit`](EventPool::emit) events addressed to a recipient id.
//! Consumers [`pull`](EventPool::pull) the next event addressed to them,
//! suspending until one arrives or the pull times out.
//!
//! ```text
//! emit("worker", ..) ──► queue["worker"] ──► pull("worker")
//!        │                 pending FIFO          │
//!        │                 waiters FIFO ◄────────┘ (empty queue)
//!        ▼
//!   Emission ── resolves on Pulled / Handled, fails on Failed / Timeout
//! ```
//!
//! # Guarantees
//!
//! - **FIFO per recipient**: records are pulled in emit order; suspended
//!   pulls are served in the order they started waiting
//! - **At most once**: each record is returned by exactly one pull
//! - **No cross-recipient ordering**: queues are independent
//! - **In-memory only**: nothing survives the process
//!
//! # Example
//!
//! ```ignore
//! let pool = EventPool::new();
//!
//! // Consumer side
//! let consumer = pool.clone();
//! tokio::spawn(async move {
//!     while let Ok(record) = consumer.pull("worker").await {
//!         let result = process(record.name(), record.arguments());
//!         record.complete(Some(result));
//!     }
//! });
//!
//! // Producer side: wait until the consumer reports completion
//! let delivery = pool.emit_and_wait("worker", "resize", vec![json!(640)])?.await?;
//! ```

use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::config::{EventOptions, PoolOptions, PullOptions};
use crate::error::{PoolError, Result, TimeoutStage};
use crate::queue::{RecipientQueue, Waiter};
use crate::record::{self, Delivery, EventId, EventRecord};

/// In-process rendezvous point between producers and pulling consumers.
///
/// Cloning is cheap and every clone shares the same queues.
#[derive(Clone)]
pub struct EventPool {
    shared: Arc<Shared>,
}

struct Shared {
    queues: DashMap<String, RecipientQueue>,
    options: PoolOptions,
    next_waiter: AtomicU64,
}

impl EventPool {
    /// Create a pool with default options.
    pub fn new() -> Self {
        Self::with_options(PoolOptions::default())
    }

    pub fn with_options(options: PoolOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: DashMap::new(),
                options,
                next_waiter: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    /// Per-event options derived from the pool defaults, ready to override.
    pub fn event_options(&self) -> EventOptions {
        self.shared.options.event_options()
    }

    /// Emit an event; the returned emission resolves once it is pulled.
    pub fn emit(
        &self,
        recipient: &str,
        name: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Result<Emission> {
        self.emit_with(recipient, name, arguments, self.event_options())
    }

    /// Emit an event; the returned emission resolves once it is handled.
    pub fn emit_and_wait(
        &self,
        recipient: &str,
        name: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Result<Emission> {
        let options = self.event_options().with_wait_for_handlers(true);
        self.emit_with(recipient, name, arguments, options)
    }

    /// Emit an event with explicit per-event options.
    ///
    /// Fails with `InvalidArgument` for an empty recipient id and with
    /// `CapacityExceeded` when the recipient already has
    /// `max_pending_events` records pending. In both cases no record is
    /// created.
    pub fn emit_with(
        &self,
        recipient: &str,
        name: impl Into<String>,
        arguments: Vec<Value>,
        options: EventOptions,
    ) -> Result<Emission> {
        let recipient = validate_recipient(recipient)?;
        let mut queue = self.shared.queues.entry(recipient.to_owned()).or_default();

        if let Some(limit) = options.max_pending_events {
            if queue.pending.len() >= limit {
                warn!(recipient, limit, "pending queue full, rejecting event");
                return Err(PoolError::CapacityExceeded {
                    recipient: recipient.to_owned(),
                    limit,
                });
            }
        }

        let record = Arc::new(EventRecord::new(recipient, name, arguments, options));
        queue.deliver(record.clone());
        debug!(
            recipient,
            event_id = %record.id(),
            name = record.name(),
            pending = queue.pending.len(),
            "event emitted"
        );

        Ok(Emission { record })
    }

    /// Pull the next event for `recipient`, waiting up to 30 seconds.
    pub async fn pull(&self, recipient: &str) -> Result<Arc<EventRecord>> {
        self.pull_with(recipient, PullOptions::default()).await
    }

    /// Pull the next event for `recipient` with explicit options.
    ///
    /// Returns immediately if a record is pending, otherwise suspends until
    /// an emit hands one over or the timeout elapses. Records that settled
    /// while pending (timed out or failed) are discarded on the way.
    pub async fn pull_with(
        &self,
        recipient: &str,
        options: PullOptions,
    ) -> Result<Arc<EventRecord>> {
        let recipient = validate_recipient(recipient)?;
        let deadline = options
            .timeout
            .and_then(|t| record::deadline_after(Instant::now(), t));

        // A pull whose record was discarded keeps its place at the head of
        // the waiter queue.
        let mut rejoin = false;
        loop {
            let record = self
                .next_record(recipient, deadline, &options, rejoin)
                .await?;
            if let Some(record) = self.accept(recipient, record, &options) {
                return Ok(record);
            }
            rejoin = true;
        }
    }

    /// Pull without suspending. `Ok(None)` if nothing is pending.
    pub fn try_pull(&self, recipient: &str) -> Result<Option<Arc<EventRecord>>> {
        let recipient = validate_recipient(recipient)?;
        let options = PullOptions::default();

        loop {
            let next = self
                .shared
                .queues
                .get_mut(recipient)
                .and_then(|mut queue| queue.pending.pop_front());
            let Some(record) = next else {
                return Ok(None);
            };
            if let Some(record) = self.accept(recipient, record, &options) {
                return Ok(Some(record));
            }
        }
    }

    /// Number of records waiting to be pulled by `recipient`.
    pub fn pending_len(&self, recipient: &str) -> usize {
        self.shared
            .queues
            .get(recipient)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Number of pulled records still tracked until they settle.
    pub fn active_len(&self, recipient: &str) -> usize {
        self.shared
            .queues
            .get(recipient)
            .map(|q| q.active.len())
            .unwrap_or(0)
    }

    /// Number of pulls currently suspended on `recipient`.
    pub fn waiting_pulls(&self, recipient: &str) -> usize {
        self.shared
            .queues
            .get(recipient)
            .map(|q| q.waiters.len())
            .unwrap_or(0)
    }

    /// Look up a tracked record by id.
    pub fn active_record(&self, recipient: &str, id: EventId) -> Option<Arc<EventRecord>> {
        self.shared
            .queues
            .get(recipient)
            .and_then(|q| q.active.get(&id).cloned())
    }

    /// All recipient ids that have a queue.
    pub fn recipients(&self) -> Vec<String> {
        self.shared
            .queues
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove queues with nothing pending, nothing tracked and no suspended
    /// pulls. Returns how many were removed.
    ///
    /// Queues are otherwise kept forever once created.
    pub fn prune_idle(&self) -> usize {
        let mut removed = 0;
        self.shared.queues.retain(|_, queue| {
            let idle = queue.is_idle();
            if idle {
                removed += 1;
            }
            !idle
        });
        if removed > 0 {
            debug!(removed, "pruned idle recipient queues");
        }
        removed
    }

    async fn next_record(
        &self,
        recipient: &str,
        deadline: Option<Instant>,
        options: &PullOptions,
        mut rejoin: bool,
    ) -> Result<Arc<EventRecord>> {
        loop {
            let mut waiting = {
                let mut queue = self.shared.queues.entry(recipient.to_owned()).or_default();
                if let Some(record) = queue.pending.pop_front() {
                    return Ok(record);
                }

                let id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                let waiter = Waiter { id, tx };
                if rejoin {
                    queue.waiters.push_front(waiter);
                } else {
                    queue.waiters.push_back(waiter);
                }
                WaitingPull {
                    shared: &self.shared,
                    recipient,
                    id,
                    rx,
                    finished: false,
                }
            };
            trace!(recipient, waiter = waiting.id, "pull suspended on empty queue");

            let received = match deadline {
                Some(deadline) => {
                    let outcome = timeout_at(deadline, &mut waiting.rx).await;
                    match outcome {
                        Ok(received) => received,
                        Err(_) => {
                            // The timer fired, but an emit may have handed us a
                            // record before the waiter was withdrawn.
                            return match waiting.withdraw() {
                                Some(record) => Ok(record),
                                None => {
                                    debug!(recipient, "pull timed out");
                                    Err(PoolError::Timeout {
                                        stage: TimeoutStage::Pull,
                                        limit: options.timeout.unwrap_or_default(),
                                    })
                                }
                            };
                        }
                    }
                }
                None => (&mut waiting.rx).await,
            };

            match received {
                Ok(record) => {
                    waiting.finished = true;
                    return Ok(record);
                }
                // Sender dropped without a record; register again
                Err(_) => {
                    if let Some(record) = waiting.withdraw() {
                        return Ok(record);
                    }
                    rejoin = true;
                }
            }
        }
    }

    /// Mark a dequeued record pulled and start tracking it if requested.
    fn accept(
        &self,
        recipient: &str,
        record: Arc<EventRecord>,
        options: &PullOptions,
    ) -> Option<Arc<EventRecord>> {
        if !record.mark_pulled() {
            debug!(
                recipient,
                event_id = %record.id(),
                state = ?record.state(),
                "discarding record that is no longer pending"
            );
            return None;
        }

        debug!(recipient, event_id = %record.id(), name = record.name(), "event pulled");
        if record.options().wait_for_handlers || options.wait_for_resolution {
            self.track(recipient, &record);
        }
        Some(record)
    }

    fn track(&self, recipient: &str, record: &Arc<EventRecord>) {
        self.shared
            .queues
            .entry(recipient.to_owned())
            .or_default()
            .active
            .insert(record.id(), record.clone());

        let shared = Arc::downgrade(&self.shared);
        record.on_release(Box::new(move |record: &EventRecord| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if let Some(mut queue) = shared.queues.get_mut(record.recipient()) {
                queue.active.remove(&record.id());
            }
            trace!(event_id = %record.id(), state = ?record.state(), "released tracked record");
        }));
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPool")
            .field("recipients", &self.shared.queues.len())
            .field("options", &self.shared.options)
            .finish()
    }
}

fn validate_recipient(recipient: &str) -> Result<&str> {
    if recipient.is_empty() {
        return Err(PoolError::invalid_argument(
            "recipient id must be a non-empty string",
        ));
    }
    Ok(recipient)
}

/// A pull suspended on an empty queue.
///
/// Dropping it before it finished withdraws the waiter; a record that was
/// handed over in the meantime goes back to the head of the queue.
struct WaitingPull<'a> {
    shared: &'a Shared,
    recipient: &'a str,
    id: u64,
    rx: oneshot::Receiver<Arc<EventRecord>>,
    finished: bool,
}

impl WaitingPull<'_> {
    /// Withdraw the waiter and return a record handed over before that.
    fn withdraw(&mut self) -> Option<Arc<EventRecord>> {
        self.finished = true;
        let mut queue = self
            .shared
            .queues
            .entry(self.recipient.to_owned())
            .or_default();
        queue.withdraw(self.id);
        self.rx.try_recv().ok()
    }
}

impl Drop for WaitingPull<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut queue = self
            .shared
            .queues
            .entry(self.recipient.to_owned())
            .or_default();
        queue.withdraw(self.id);
        if let Ok(record) = self.rx.try_recv() {
            debug!(
                recipient = self.recipient,
                event_id = %record.id(),
                "pull cancelled after hand-off, returning record to queue"
            );
            queue.redeliver(record);
        }
    }
}

/// Handle returned by an emit.
///
/// Exposes the created record and can be awaited for the state the emitter
/// asked for: [`Delivery::Pulled`] for `emit`, [`Delivery::Handled`] for
/// `emit_and_wait`. Dropping it does not affect the record.
#[derive(Debug, Clone)]
pub struct Emission {
    record: Arc<EventRecord>,
}

impl Emission {
    pub fn record(&self) -> &Arc<EventRecord> {
        &self.record
    }

    pub fn id(&self) -> EventId {
        self.record.id()
    }

    pub fn into_record(self) -> Arc<EventRecord> {
        self.record
    }
}

impl IntoFuture for Emission {
    type Output = Result<Delivery>;
    type IntoFuture = BoxFuture<'static, Result<Delivery>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(record::settle(self.record))
    }
}
