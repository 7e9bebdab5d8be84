//! Event records and their lifecycle.
//!
//! An [`EventRecord`] is the immutable description of one unit of work:
//! identity, recipient, name, arguments and the options captured at emit
//! time. Its only mutable part is a small state machine:
//!
//! ```text
//! Pending ──► Pulled ──► Handled(result)
//!    │           │
//!    ├──► Failed(reason) ◄──┤
//!    └──► TimedOut(stage) ◄─┘
//! ```
//!
//! `Handled`, `Failed` and `TimedOut` are terminal. Only the first terminal
//! transition is applied; later signals are ignored and report `false`.
//!
//! Deadlines live on the record itself. The pending deadline is fixed at
//! creation, the handling deadline at the moment the record is pulled. They
//! are enforced by whoever observes them first: an awaiting emitter, a pull
//! reaching an expired record, or a late `handled` signal.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EventOptions;
use crate::error::{PoolError, Result, TimeoutStage};

/// Unique identifier of an emitted event.
///
/// # Example
///
/// ```
/// use eventpool::EventId;
///
/// let a = EventId::new();
/// let b = EventId::new();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventState {
    /// Waiting in the recipient's queue.
    Pending,
    /// Handed to a consumer.
    Pulled,
    /// The consumer reported completion, with an optional result payload.
    Handled(Option<Value>),
    /// Someone reported failure.
    Failed(String),
    /// A deadline elapsed (`Pending` or `Handling`).
    TimedOut(TimeoutStage),
}

impl EventState {
    /// True once the record reached a terminal state.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            EventState::Handled(_) | EventState::Failed(_) | EventState::TimedOut(_)
        )
    }
}

/// A lifecycle transition requested from outside the record.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Pulled,
    Handled(Option<Value>),
    Failed(String),
}

/// What an emitter observed when its emission resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A consumer pulled the record.
    Pulled,
    /// A consumer handled the record and reported this result.
    Handled(Option<Value>),
}

pub(crate) type ReleaseHook = Box<dyn FnOnce(&EventRecord) + Send>;

/// One emitted event.
///
/// Records are shared as `Arc<EventRecord>` between the pool, the emitter's
/// [`Emission`](crate::Emission) and the consumer that pulled it. Callers
/// only ever change the lifecycle state; the pool's queues are never exposed.
pub struct EventRecord {
    id: EventId,
    recipient: String,
    name: String,
    arguments: Vec<Value>,
    options: EventOptions,
    emitted_at: DateTime<Utc>,
    pending_deadline: Option<Instant>,
    pulled_at: OnceLock<Instant>,
    state: watch::Sender<EventState>,
    release: Mutex<Option<ReleaseHook>>,
}

impl EventRecord {
    pub(crate) fn new(
        recipient: impl Into<String>,
        name: impl Into<String>,
        arguments: Vec<Value>,
        options: EventOptions,
    ) -> Self {
        let pending_deadline = options
            .pending_timeout
            .and_then(|t| deadline_after(Instant::now(), t));
        Self {
            id: EventId::new(),
            recipient: recipient.into(),
            name: name.into(),
            arguments,
            options,
            emitted_at: Utc::now(),
            pending_deadline,
            pulled_at: OnceLock::new(),
            state: watch::Sender::new(EventState::Pending),
            release: Mutex::new(None),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    pub fn options(&self) -> &EventOptions {
        &self.options
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    /// Snapshot of the current lifecycle state.
    pub fn state(&self) -> EventState {
        self.state.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.state.borrow().is_settled()
    }

    /// True once the record has been pulled, whatever happened afterwards.
    pub fn was_pulled(&self) -> bool {
        self.pulled_at.get().is_some()
    }

    /// Deadline for being pulled, if the record has a pending timeout.
    pub fn pending_deadline(&self) -> Option<Instant> {
        self.pending_deadline
    }

    /// Deadline for being handled.
    ///
    /// Only set once the record is pulled, and only when the emitter waits
    /// for handlers and a handling timeout is configured.
    pub fn handling_deadline(&self) -> Option<Instant> {
        if !self.options.wait_for_handlers {
            return None;
        }
        let pulled_at = *self.pulled_at.get()?;
        self.options
            .handling_timeout
            .and_then(|t| deadline_after(pulled_at, t))
    }

    /// Apply a lifecycle transition.
    ///
    /// Returns `true` if the requested transition happened. A `Handled`
    /// signal arriving after the handling deadline settles the record as
    /// timed out instead and returns `false`.
    pub fn signal(&self, signal: Signal) -> bool {
        match signal {
            Signal::Pulled => self.mark_pulled(),
            Signal::Handled(result) => self.mark_handled(result),
            Signal::Failed(reason) => self.mark_failed(reason),
        }
    }

    /// Shorthand for `signal(Signal::Handled(result))`.
    pub fn complete(&self, result: Option<Value>) -> bool {
        self.signal(Signal::Handled(result))
    }

    /// Shorthand for `signal(Signal::Failed(reason))`.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.signal(Signal::Failed(reason.into()))
    }

    /// Wait until the record is pulled.
    ///
    /// Fails with `Timeout` if the pending deadline elapses first and with
    /// `Failed` if the record is failed before being pulled.
    pub async fn wait_pulled(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            if self.was_pulled() {
                return Ok(());
            }
            let state = rx.borrow_and_update().clone();
            match state {
                EventState::Pending => {
                    self.wait_change(&mut rx, self.pending_deadline, TimeoutStage::Pending)
                        .await
                }
                EventState::Pulled | EventState::Handled(_) => return Ok(()),
                EventState::Failed(reason) => return Err(self.failed_error(reason)),
                EventState::TimedOut(stage) => return Err(self.timeout_error(stage)),
            }
        }
    }

    /// Wait until the record is handled and return the consumer's result.
    pub async fn wait_handled(&self) -> Result<Option<Value>> {
        let mut rx = self.state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                EventState::Pending => {
                    self.wait_change(&mut rx, self.pending_deadline, TimeoutStage::Pending)
                        .await
                }
                EventState::Pulled => {
                    self.wait_change(&mut rx, self.handling_deadline(), TimeoutStage::Handling)
                        .await
                }
                EventState::Handled(result) => return Ok(result),
                EventState::Failed(reason) => return Err(self.failed_error(reason)),
                EventState::TimedOut(stage) => return Err(self.timeout_error(stage)),
            }
        }
    }

    /// Move `Pending` to `Pulled`, or to `TimedOut` if the pending deadline
    /// already passed. Returns whether the record is now pulled.
    pub(crate) fn mark_pulled(&self) -> bool {
        let now = Instant::now();
        let expired = self.pending_deadline.is_some_and(|d| now >= d);
        let applied = self.transition(|state| match state {
            EventState::Pending if expired => Some(EventState::TimedOut(TimeoutStage::Pending)),
            EventState::Pending => {
                let _ = self.pulled_at.set(now);
                Some(EventState::Pulled)
            }
            _ => None,
        });
        applied && !expired
    }

    fn mark_handled(&self, result: Option<Value>) -> bool {
        let expired = self
            .handling_deadline()
            .is_some_and(|d| Instant::now() >= d);
        let applied = self.transition(|state| match state {
            EventState::Pulled if expired => Some(EventState::TimedOut(TimeoutStage::Handling)),
            EventState::Pulled => Some(EventState::Handled(result)),
            _ => None,
        });
        if applied && expired {
            debug!(event_id = %self.id, "handled signal arrived after handling deadline");
        }
        applied && !expired
    }

    fn mark_failed(&self, reason: String) -> bool {
        self.transition(|state| match state {
            EventState::Pending | EventState::Pulled => Some(EventState::Failed(reason)),
            _ => None,
        })
    }

    /// Settle the record as timed out at `stage` if it is still waiting there.
    pub(crate) fn expire(&self, stage: TimeoutStage) -> bool {
        self.transition(|state| match (state, stage) {
            (EventState::Pending, TimeoutStage::Pending)
            | (EventState::Pulled, TimeoutStage::Handling) => Some(EventState::TimedOut(stage)),
            _ => None,
        })
    }

    fn transition(&self, next: impl FnOnce(&EventState) -> Option<EventState>) -> bool {
        let applied = self.state.send_if_modified(|state| match next(state) {
            Some(new_state) => {
                *state = new_state;
                true
            }
            None => false,
        });
        if applied && self.is_settled() {
            self.run_release();
        }
        applied
    }

    /// Register a hook to run once when the record settles.
    ///
    /// Runs immediately if the record already settled.
    pub(crate) fn on_release(&self, hook: ReleaseHook) {
        let mut slot = self.lock_release();
        if self.is_settled() {
            drop(slot);
            hook(self);
        } else {
            *slot = Some(hook);
        }
    }

    fn run_release(&self) {
        let hook = self.lock_release().take();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    fn lock_release(&self) -> MutexGuard<'_, Option<ReleaseHook>> {
        match self.release.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(event_id = %self.id, "release mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    async fn wait_change(
        &self,
        rx: &mut watch::Receiver<EventState>,
        deadline: Option<Instant>,
        stage: TimeoutStage,
    ) {
        // The sender lives as long as `self`, so `changed` only errors if the
        // record is gone, which cannot happen while we borrow it.
        let changed = async {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        match deadline {
            Some(deadline) => {
                if timeout_at(deadline, changed).await.is_err() && self.expire(stage) {
                    debug!(event_id = %self.id, %stage, "event deadline elapsed");
                }
            }
            None => changed.await,
        }
    }

    fn failed_error(&self, reason: String) -> PoolError {
        PoolError::Failed {
            id: self.id,
            reason,
        }
    }

    fn timeout_error(&self, stage: TimeoutStage) -> PoolError {
        let limit = match stage {
            TimeoutStage::Pending => self.options.pending_timeout,
            TimeoutStage::Handling => self.options.handling_timeout,
            TimeoutStage::Pull => None,
        };
        PoolError::Timeout {
            stage,
            limit: limit.unwrap_or(Duration::ZERO),
        }
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("id", &self.id)
            .field("recipient", &self.recipient)
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// `start + timeout`, or `None` when that is past what the clock can
/// represent. A timeout that large never fires.
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Option<Instant> {
    start.checked_add(timeout)
}

/// Await the state an emitter asked for.
pub(crate) async fn settle(record: Arc<EventRecord>) -> Result<Delivery> {
    if record.options().wait_for_handlers {
        record.wait_handled().await.map(Delivery::Handled)
    } else {
        record.wait_pulled().await.map(|()| Delivery::Pulled)
    }
}
