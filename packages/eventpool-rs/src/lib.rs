//! # eventpool
//!
//! An in-process rendezvous point between producers that emit named,
//! addressed events and consumers that pull the events addressed to them,
//! one at a time.
//!
//! ## Core Concepts
//!
//! The pool inverts the usual push model:
//! - A producer [`emit`](EventPool::emit)s an event for a recipient id. The
//!   recipient does not need to be listening.
//! - A consumer [`pull`](EventPool::pull)s its next event, suspending until
//!   one arrives or the pull times out.
//!
//! Every emit returns an [`Emission`] that can be awaited. By default it
//! resolves once the event is pulled; with
//! [`emit_and_wait`](EventPool::emit_and_wait) it resolves once the consumer
//! marks the [`EventRecord`] handled.
//!
//! ## Architecture
//!
//! ```text
//! Producer                       EventPool                        Consumer
//!    │                                                               │
//!    │ emit(r, name, args) ──► queue[r].pending ──► pull(r) ◄────────┤
//!    │                            │  (or hand-off to the oldest      │
//!    │                            │   suspended pull)                │
//!    │                            ▼                                  │
//!    │                       queue[r].active ◄── tracked until ──────┤
//!    │                                           complete()/fail()   │
//!    ▼
//! Emission.await ── Pulled | Handled(result) | Failed | Timeout
//! ```
//!
//! ## Timeouts
//!
//! Three independent limits, all optional:
//!
//! | Limit                | Starts    | Ends      | Error                              |
//! |----------------------|-----------|-----------|------------------------------------|
//! | `max_pending_events` | -         | -         | `CapacityExceeded` on emit         |
//! | `pending_timeout`    | emit      | pulled    | `Timeout { stage: Pending }`       |
//! | `handling_timeout`   | pulled    | handled   | `Timeout { stage: Handling }`      |
//!
//! A pull has its own wait window (30 seconds by default) and fails with
//! `Timeout { stage: Pull }` when it elapses.
//!
//! ## Guarantees
//!
//! - **FIFO per recipient**, including the order in which suspended pulls
//!   are served
//! - **At most once**: a record is returned by exactly one pull
//! - **In-memory only**: no persistence, no cross-process sharing
//!
//! ## Example
//!
//! ```
//! use eventpool::{Delivery, EventPool};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), eventpool::PoolError> {
//! let pool = EventPool::new();
//!
//! let emission = pool.emit("worker-1", "ping", vec![json!(1)])?;
//!
//! let record = pool.pull("worker-1").await?;
//! assert_eq!(record.name(), "ping");
//!
//! assert_eq!(emission.await?, Delivery::Pulled);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod pool;
mod queue;
mod record;


// Re-export configuration types
pub use crate::config::{
    EventOptions, PoolOptions, PullOptions, DEFAULT_MAX_PENDING_EVENTS, DEFAULT_PULL_TIMEOUT,
};

// Re-export error types
pub use crate::error::{PoolError, Result, TimeoutStage};

// Re-export pool types (primary entry point)
pub use crate::pool::{Emission, EventPool};

// Re-export record types
pub use crate::record::{Delivery, EventId, EventRecord, EventState, Signal};
