//! Structured error types for the event pool.
//!
//! `PoolError` is pattern-matchable instead of a generic `anyhow::Error`.
//! Every failure is local to one call or one record: the pool itself never
//! ends up in an inconsistent state because an emit was rejected or a record
//! timed out.
//!
//! # Example
//!
//! ```ignore
//! use eventpool::{EventPool, PoolError, TimeoutStage};
//!
//! match pool.pull("worker-1").await {
//!     Ok(record) => process(record),
//!     Err(PoolError::Timeout { stage: TimeoutStage::Pull, .. }) => {
//!         // Nothing arrived in time, poll again later
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::EventId;

/// Which deadline elapsed.
///
/// `Pull` only ever appears on errors returned by a pull. Records carry
/// `Pending` or `Handling` in [`EventState::TimedOut`](crate::EventState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutStage {
    /// A pull found no record within its wait window.
    Pull,
    /// The record was not pulled within its pending timeout.
    Pending,
    /// The record was pulled but not handled within its handling timeout.
    Handling,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutStage::Pull => write!(f, "pull"),
            TimeoutStage::Pending => write!(f, "pending"),
            TimeoutStage::Handling => write!(f, "handling"),
        }
    }
}

/// Errors surfaced by [`EventPool`](crate::EventPool) and
/// [`EventRecord`](crate::EventRecord) operations.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum PoolError {
    /// The recipient id was empty or otherwise unusable.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the input.
        reason: String,
    },

    /// The recipient's pending queue is full; the event was not created.
    #[error("pending queue for recipient '{recipient}' is full (limit {limit})")]
    CapacityExceeded {
        /// The recipient whose queue is full.
        recipient: String,
        /// The effective `max_pending_events` at the time of the emit.
        limit: usize,
    },

    /// A deadline elapsed before the awaited transition happened.
    #[error("{stage} timeout elapsed after {limit:?}")]
    Timeout {
        /// Which deadline elapsed.
        stage: TimeoutStage,
        /// The configured duration of that deadline.
        limit: Duration,
    },

    /// The record was explicitly failed.
    #[error("event {id} failed: {reason}")]
    Failed {
        /// The failed record.
        id: EventId,
        /// Reason supplied by whoever signalled the failure.
        reason: String,
    },
}

impl PoolError {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        PoolError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// True for any of the three timeout stages.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Timeout { .. })
    }

    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, PoolError::CapacityExceeded { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = PoolError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_names_stage() {
        let err = PoolError::Timeout {
            stage: TimeoutStage::Handling,
            limit: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "handling timeout elapsed after 250ms");
        assert!(err.is_timeout());
        assert!(!err.is_capacity_exceeded());
    }

    #[test]
    fn test_capacity_display() {
        let err = PoolError::CapacityExceeded {
            recipient: "r".into(),
            limit: 1,
        };
        assert!(err.to_string().contains("'r'"));
        assert!(err.is_capacity_exceeded());
    }

    #[test]
    fn test_stage_serializes_by_name() {
        let json = serde_json::to_string(&TimeoutStage::Pending).unwrap();
        assert_eq!(json, "\"Pending\"");
    }
}
