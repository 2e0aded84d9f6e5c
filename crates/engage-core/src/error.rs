//! Error taxonomy for the sync and escalation engine.
//!
//! Only resource unavailability and notification-gate races propagate to
//! callers. Data-shape anomalies (unparseable timestamps, missing roster
//! joins) are recovered locally with a safe default and a warning.

use thiserror::Error;

/// Errors surfaced across the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A reference dataset could not be loaded after exhausting retries.
    /// Any previously cached value remains usable.
    #[error("reference dataset '{dataset}' unavailable after {attempts} attempts: {reason}")]
    DataUnavailable {
        dataset: String,
        attempts: u32,
        reason: String,
    },

    /// The change feed reported a delivery failure. The last-known-good
    /// view is retained, not cleared.
    #[error("change feed error: {0}")]
    FeedSubscription(String),

    /// No guardian contact is resolvable for the student; the student is
    /// reported as non-actionable, never hidden.
    #[error("no contact resolvable for student {student_id}")]
    NotificationTargetMissing { student_id: String },

    /// The record to flag as notified could not be located (concurrent
    /// deletion). The caller must not assume the gate closed.
    #[error("no infringement record for student {student_id} to mark step {step} notified")]
    MarkNotifiedRaceLost { student_id: String, step: u8 },

    /// The caller's profile lacks the administrator flag required for the
    /// operation. Distinct from store failures so hosts can render
    /// "forbidden" rather than "broken".
    #[error("'{operation}' requires an administrator profile")]
    Forbidden { operation: String },

    /// A write against the event store failed.
    #[error("event store error: {0}")]
    Store(String),

    /// A message template is missing and no fallback applies.
    #[error("template '{id}' unavailable")]
    Template { id: String },
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
