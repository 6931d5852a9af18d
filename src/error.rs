//! Typed error kinds for precondition violations.
//!
//! Routine rejections (duplicate bid, unknown id, closed negotiation) are
//! reported as `bool`/`Option` per the component APIs, not as errors —
//! see the individual module docs. `CoreError` is reserved for the hard
//! preconditions called out below.

use thiserror::Error;

/// Structural error kinds. Variants map 1:1 to the failure categories
/// each component's contract describes; the message carries the
/// offending detail for diagnostics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Null/blank where required, out-of-range numeric value, or a
    /// malformed announcement id.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// An id that must be unique was already registered.
    #[error("duplicate id: {0}")]
    Duplicate(String),

    /// An illegal state-machine transition, awarding a closed
    /// negotiation twice, or a response without a correlation id.
    #[error("invalid state transition: {0}")]
    InvalidState(String),

    /// A request/response exchange did not complete within its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A waiter was resolved early due to shutdown or unregistration.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A referenced id (agent, announcement) was not found. Most call
    /// sites prefer a soft `bool`/`Option` over this variant; it exists
    /// for the few APIs where "not found" is itself a hard precondition
    /// violation.
    #[error("unknown reference: {0}")]
    Unknown(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
