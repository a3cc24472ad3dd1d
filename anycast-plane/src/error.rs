//! Closed fault taxonomy shared by every layer of the control plane.

use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};

/// Why an operation was rejected with [`Fault::Locked`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum LockedReason {
    /// Consumers are attached and the subscription is not clone-enabled.
    ConsumersAttached,
    /// The backing stream still carries uncommitted receives.
    UncommittedReceives,
    /// A racing create or delete did not resolve within the bounded wait.
    CreateOrDeleteInFlight,
}

impl Debug for LockedReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LockedReason::ConsumersAttached => write!(f, "ConsumersAttached"),
            LockedReason::UncommittedReceives => write!(f, "UncommittedReceives"),
            LockedReason::CreateOrDeleteInFlight => write!(f, "CreateOrDeleteInFlight"),
        }
    }
}

/// Control-plane fault taxonomy.
///
/// Store and transaction failures arrive as [`Fault::Resource`] and are
/// retryable from the caller's point of view. [`Fault::InternalInvariantViolation`]
/// marks a broken structural guarantee; it is logged at error severity where it
/// is raised and is never swallowed along error paths.
pub enum Fault {
    /// Storage or transaction machinery failed.
    Resource(String),
    /// The enclosing transaction rolled back; the caller sees the outcome.
    Rollback(String),
    /// Rejected because of attached consumers, uncommitted receives, or an
    /// unresolved racing create/delete.
    Locked { reason: LockedReason, detail: String },
    /// The referenced subscription or localisation does not exist.
    NotFound(String),
    /// Request parameters conflict with existing state.
    Mismatch(String),
    /// A durable subscription with this id already exists.
    AlreadyExists(String),
    /// A structural guarantee was violated; fatal to the enclosing operation.
    InternalInvariantViolation(String),
}

impl Fault {
    pub(crate) fn resource(detail: impl Into<String>) -> Self {
        Fault::Resource(detail.into())
    }

    pub(crate) fn locked(reason: LockedReason, detail: impl Into<String>) -> Self {
        Fault::Locked {
            reason,
            detail: detail.into(),
        }
    }

    pub(crate) fn not_found(detail: impl Into<String>) -> Self {
        Fault::NotFound(detail.into())
    }

    pub(crate) fn mismatch(detail: impl Into<String>) -> Self {
        Fault::Mismatch(detail.into())
    }

    pub(crate) fn invariant(detail: impl Into<String>) -> Self {
        Fault::InternalInvariantViolation(detail.into())
    }

    /// True for faults the caller may retry after the transient cause clears.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Fault::Resource(_) | Fault::Locked { .. })
    }

    pub fn locked_reason(&self) -> Option<LockedReason> {
        match self {
            Fault::Locked { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl Debug for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Resource(detail) => write!(f, "Resource({detail})"),
            Fault::Rollback(detail) => write!(f, "Rollback({detail})"),
            Fault::Locked { reason, detail } => write!(f, "Locked({reason:?}, {detail})"),
            Fault::NotFound(detail) => write!(f, "NotFound({detail})"),
            Fault::Mismatch(detail) => write!(f, "Mismatch({detail})"),
            Fault::AlreadyExists(detail) => write!(f, "AlreadyExists({detail})"),
            Fault::InternalInvariantViolation(detail) => {
                write!(f, "InternalInvariantViolation({detail})")
            }
        }
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Resource(detail) => {
                write!(f, "storage or transaction failure: {detail}")
            }
            Fault::Rollback(detail) => write!(f, "transaction rolled back: {detail}"),
            Fault::Locked { reason, detail } => {
                write!(f, "operation rejected ({reason:?}): {detail}")
            }
            Fault::NotFound(detail) => write!(f, "not found: {detail}"),
            Fault::Mismatch(detail) => {
                write!(f, "request conflicts with existing state: {detail}")
            }
            Fault::AlreadyExists(detail) => write!(f, "already exists: {detail}"),
            Fault::InternalInvariantViolation(detail) => {
                write!(f, "internal invariant violated: {detail}")
            }
        }
    }
}

impl Error for Fault {}

#[cfg(test)]
mod tests {
    use super::{Fault, LockedReason};

    #[test]
    fn retryable_faults_are_resource_and_locked() {
        assert!(Fault::resource("store down").is_retryable());
        assert!(Fault::locked(LockedReason::ConsumersAttached, "busy").is_retryable());
        assert!(!Fault::not_found("sub").is_retryable());
        assert!(!Fault::invariant("duplicate local stream").is_retryable());
    }

    #[test]
    fn locked_reason_is_exposed() {
        let fault = Fault::locked(LockedReason::UncommittedReceives, "in-doubt receives");
        assert_eq!(
            fault.locked_reason(),
            Some(LockedReason::UncommittedReceives)
        );
        assert_eq!(Fault::mismatch("selector differs").locked_reason(), None);
    }
}
