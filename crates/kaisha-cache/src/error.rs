//! Error types for the reconciliation core.

use kaisha_types::{CompanyId, OperationId, ValidationError};
use thiserror::Error;

/// Errors returned synchronously by the driver and ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// No fetch result has been applied yet.
    #[error("collection not loaded yet")]
    NotLive,

    /// The session was torn down.
    #[error("session closed")]
    Closed,

    /// Another mutation on this company is in flight and the policy is reject.
    #[error("company {0} already has a mutation in flight")]
    TargetBusy(CompanyId),

    /// Rename or delete of a company this client doesn't know.
    #[error("company {0} not found")]
    UnknownTarget(CompanyId),

    /// Resolution for an operation that isn't live.
    #[error("no live operation {0}")]
    UnknownOperation(OperationId),

    /// Malformed input, rejected before the ledger saw it.
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
}

/// Why a mutation failed. Every failure rolls back its optimistic delta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The round trip never completed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server refused the change (e.g. id not found).
    #[error("rejected by server: {0}")]
    Conflict(String),

    /// The mutation targeted an add placeholder and that add failed.
    #[error("target was an add that rolled back")]
    TargetRolledBack,
}
