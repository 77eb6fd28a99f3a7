//! Cache reconciliation core for Kaisha.
//!
//! Merges three independent channels into one view of the company collection:
//!
//! - the authoritative full fetch,
//! - local mutations applied optimistically before the server confirms them,
//! - server-pushed change notifications, which arrive out-of-band and may
//!   echo our own mutations.
//!
//! Everything here is synchronous and sans-IO. The caller feeds events in
//! arrival order through [`ReconcileDriver`] and performs the round trips the
//! driver hands back as [`Dispatch`]es.
//!
//! # Pieces
//!
//! - [`SnapshotStore`]: the reconciled, ordered view
//! - [`OptimisticLedger`]: in-flight mutations with their rollback data
//! - [`NotificationMerger`]: push events, minus echoes of our own mutations
//! - [`ReconcileDriver`]: routes events to the above

mod driver;
mod error;
mod ledger;
mod merger;
mod store;

pub use driver::{
    ConflictPolicy, Dispatch, FetchReport, ReconcileDriver, Requested, ResolveReport,
    SessionState,
};
pub use error::{CacheError, FailureReason};
pub use ledger::{EntryState, LedgerEntry, Mutation, OptimisticLedger, Outcome, Resolution};
pub use merger::{MergeOutcome, NotificationMerger, SkipReason};
pub use store::{SnapshotStore, StoreChange};

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
