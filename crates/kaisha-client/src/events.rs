//! Session events published to presentation and other observers.
//!
//! Subscribe via [`SessionHandle::subscribe()`](crate::SessionHandle::subscribe).
//! Every event is sent after the store change it describes, so a subscriber
//! that reads `companies()` on receipt sees that change or a later one.

use kaisha_cache::{FailureReason, SessionState};
use kaisha_types::{MutationKind, OperationId};

/// Something observable happened in the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// First fetch applied; the view is live.
    Live { companies: usize },
    /// The view changed. Re-render.
    CollectionChanged { version: u64 },
    /// The server confirmed a local mutation.
    MutationConfirmed {
        operation_id: OperationId,
        kind: MutationKind,
    },
    /// A local mutation failed and was rolled back. No retry is attempted.
    MutationFailed {
        operation_id: OperationId,
        reason: FailureReason,
    },
    /// A fetch failed; the view keeps its last state.
    FetchFailed { error: String },
    /// Push events were dropped by the channel; a refetch was started.
    PushLagged { missed: u64 },
    /// The session was torn down.
    Closed,
}

impl SessionEvent {
    /// The operation this event resolves, if any.
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            SessionEvent::MutationConfirmed { operation_id, .. }
            | SessionEvent::MutationFailed { operation_id, .. } => Some(*operation_id),
            _ => None,
        }
    }
}

/// Point-in-time counters for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub version: u64,
    pub companies: usize,
    pub open_mutations: usize,
    pub queued_mutations: usize,
    pub pushes_applied: u64,
    pub pushes_suppressed: u64,
}

impl SessionStatus {
    /// No mutation is open or queued.
    pub fn is_settled(&self) -> bool {
        self.open_mutations == 0 && self.queued_mutations == 0
    }
}
