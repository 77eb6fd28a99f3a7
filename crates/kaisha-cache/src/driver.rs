//! Reconciliation driver: the single entry point for every inbound event.
//!
//! The driver owns the store, ledger, and merger, and decides which of them an
//! event goes to. It is sans-IO: when a mutation needs a round trip the
//! driver returns a [`Dispatch`], and the caller feeds the server's answer
//! back through [`ReconcileDriver::resolve`].
//!
//! # State Machine
//!
//! ```text
//! +----------------+
//! | Uninitialized  | pushes merge into the empty store, mutations rejected
//! +-------+--------+
//!         | apply_fetch()
//!         v
//! +----------------+
//! |      Live      | mutations, pushes, resolutions, later fetches
//! +-------+--------+
//!         | close()
//!         v
//! +----------------+
//! |     Closed     | everything is a no-op
//! +----------------+
//! ```

use std::collections::HashSet;

use kaisha_types::{Company, CompanyId, OperationId, PushEvent, validate_id, validate_name};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CacheError, FailureReason};
use crate::ledger::{EntryState, LedgerEntry, Mutation, OptimisticLedger, Outcome};
use crate::merger::{MergeOutcome, NotificationMerger, SkipReason};
use crate::store::SnapshotStore;

/// What to do with a mutation whose target already has one in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Wait until the open entry resolves, then apply.
    #[default]
    Queue,
    /// Fail fast with [`CacheError::TargetBusy`].
    Reject,
}

/// Lifecycle of a session's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Live,
    Closed,
}

/// A mutation the caller must send to the server now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub operation_id: OperationId,
    pub mutation: Mutation,
}

/// Result of a `request_*` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requested {
    pub operation_id: OperationId,
    /// `Some` when the delta was applied and the round trip should start.
    /// `None` when the mutation is queued behind another on the same target.
    pub dispatch: Option<Dispatch>,
}

/// Result of [`ReconcileDriver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolveReport {
    /// The resolved entry. `None` when the session was already closed.
    pub entry: Option<LedgerEntry>,
    /// Queued mutations that were opened as a consequence; send these now.
    pub dispatches: Vec<Dispatch>,
    /// Mutations that failed without a round trip (queued behind a rollback,
    /// or their target disappeared while they waited).
    pub failures: Vec<(OperationId, FailureReason)>,
    /// The store changed.
    pub changed: bool,
}

/// Result of [`ReconcileDriver::apply_fetch`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchReport {
    /// Ids removed because the fetch no longer lists them.
    pub removed: usize,
    /// Ids kept at their speculative value because a mutation is in flight.
    pub guarded: usize,
    pub changed: bool,
}

/// Routes fetch results, local mutations, resolutions, and pushes.
#[derive(Debug, Clone)]
pub struct ReconcileDriver {
    state: SessionState,
    policy: ConflictPolicy,
    store: SnapshotStore,
    ledger: OptimisticLedger,
    merger: NotificationMerger,
}

impl Default for ReconcileDriver {
    fn default() -> Self {
        Self::new(ConflictPolicy::default())
    }
}

impl ReconcileDriver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            state: SessionState::Uninitialized,
            policy,
            store: SnapshotStore::new(),
            ledger: OptimisticLedger::new(),
            merger: NotificationMerger::new(),
        }
    }

    // =========================================================================
    // Read surface
    // =========================================================================

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Current reconciled view, in order.
    pub fn companies(&self) -> Vec<Company> {
        self.store.all()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn ledger(&self) -> &OptimisticLedger {
        &self.ledger
    }

    pub fn merger(&self) -> &NotificationMerger {
        &self.merger
    }

    /// Store version; changes whenever the view does.
    pub fn version(&self) -> u64 {
        self.store.version()
    }

    // =========================================================================
    // Fetch channel
    // =========================================================================

    /// Apply an authoritative full-collection result.
    ///
    /// Unguarded ids take the fetched value; known ids keep their position,
    /// vanished ids are dropped, new ids are appended in fetch order. Ids with
    /// an open mutation keep what the mutation applied, and the fetched value
    /// becomes that mutation's rollback target.
    pub fn apply_fetch(&mut self, companies: Vec<Company>) -> FetchReport {
        if self.state == SessionState::Closed {
            debug!("driver: fetch after close ignored");
            return FetchReport::default();
        }

        let before = self.store.version();
        let mut seen = HashSet::with_capacity(companies.len());
        let mut fetched = Vec::with_capacity(companies.len());
        for company in companies {
            if seen.insert(company.id) {
                fetched.push(company);
            } else {
                warn!("driver: fetch listed {:?} twice, keeping the first", company.id);
            }
        }

        let mut guarded: HashSet<CompanyId> = self.ledger.open_entries().map(|e| e.target).collect();
        for id in &guarded {
            let server_value = fetched.iter().find(|c| c.id == *id).cloned();
            self.ledger.rebase_prior(*id, server_value);
        }
        // Server ids of open adds show through their placeholder.
        let echoes: Vec<CompanyId> = self.ledger.echo_ids().collect();
        for id in echoes {
            let server_value = fetched.iter().find(|c| c.id == id).cloned();
            self.ledger.rebase_echo(&mut self.store, id, server_value);
            guarded.insert(id);
        }

        let removed = self.store.retain(|c| seen.contains(&c.id) || guarded.contains(&c.id));
        for company in fetched {
            if guarded.contains(&company.id) {
                continue;
            }
            if !self.store.contains(company.id) && self.ledger.match_add_echo(&company).is_some() {
                debug!("driver: fetch listed {:?}, the server side of an open add", company.id);
                continue;
            }
            self.store.upsert(company);
        }
        self.ledger.clear_tombstones();

        if self.state == SessionState::Uninitialized {
            info!("driver: live with {} companies", self.store.len());
            self.state = SessionState::Live;
        } else {
            debug!("driver: fetch merged, {} companies, {} removed, {} guarded", self.store.len(), removed, guarded.len());
        }

        FetchReport {
            removed,
            guarded: guarded.len(),
            changed: self.store.version() != before,
        }
    }

    // =========================================================================
    // Local mutations
    // =========================================================================

    /// Add a company. Appears immediately under a placeholder id.
    pub fn request_add(&mut self, name: &str) -> Result<Requested, CacheError> {
        self.check_live()?;
        validate_name(name)?;
        self.request(Mutation::Add { name: name.to_string() })
    }

    /// Rename a company. Visible immediately.
    pub fn request_rename(&mut self, id: CompanyId, name: &str) -> Result<Requested, CacheError> {
        self.check_live()?;
        validate_id(id, self.ledger.is_guarded(id))?;
        validate_name(name)?;
        self.request(Mutation::Rename { id, name: name.to_string() })
    }

    /// Delete a company. Gone from the view immediately.
    pub fn request_delete(&mut self, id: CompanyId) -> Result<Requested, CacheError> {
        self.check_live()?;
        validate_id(id, self.ledger.is_guarded(id))?;
        self.request(Mutation::Delete { id })
    }

    fn request(&mut self, mutation: Mutation) -> Result<Requested, CacheError> {
        if let Some(target) = mutation.target() {
            if self.ledger.is_guarded(target) {
                return match self.policy {
                    ConflictPolicy::Reject => Err(CacheError::TargetBusy(target)),
                    ConflictPolicy::Queue => {
                        let operation_id = self.ledger.next_operation_id();
                        self.ledger.enqueue(operation_id, mutation);
                        Ok(Requested { operation_id, dispatch: None })
                    }
                };
            }
            if !self.store.contains(target) {
                return Err(CacheError::UnknownTarget(target));
            }
        }

        let operation_id = self.ledger.next_operation_id();
        self.ledger.begin(&mut self.store, operation_id, mutation.clone())?;
        Ok(Requested {
            operation_id,
            dispatch: Some(Dispatch { operation_id, mutation }),
        })
    }

    /// Feed the server's answer for a dispatched mutation.
    ///
    /// After [`close`](Self::close) this is a no-op, so round trips that
    /// complete after teardown can resolve safely.
    pub fn resolve(
        &mut self,
        operation_id: OperationId,
        outcome: Outcome,
    ) -> Result<ResolveReport, CacheError> {
        if self.state == SessionState::Closed {
            debug!("driver: resolution of {} after close ignored", operation_id);
            return Ok(ResolveReport::default());
        }

        let before = self.store.version();
        let resolution = self.ledger.resolve(&mut self.store, operation_id, outcome)?;

        let mut report = ResolveReport {
            failures: resolution.cascaded,
            ..ResolveReport::default()
        };

        // Open the next queued mutation for the freed target. If its target is
        // gone by now it fails on the spot and the one after it gets a turn.
        let mut released = resolution.released;
        while let Some((queued_op, mutation)) = released.take() {
            let target = mutation.target();
            match self.ledger.begin(&mut self.store, queued_op, mutation.clone()) {
                Ok(_) => {
                    report.dispatches.push(Dispatch { operation_id: queued_op, mutation });
                }
                Err(e) => {
                    warn!("driver: queued {} can't start: {}", queued_op, e);
                    report.failures.push((queued_op, FailureReason::Conflict(e.to_string())));
                    // Nothing was opened, so the target is still free.
                    released = target.and_then(|t| self.ledger.take_queued(t));
                }
            }
        }

        report.entry = Some(resolution.entry);
        report.changed = self.store.version() != before;
        Ok(report)
    }

    // =========================================================================
    // Push channel
    // =========================================================================

    /// Merge a server-pushed event, in arrival order.
    pub fn apply_push(&mut self, event: &PushEvent) -> MergeOutcome {
        if self.state == SessionState::Closed {
            return MergeOutcome::Skipped { reason: SkipReason::SessionClosed };
        }
        self.merger.apply(&mut self.store, &mut self.ledger, event)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Stop accepting events. Returns operations that were still open or
    /// queued; their eventual resolutions will be ignored.
    pub fn close(&mut self) -> Vec<OperationId> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        self.state = SessionState::Closed;
        let abandoned = self.ledger.clear();
        info!("driver: closed with {} operations in flight", abandoned.len());
        abandoned
    }

    fn check_live(&self) -> Result<(), CacheError> {
        match self.state {
            SessionState::Live => Ok(()),
            SessionState::Uninitialized => Err(CacheError::NotLive),
            SessionState::Closed => Err(CacheError::Closed),
        }
    }
}

impl ResolveReport {
    /// The resolved entry's final state, if any.
    pub fn state(&self) -> Option<&EntryState> {
        self.entry.as_ref().map(|e| &e.state)
    }
}
