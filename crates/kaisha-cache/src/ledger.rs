//! Optimistic ledger: in-flight local mutations and their rollback data.
//!
//! Every local mutation becomes a [`LedgerEntry`] the instant it is issued.
//! The entry records what the store looked like before (`prior`) and what was
//! applied speculatively, so the server's answer can replace the speculation
//! instead of stacking on top of it, and a failure can restore `prior`
//! exactly.
//!
//! # Entry lifecycle
//!
//! ```text
//!   request ──▶ Queued ──(target freed)──▶ Open ──confirm──▶ Confirmed ──▶ discarded
//!      │                                    │
//!      └──────(target free)─────────────────┘──fail──────▶ Failed ────▶ discarded
//! ```
//!
//! At most one entry per target is `Open`. Further mutations on the same
//! target wait in a per-target FIFO until the open one resolves.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use kaisha_types::{Company, CompanyId, MutationKind, OperationId};
use tracing::{debug, info, warn};

use crate::error::{CacheError, FailureReason};
use crate::store::{SnapshotStore, StoreChange};

/// Confirmed deletes remembered so late pushes can't resurrect them.
/// Cleared by every fetch; oldest dropped past this size.
const MAX_TOMBSTONES: usize = 256;

/// A local mutation request, as sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Add { name: String },
    Rename { id: CompanyId, name: String },
    Delete { id: CompanyId },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Add { .. } => MutationKind::Add,
            Mutation::Rename { .. } => MutationKind::Rename,
            Mutation::Delete { .. } => MutationKind::Delete,
        }
    }

    /// The id this mutation targets. Adds have none until they are opened.
    pub fn target(&self) -> Option<CompanyId> {
        match self {
            Mutation::Add { .. } => None,
            Mutation::Rename { id, .. } | Mutation::Delete { id } => Some(*id),
        }
    }

    fn retarget(&mut self, to: CompanyId) {
        match self {
            Mutation::Add { .. } => {}
            Mutation::Rename { id, .. } | Mutation::Delete { id } => *id = to,
        }
    }
}

/// Server answer for an open entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Server accepted. Carries the server's entity for add and rename;
    /// delete confirmations carry `None`.
    Confirmed(Option<Company>),
    /// Round trip failed or server refused.
    Failed(FailureReason),
}

/// Explicit state of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// Speculative delta applied, waiting on the server.
    Open,
    /// Server confirmed; store holds server truth.
    Confirmed,
    /// Rolled back.
    Failed(FailureReason),
}

/// One in-flight mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub operation_id: OperationId,
    pub mutation: Mutation,
    /// Id the speculative delta touched. For adds this is the placeholder.
    pub target: CompanyId,
    /// Entity before the delta, `None` for adds.
    pub prior: Option<Company>,
    /// Position of `prior` in the store, so a delete rollback lands where it was.
    pub prior_index: Option<usize>,
    /// What was applied. `None` for deletes.
    pub speculative: Option<Company>,
    pub state: EntryState,
    /// For adds: the server entity seen on the push channel while in flight.
    pub echo: Option<Company>,
}

impl LedgerEntry {
    pub fn kind(&self) -> MutationKind {
        self.mutation.kind()
    }
}

/// What [`OptimisticLedger::resolve`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The discarded entry, in its final state.
    pub entry: LedgerEntry,
    /// Store effect of the confirm/rollback.
    pub change: StoreChange,
    /// Next queued mutation for the freed target, if any. The caller opens it.
    pub released: Option<(OperationId, Mutation)>,
    /// Queued mutations that can no longer run (their add placeholder rolled back).
    pub cascaded: Vec<(OperationId, FailureReason)>,
}

/// Tracks open and queued mutations.
#[derive(Debug, Clone)]
pub struct OptimisticLedger {
    open: IndexMap<OperationId, LedgerEntry>,
    by_target: HashMap<CompanyId, OperationId>,
    /// Server ids announced for open adds, keyed to the add.
    echo_ids: HashMap<CompanyId, OperationId>,
    queued: HashMap<CompanyId, VecDeque<(OperationId, Mutation)>>,
    tombstones: VecDeque<CompanyId>,
    tombstone_set: HashSet<CompanyId>,
    last_operation: OperationId,
    placeholders_issued: u64,
}

impl Default for OptimisticLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticLedger {
    pub fn new() -> Self {
        Self {
            open: IndexMap::new(),
            by_target: HashMap::new(),
            echo_ids: HashMap::new(),
            queued: HashMap::new(),
            tombstones: VecDeque::new(),
            tombstone_set: HashSet::new(),
            last_operation: OperationId::new(0),
            placeholders_issued: 0,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Allocate the next operation id.
    pub fn next_operation_id(&mut self) -> OperationId {
        self.last_operation = self.last_operation.next();
        self.last_operation
    }

    /// True when an open entry touches `id`.
    pub fn is_guarded(&self, id: CompanyId) -> bool {
        self.by_target.contains_key(&id)
    }

    /// The open entry touching `id`.
    pub fn entry_for(&self, id: CompanyId) -> Option<&LedgerEntry> {
        self.by_target.get(&id).and_then(|op| self.open.get(op))
    }

    /// The open add whose echo announced server id `id`.
    pub fn entry_for_echo(&self, id: CompanyId) -> Option<&LedgerEntry> {
        self.echo_ids.get(&id).and_then(|op| self.open.get(op))
    }

    /// Server ids of open adds whose echo has been seen.
    pub fn echo_ids(&self) -> impl Iterator<Item = CompanyId> + '_ {
        self.echo_ids.keys().copied()
    }

    pub fn entry(&self, operation_id: OperationId) -> Option<&LedgerEntry> {
        self.open.get(&operation_id)
    }

    /// Open entries in the order they were opened.
    pub fn open_entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.open.values()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.queued.is_empty()
    }

    /// A delete of `id` was confirmed since the last fetch.
    pub fn is_tombstoned(&self, id: CompanyId) -> bool {
        self.tombstone_set.contains(&id)
    }

    // =========================================================================
    // Open / queue
    // =========================================================================

    /// Apply `mutation` to the store speculatively and record the entry.
    ///
    /// The target must not be guarded; park the mutation with
    /// [`enqueue`](Self::enqueue) instead. Renames and deletes of an id the
    /// store doesn't hold fail with [`CacheError::UnknownTarget`] and leave
    /// no entry behind.
    pub fn begin(
        &mut self,
        store: &mut SnapshotStore,
        operation_id: OperationId,
        mutation: Mutation,
    ) -> Result<OperationId, CacheError> {
        if let Some(target) = mutation.target() {
            if self.is_guarded(target) {
                return Err(CacheError::TargetBusy(target));
            }
        }

        let entry = match &mutation {
            Mutation::Add { name } => {
                self.placeholders_issued += 1;
                let placeholder = CompanyId::placeholder(self.placeholders_issued);
                let speculative = Company::new(placeholder, name.clone());
                store.upsert(speculative.clone());
                LedgerEntry {
                    operation_id,
                    mutation: mutation.clone(),
                    target: placeholder,
                    prior: None,
                    prior_index: None,
                    speculative: Some(speculative),
                    state: EntryState::Open,
                    echo: None,
                }
            }
            Mutation::Rename { id, name } => {
                let prior = store.get(*id).cloned().ok_or(CacheError::UnknownTarget(*id))?;
                let speculative = prior.renamed(name.clone());
                store.upsert(speculative.clone());
                LedgerEntry {
                    operation_id,
                    target: *id,
                    prior_index: store.position(*id),
                    prior: Some(prior),
                    speculative: Some(speculative),
                    mutation: mutation.clone(),
                    state: EntryState::Open,
                    echo: None,
                }
            }
            Mutation::Delete { id } => {
                let prior_index = store.position(*id).ok_or(CacheError::UnknownTarget(*id))?;
                let prior = store.remove(*id);
                LedgerEntry {
                    operation_id,
                    target: *id,
                    prior,
                    prior_index: Some(prior_index),
                    speculative: None,
                    mutation: mutation.clone(),
                    state: EntryState::Open,
                    echo: None,
                }
            }
        };

        debug!(
            "ledger: open {} {} on {:?} (prior={:?}, speculative={:?})",
            operation_id,
            entry.kind(),
            entry.target,
            entry.prior.as_ref().map(|c| c.name.as_str()),
            entry.speculative.as_ref().map(|c| c.name.as_str()),
        );
        self.by_target.insert(entry.target, operation_id);
        self.open.insert(operation_id, entry);
        Ok(operation_id)
    }

    /// Park a mutation behind the open entry on its target.
    pub fn enqueue(&mut self, operation_id: OperationId, mutation: Mutation) {
        let Some(target) = mutation.target() else {
            warn!("ledger: refusing to queue {} with no target", operation_id);
            return;
        };
        debug!("ledger: queue {} {} behind open entry on {:?}", operation_id, mutation.kind(), target);
        self.queued.entry(target).or_default().push_back((operation_id, mutation));
    }

    // =========================================================================
    // Resolve
    // =========================================================================

    /// Apply the server's answer for an open entry and discard it.
    pub fn resolve(
        &mut self,
        store: &mut SnapshotStore,
        operation_id: OperationId,
        outcome: Outcome,
    ) -> Result<Resolution, CacheError> {
        let mut entry = self
            .open
            .shift_remove(&operation_id)
            .ok_or(CacheError::UnknownOperation(operation_id))?;
        self.by_target.remove(&entry.target);
        if let Some(echo) = &entry.echo {
            self.echo_ids.remove(&echo.id);
        }

        let mut cascaded = Vec::new();
        // Where queued work for this target lives from now on.
        let mut freed_target = Some(entry.target);

        let change = match (outcome, entry.kind()) {
            (Outcome::Confirmed(Some(server)), MutationKind::Add) => {
                info!("ledger: {} add confirmed as {:?}", operation_id, server.id);
                // A push seen since the echo is newer than the response.
                let server = match entry.echo.clone() {
                    Some(echo) if echo.id == server.id => echo,
                    _ => server,
                };
                let change = store.replace_id(entry.target, server.clone());
                self.move_queue(entry.target, server.id);
                freed_target = Some(server.id);
                entry.state = EntryState::Confirmed;
                entry.speculative = Some(server);
                change
            }
            (Outcome::Confirmed(None), MutationKind::Add) => {
                warn!("ledger: {} add confirmed without an entity, rolling back", operation_id);
                let reason = FailureReason::Conflict("add confirmed without an entity".into());
                self.roll_back(store, &mut entry, reason, &mut freed_target, &mut cascaded)
            }
            (Outcome::Confirmed(server), MutationKind::Rename) => {
                let value = server.or_else(|| entry.speculative.clone());
                entry.state = EntryState::Confirmed;
                match value {
                    Some(value) => {
                        info!("ledger: {} rename of {:?} confirmed as {:?}", operation_id, value.id, value.name);
                        store.upsert(value)
                    }
                    None => StoreChange::Unchanged,
                }
            }
            (Outcome::Confirmed(_), MutationKind::Delete) => {
                info!("ledger: {} delete of {:?} confirmed", operation_id, entry.target);
                self.tombstone(entry.target);
                entry.state = EntryState::Confirmed;
                StoreChange::Unchanged
            }
            (Outcome::Failed(reason), _) => {
                self.roll_back(store, &mut entry, reason, &mut freed_target, &mut cascaded)
            }
        };

        let released = freed_target.and_then(|target| self.take_queued(target));

        Ok(Resolution {
            entry,
            change,
            released,
            cascaded,
        })
    }

    fn roll_back(
        &mut self,
        store: &mut SnapshotStore,
        entry: &mut LedgerEntry,
        reason: FailureReason,
        freed_target: &mut Option<CompanyId>,
        cascaded: &mut Vec<(OperationId, FailureReason)>,
    ) -> StoreChange {
        warn!(
            "ledger: {} {} on {:?} failed ({}), rolling back",
            entry.operation_id,
            entry.kind(),
            entry.target,
            reason
        );
        let change = match entry.kind() {
            MutationKind::Add => match entry.echo.clone() {
                // The server announced the entity, so it exists regardless
                // of what the response said.
                Some(echo) => {
                    self.move_queue(entry.target, echo.id);
                    *freed_target = Some(echo.id);
                    store.replace_id(entry.target, echo)
                }
                None => {
                    *freed_target = None;
                    if let Some(queue) = self.queued.remove(&entry.target) {
                        cascaded.extend(
                            queue.into_iter().map(|(op, _)| (op, FailureReason::TargetRolledBack)),
                        );
                    }
                    match store.remove(entry.target) {
                        Some(_) => StoreChange::Replaced,
                        None => StoreChange::Unchanged,
                    }
                }
            },
            MutationKind::Rename => match entry.prior.clone() {
                Some(prior) => store.upsert(prior),
                // Rebased to absent: the entity is gone server-side.
                None => match store.remove(entry.target) {
                    Some(_) => StoreChange::Replaced,
                    None => StoreChange::Unchanged,
                },
            },
            MutationKind::Delete => match entry.prior.clone() {
                Some(prior) => store.insert_at(entry.prior_index.unwrap_or(usize::MAX), prior),
                None => StoreChange::Unchanged,
            },
        };
        entry.state = EntryState::Failed(reason);
        change
    }

    // =========================================================================
    // Adjustments from other channels
    // =========================================================================

    /// Replace the rollback value of the open entry on `id`.
    ///
    /// Called when a push or fetch moves the server's state for a guarded id
    /// forward, so a later rollback restores that newer state instead of the
    /// one captured at `begin`. Adds are not rebased.
    pub fn rebase_prior(&mut self, id: CompanyId, value: Option<Company>) -> bool {
        let Some(op) = self.by_target.get(&id) else {
            return false;
        };
        let Some(entry) = self.open.get_mut(op) else {
            return false;
        };
        if entry.kind() == MutationKind::Add {
            return false;
        }
        debug!("ledger: rebase prior of {} on {:?} to {:?}", entry.operation_id, id, value.as_ref().map(|c| &c.name));
        entry.prior = value;
        true
    }

    /// Find an open add whose speculative name matches and that hasn't seen
    /// its echo yet; remember `company` as that echo.
    pub fn match_add_echo(&mut self, company: &Company) -> Option<OperationId> {
        let entry = self.open.values_mut().find(|e| {
            e.kind() == MutationKind::Add
                && e.echo.is_none()
                && e.speculative.as_ref().is_some_and(|s| s.name == company.name)
        })?;
        entry.echo = Some(company.clone());
        self.echo_ids.insert(company.id, entry.operation_id);
        Some(entry.operation_id)
    }

    /// Move the remembered echo of the open add that announced `id` to
    /// `value`, and show its name on the placeholder. `None` forgets the echo.
    pub fn rebase_echo(
        &mut self,
        store: &mut SnapshotStore,
        id: CompanyId,
        value: Option<Company>,
    ) -> StoreChange {
        let Some(op) = self.echo_ids.get(&id).copied() else {
            return StoreChange::Unchanged;
        };
        let Some(entry) = self.open.get_mut(&op) else {
            return StoreChange::Unchanged;
        };
        debug!("ledger: rebase echo of {} on {:?} to {:?}", op, id, value.as_ref().map(|c| &c.name));
        match value {
            Some(value) => {
                let change = store.upsert(Company::new(entry.target, value.name.clone()));
                entry.echo = Some(value);
                change
            }
            None => {
                entry.echo = None;
                self.echo_ids.remove(&id);
                StoreChange::Unchanged
            }
        }
    }

    /// Forget confirmed deletes; the fetch that triggers this is authoritative.
    pub fn clear_tombstones(&mut self) {
        self.tombstones.clear();
        self.tombstone_set.clear();
    }

    /// Drop all open and queued work. Used on teardown.
    pub fn clear(&mut self) -> Vec<OperationId> {
        let mut dropped: Vec<OperationId> = self.open.keys().copied().collect();
        dropped.extend(self.queued.values().flatten().map(|(op, _)| *op));
        self.open.clear();
        self.by_target.clear();
        self.echo_ids.clear();
        self.queued.clear();
        self.clear_tombstones();
        dropped
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    /// Take the next queued mutation for `target`, if any.
    pub fn take_queued(&mut self, target: CompanyId) -> Option<(OperationId, Mutation)> {
        let queue = self.queued.get_mut(&target)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.queued.remove(&target);
        }
        next
    }

    fn move_queue(&mut self, from: CompanyId, to: CompanyId) {
        if from == to {
            return;
        }
        if let Some(queue) = self.queued.remove(&from) {
            debug!("ledger: retarget {} queued mutations {:?} -> {:?}", queue.len(), from, to);
            let dest = self.queued.entry(to).or_default();
            dest.extend(queue.into_iter().map(|(op, mut m)| {
                m.retarget(to);
                (op, m)
            }));
        }
    }

    fn tombstone(&mut self, id: CompanyId) {
        if !self.tombstone_set.insert(id) {
            return;
        }
        self.tombstones.push_back(id);
        if self.tombstones.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.tombstones.pop_front() {
                self.tombstone_set.remove(&oldest);
            }
        }
    }
}
