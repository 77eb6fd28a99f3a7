//! Push-event merging.
//!
//! The server pushes `companyAdded` and `companyNameChanged` to every
//! subscriber, including the client whose mutation caused them. The push
//! carries no correlation id, so an echo of our own in-flight mutation is
//! recognised by value: the event's resulting entity equals what the open
//! ledger entry already applied.
//!
//! # Decision table
//!
//! | Situation                                         | Action                          |
//! |---------------------------------------------------|---------------------------------|
//! | id guarded, speculative == event value            | drop (echo)                     |
//! | id guarded by a delete                            | rebase prior, stay hidden       |
//! | id guarded, different value                       | rebase prior, upsert            |
//! | id announced for an open add, same value          | drop (echo)                     |
//! | id announced for an open add, different value     | rebase echo, rename placeholder |
//! | add event, unknown id, open add with same name    | drop (echo), remember on entry  |
//! | rename event, id deleted and confirmed            | drop (tombstoned)               |
//! | store already holds the event value               | drop (already reflected)        |
//! | anything else                                     | upsert                          |
//!
//! Events are applied in arrival order. Nothing is buffered.

use kaisha_types::{Company, MutationKind, OperationId, PushEvent};
use tracing::{debug, trace};

use crate::ledger::OptimisticLedger;
use crate::store::{SnapshotStore, StoreChange};

/// Result of merging one push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Event applied to the store.
    Applied(StoreChange),
    /// Event dropped (see reason).
    Skipped { reason: SkipReason },
}

impl MergeOutcome {
    pub fn changed_store(&self) -> bool {
        matches!(self, MergeOutcome::Applied(change) if change.is_change())
    }
}

/// Why a push event was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Network echo of the given in-flight local mutation.
    Echo(OperationId),
    /// The store already shows exactly this value.
    AlreadyReflected,
    /// The entity was deleted by a confirmed local delete.
    Tombstoned,
    /// A local delete of this entity is in flight.
    PendingDelete(OperationId),
    /// The session is closed.
    SessionClosed,
}

/// Applies push events to the store, gated by the ledger.
#[derive(Debug, Clone, Default)]
pub struct NotificationMerger {
    applied: u64,
    suppressed: u64,
}

impl NotificationMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events that reached the store.
    pub fn applied_count(&self) -> u64 {
        self.applied
    }

    /// Events dropped by the gate.
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed
    }

    /// Merge one event.
    pub fn apply(
        &mut self,
        store: &mut SnapshotStore,
        ledger: &mut OptimisticLedger,
        event: &PushEvent,
    ) -> MergeOutcome {
        let outcome = self.decide(store, ledger, event);
        match &outcome {
            MergeOutcome::Applied(change) => {
                self.applied += 1;
                trace!("merge: applied {:?} ({:?})", event, change);
            }
            MergeOutcome::Skipped { reason } => {
                self.suppressed += 1;
                debug!("merge: dropped {:?}: {:?}", event, reason);
            }
        }
        outcome
    }

    fn decide(
        &mut self,
        store: &mut SnapshotStore,
        ledger: &mut OptimisticLedger,
        event: &PushEvent,
    ) -> MergeOutcome {
        let id = event.company_id();
        let value = event.resulting_value();

        if let Some(entry) = ledger.entry_for(id) {
            let operation_id = entry.operation_id;
            if entry.speculative.as_ref() == Some(&value) {
                return MergeOutcome::Skipped { reason: SkipReason::Echo(operation_id) };
            }
            let pending_delete = entry.kind() == MutationKind::Delete;
            // The server moved on; a rollback must land on this value.
            ledger.rebase_prior(id, Some(value.clone()));
            if pending_delete {
                return MergeOutcome::Skipped { reason: SkipReason::PendingDelete(operation_id) };
            }
            return Self::upsert(store, value);
        }

        // The open add's placeholder stands in for this id until it resolves.
        if let Some(entry) = ledger.entry_for_echo(id) {
            let operation_id = entry.operation_id;
            if entry.echo.as_ref() == Some(&value) {
                return MergeOutcome::Skipped { reason: SkipReason::Echo(operation_id) };
            }
            return match ledger.rebase_echo(store, id, Some(value)) {
                StoreChange::Unchanged => MergeOutcome::Skipped { reason: SkipReason::AlreadyReflected },
                change => MergeOutcome::Applied(change),
            };
        }

        match event {
            PushEvent::CompanyAdded { company } if !store.contains(id) => {
                if let Some(op) = ledger.match_add_echo(company) {
                    return MergeOutcome::Skipped { reason: SkipReason::Echo(op) };
                }
            }
            PushEvent::CompanyRenamed { .. } if ledger.is_tombstoned(id) => {
                return MergeOutcome::Skipped { reason: SkipReason::Tombstoned };
            }
            _ => {}
        }

        Self::upsert(store, value)
    }

    fn upsert(store: &mut SnapshotStore, value: Company) -> MergeOutcome {
        match store.upsert(value) {
            StoreChange::Unchanged => MergeOutcome::Skipped { reason: SkipReason::AlreadyReflected },
            change => MergeOutcome::Applied(change),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::ledger::{Mutation, Outcome};
    use kaisha_types::CompanyId;

    fn renamed(id: i64, name: &str) -> PushEvent {
        PushEvent::CompanyRenamed { id: CompanyId::new(id), name: name.into() }
    }

    fn added(id: i64, name: &str) -> PushEvent {
        PushEvent::CompanyAdded { company: Company::new(id, name) }
    }

    struct Fixture {
        store: SnapshotStore,
        ledger: OptimisticLedger,
        merger: NotificationMerger,
    }

    impl Fixture {
        fn new(companies: &[(i64, &str)]) -> Self {
            Self {
                store: SnapshotStore::from_companies(companies.iter().map(|(i, n)| Company::new(*i, *n))),
                ledger: OptimisticLedger::new(),
                merger: NotificationMerger::new(),
            }
        }

        fn begin(&mut self, m: Mutation) -> OperationId {
            let op = self.ledger.next_operation_id();
            self.ledger.begin(&mut self.store, op, m).expect("begin")
        }

        fn push(&mut self, ev: PushEvent) -> MergeOutcome {
            self.merger.apply(&mut self.store, &mut self.ledger, &ev)
        }

        fn name(&self, id: i64) -> Option<&str> {
            self.store.get(CompanyId::new(id)).map(|c| c.name.as_str())
        }
    }

    #[test]
    fn test_rename_without_entry_always_applies() {
        let mut fx = Fixture::new(&[(1, "Acme")]);
        let out = fx.push(renamed(1, "Acme Corp"));
        assert_eq!(out, MergeOutcome::Applied(StoreChange::Replaced));
        assert_eq!(fx.name(1), Some("Acme Corp"));
    }

    #[test]
    fn test_rename_of_unknown_id_appends() {
        let mut fx = Fixture::new(&[(1, "Acme")]);
        let out = fx.push(renamed(4, "Hooli"));
        assert_eq!(out, MergeOutcome::Applied(StoreChange::Inserted));
        assert_eq!(fx.store.len(), 2);
    }

    #[test]
    fn test_echo_of_inflight_rename_dropped_every_time() {
        let mut fx = Fixture::new(&[(1, "Acme")]);
        let op = fx.begin(Mutation::Rename { id: CompanyId::new(1), name: "Acme Corp".into() });

        let v = fx.store.version();
        assert_eq!(fx.push(renamed(1, "Acme Corp")), MergeOutcome::Skipped { reason: SkipReason::Echo(op) });
        assert_eq!(fx.push(renamed(1, "Acme Corp")), MergeOutcome::Skipped { reason: SkipReason::Echo(op) });
        assert_eq!(fx.store.version(), v);
        assert_eq!(fx.merger.suppressed_count(), 2);
    }

    #[test]
    fn test_foreign_rename_of_guarded_id_applies_and_rebases() {
        let mut fx = Fixture::new(&[(1, "Acme")]);
        let op = fx.begin(Mutation::Rename { id: CompanyId::new(1), name: "Mine".into() });

        let out = fx.push(renamed(1, "Theirs"));
        assert_eq!(out, MergeOutcome::Applied(StoreChange::Replaced));
        assert_eq!(fx.name(1), Some("Theirs"));

        fx.ledger
            .resolve(&mut fx.store, op, Outcome::Failed(FailureReason::Conflict("x".into())))
            .unwrap();
        assert_eq!(fx.name(1), Some("Theirs"));
    }

    #[test]
    fn test_rename_during_pending_delete_stays_hidden() {
        let mut fx = Fixture::new(&[(7, "Initech")]);
        let op = fx.begin(Mutation::Delete { id: CompanyId::new(7) });

        let out = fx.push(renamed(7, "Initrode"));
        assert_eq!(out, MergeOutcome::Skipped { reason: SkipReason::PendingDelete(op) });
        assert_eq!(fx.name(7), None);

        fx.ledger
            .resolve(&mut fx.store, op, Outcome::Failed(FailureReason::Transport("x".into())))
            .unwrap();
        assert_eq!(fx.name(7), Some("Initrode"));
    }

    #[test]
    fn test_rename_of_tombstoned_id_dropped() {
        let mut fx = Fixture::new(&[(7, "Initech")]);
        let op = fx.begin(Mutation::Delete { id: CompanyId::new(7) });
        fx.ledger.resolve(&mut fx.store, op, Outcome::Confirmed(None)).unwrap();

        assert_eq!(fx.push(renamed(7, "Ghost")), MergeOutcome::Skipped { reason: SkipReason::Tombstoned });
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_add_echo_suppressed_then_confirm_has_no_duplicate() {
        let mut fx = Fixture::new(&[(1, "Acme")]);
        let op = fx.begin(Mutation::Add { name: "Globex".into() });

        assert_eq!(fx.push(added(5, "Globex")), MergeOutcome::Skipped { reason: SkipReason::Echo(op) });
        assert_eq!(fx.store.len(), 2);

        fx.ledger
            .resolve(&mut fx.store, op, Outcome::Confirmed(Some(Company::new(5, "Globex"))))
            .unwrap();
        assert_eq!(fx.store.all(), vec![Company::new(1, "Acme"), Company::new(5, "Globex")]);
    }

    #[test]
    fn test_duplicate_add_echo_dropped_every_time() {
        let mut fx = Fixture::new(&[(1, "Acme")]);
        let op = fx.begin(Mutation::Add { name: "Globex".into() });

        assert_eq!(fx.push(added(5, "Globex")), MergeOutcome::Skipped { reason: SkipReason::Echo(op) });
        assert_eq!(fx.push(added(5, "Globex")), MergeOutcome::Skipped { reason: SkipReason::Echo(op) });
        assert_eq!(fx.store.len(), 2);
        assert!(!fx.store.contains(CompanyId::new(5)));
    }

    #[test]
    fn test_foreign_rename_of_echoed_add_renames_placeholder() {
        let mut fx = Fixture::new(&[(1, "Acme")]);
        let op = fx.begin(Mutation::Add { name: "Globex".into() });
        let placeholder = fx.ledger.entry(op).unwrap().target;
        fx.push(added(5, "Globex"));

        let out = fx.push(renamed(5, "Globex Intl"));
        assert_eq!(out, MergeOutcome::Applied(StoreChange::Replaced));
        assert_eq!(fx.store.len(), 2);
        assert_eq!(fx.store.get(placeholder).unwrap().name, "Globex Intl");

        // The older add response does not undo the rename.
        fx.ledger
            .resolve(&mut fx.store, op, Outcome::Confirmed(Some(Company::new(5, "Globex"))))
            .unwrap();
        assert_eq!(fx.store.all(), vec![Company::new(1, "Acme"), Company::new(5, "Globex Intl")]);
    }

    #[test]
    fn test_late_echo_after_confirm_is_already_reflected() {
        let mut fx = Fixture::new(&[(1, "Acme")]);
        let op = fx.begin(Mutation::Rename { id: CompanyId::new(1), name: "Acme Corp".into() });
        fx.ledger
            .resolve(&mut fx.store, op, Outcome::Confirmed(Some(Company::new(1, "Acme Corp"))))
            .unwrap();

        assert_eq!(fx.push(renamed(1, "Acme Corp")), MergeOutcome::Skipped { reason: SkipReason::AlreadyReflected });
    }

    #[test]
    fn test_foreign_add_applies() {
        let mut fx = Fixture::new(&[(1, "Acme")]);
        let out = fx.push(added(2, "Globex"));
        assert!(out.changed_store());
        assert_eq!(fx.store.len(), 2);
        assert_eq!(fx.merger.applied_count(), 1);
    }
}
