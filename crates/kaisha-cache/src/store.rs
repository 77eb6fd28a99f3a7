//! The reconciled collection view.
//!
//! An insertion-ordered map keyed by id, so uniqueness holds by construction
//! and replacing an entity keeps its position. The store never talks to the
//! network and never fails; callers validate input before it gets here.

use indexmap::IndexMap;
use kaisha_types::{Company, CompanyId};
use tracing::trace;

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    /// New id, appended (or placed at an explicit position).
    Inserted,
    /// Existing id, value changed in place.
    Replaced,
    /// Existing id, identical value. Version not bumped.
    Unchanged,
}

impl StoreChange {
    pub fn is_change(&self) -> bool {
        !matches!(self, StoreChange::Unchanged)
    }
}

/// Ordered, id-unique snapshot of the collection.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    companies: IndexMap<CompanyId, Company>,
    /// Bumped on every effective change.
    version: u64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an ordered sequence. Later duplicates replace
    /// earlier ones in place.
    pub fn from_companies(companies: impl IntoIterator<Item = Company>) -> Self {
        let mut store = Self::new();
        for company in companies {
            store.upsert(company);
        }
        store
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All companies in order. Cloned; the store keeps ownership.
    pub fn all(&self) -> Vec<Company> {
        self.companies.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Company> {
        self.companies.values()
    }

    pub fn get(&self, id: CompanyId) -> Option<&Company> {
        self.companies.get(&id)
    }

    pub fn contains(&self, id: CompanyId) -> bool {
        self.companies.contains_key(&id)
    }

    pub fn position(&self, id: CompanyId) -> Option<usize> {
        self.companies.get_index_of(&id)
    }

    pub fn len(&self) -> usize {
        self.companies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.companies.is_empty()
    }

    /// Change counter for re-render decisions.
    pub fn version(&self) -> u64 {
        self.version
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or replace by id. Replacing keeps the old position.
    pub fn upsert(&mut self, company: Company) -> StoreChange {
        match self.companies.get_mut(&company.id) {
            Some(existing) if *existing == company => StoreChange::Unchanged,
            Some(existing) => {
                trace!("store: replace {:?} {:?} -> {:?}", company.id, existing.name, company.name);
                *existing = company;
                self.bump();
                StoreChange::Replaced
            }
            None => {
                trace!("store: append {:?} {:?}", company.id, company.name);
                self.companies.insert(company.id, company);
                self.bump();
                StoreChange::Inserted
            }
        }
    }

    /// Insert at `index` (clamped to the end) if the id is new, otherwise
    /// behave like [`upsert`](Self::upsert).
    pub fn insert_at(&mut self, index: usize, company: Company) -> StoreChange {
        if self.companies.contains_key(&company.id) {
            return self.upsert(company);
        }
        let index = index.min(self.companies.len());
        trace!("store: insert {:?} at {}", company.id, index);
        self.companies.shift_insert(index, company.id, company);
        self.bump();
        StoreChange::Inserted
    }

    /// Remove by id, keeping the order of the rest. No-op if absent.
    pub fn remove(&mut self, id: CompanyId) -> Option<Company> {
        let removed = self.companies.shift_remove(&id);
        if removed.is_some() {
            trace!("store: remove {:?}", id);
            self.bump();
        }
        removed
    }

    /// Swap the entity under `old` for `company`, in place.
    ///
    /// Used when an add confirms and the placeholder becomes a server id. If
    /// `company.id` is already present elsewhere, `old` is dropped and the
    /// existing entry is updated instead, so the id stays unique. If `old` is
    /// absent this is a plain upsert.
    pub fn replace_id(&mut self, old: CompanyId, company: Company) -> StoreChange {
        if old == company.id {
            return self.upsert(company);
        }
        if self.companies.contains_key(&company.id) {
            self.remove(old);
            return self.upsert(company);
        }
        match self.companies.shift_remove_full(&old) {
            Some((index, _, _)) => {
                trace!("store: {:?} becomes {:?} at {}", old, company.id, index);
                self.companies.shift_insert(index, company.id, company);
                self.bump();
                StoreChange::Replaced
            }
            None => self.upsert(company),
        }
    }

    /// Keep only the entities the predicate accepts.
    pub fn retain(&mut self, mut keep: impl FnMut(&Company) -> bool) -> usize {
        let before = self.companies.len();
        self.companies.retain(|_, c| keep(c));
        let dropped = before - self.companies.len();
        if dropped > 0 {
            self.bump();
        }
        dropped
    }

    fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}
