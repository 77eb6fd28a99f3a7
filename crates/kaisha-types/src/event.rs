//! Server-push events and mutation kinds.
//!
//! The push channel carries exactly two kinds of change: a company was added,
//! or a company was renamed. Deletions are never pushed; other clients'
//! deletes only show up in the next full fetch.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::company::Company;
use crate::ids::CompanyId;

/// A change notification pushed by the server, in receipt order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushEvent {
    /// `companyAdded` subscription payload.
    CompanyAdded { company: Company },
    /// `companyNameChanged` subscription payload.
    CompanyRenamed { id: CompanyId, name: String },
}

impl PushEvent {
    /// The id this event touches.
    pub fn company_id(&self) -> CompanyId {
        match self {
            PushEvent::CompanyAdded { company } => company.id,
            PushEvent::CompanyRenamed { id, .. } => *id,
        }
    }

    /// The entity as it looks after the event.
    pub fn resulting_value(&self) -> Company {
        match self {
            PushEvent::CompanyAdded { company } => company.clone(),
            PushEvent::CompanyRenamed { id, name } => Company::new(*id, name.clone()),
        }
    }
}

/// Kind of local mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum MutationKind {
    Add,
    Rename,
    Delete,
}

impl MutationKind {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Add => "add",
            MutationKind::Rename => "rename",
            MutationKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
