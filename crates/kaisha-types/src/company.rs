//! The `Company` record and input validation.
//!
//! Validation lives here rather than in the cache: a mutation with a bad name
//! or id is rejected before it ever reaches the optimistic ledger.

use serde::{Deserialize, Serialize};

use crate::ids::CompanyId;

/// Longest accepted company name, in characters.
pub const MAX_NAME_LEN: usize = 256;

/// A named entity in the remote collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
}

impl Company {
    pub fn new(id: impl Into<CompanyId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Same id, new name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            id: self.id,
            name: name.into(),
        }
    }
}

/// Malformed mutation input. Never enters the ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("company name is empty")]
    EmptyName,
    #[error("company name is {len} characters, limit is {max}")]
    NameTooLong { len: usize, max: usize },
    #[error("invalid company id {0}")]
    InvalidId(CompanyId),
}

/// Check a name supplied for add or rename.
///
/// Whitespace-only names count as empty.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let len = name.chars().count();
    if len > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong { len, max: MAX_NAME_LEN });
    }
    Ok(())
}

/// Check an id supplied by a caller. Placeholders are allowed only when the
/// caller targets an add that is still in flight, which the cache checks.
pub fn validate_id(id: CompanyId, allow_placeholder: bool) -> Result<(), ValidationError> {
    if id.is_placeholder() && !allow_placeholder {
        return Err(ValidationError::InvalidId(id));
    }
    Ok(())
}
